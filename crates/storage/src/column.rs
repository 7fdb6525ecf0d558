//! Column value codec
//!
//! Sort and stored-value columns keep one record per document. A record is
//! the concatenation of its field values, each prefixed by a LEB128 length:
//!
//! ```text
//! per field:
//!   len_plus_one   varint   0 = field absent
//!   payload        [u8; len]
//! payload:
//!   tag            u8       0 null, 1 false, 2 true, 3 number, 4 string
//!   number         f64 BE   (tag 3)
//!   string         utf-8    (tag 4, rest of payload)
//! ```
//!
//! [`record_field`] reaches field `n` by hopping over length prefixes, so
//! earlier fields are never decoded.

use byteorder::{BigEndian, ByteOrder};
use tessera_core::{Error, FieldValue, Result};

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

// ============================================================================
// Varint (LEB128) Codec
// ============================================================================

/// Encode a u32 as a variable-length integer (LEB128).
pub fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from a byte slice, returning (value, bytes_consumed).
pub fn decode_varint(data: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift >= 35 {
            return None; // overflow
        }
    }
    None // truncated
}

// ============================================================================
// Values
// ============================================================================

/// Append the encoded form of `value`
pub fn encode_value(value: &FieldValue, buf: &mut Vec<u8>) {
    match value {
        FieldValue::Null => buf.push(TAG_NULL),
        FieldValue::Bool(false) => buf.push(TAG_FALSE),
        FieldValue::Bool(true) => buf.push(TAG_TRUE),
        FieldValue::Number(n) => {
            buf.push(TAG_NUMBER);
            let mut raw = [0u8; 8];
            BigEndian::write_f64(&mut raw, *n);
            buf.extend_from_slice(&raw);
        }
        FieldValue::String(s) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

/// Decode a payload produced by [`encode_value`]
pub fn decode_value(payload: &[u8]) -> Result<FieldValue> {
    let (&tag, rest) = payload
        .split_first()
        .ok_or_else(|| Error::corruption("empty column value"))?;
    match tag {
        TAG_NULL => Ok(FieldValue::Null),
        TAG_FALSE => Ok(FieldValue::Bool(false)),
        TAG_TRUE => Ok(FieldValue::Bool(true)),
        TAG_NUMBER if rest.len() == 8 => Ok(FieldValue::Number(BigEndian::read_f64(rest))),
        TAG_STRING => std::str::from_utf8(rest)
            .map(|s| FieldValue::String(s.to_string()))
            .map_err(|e| Error::corruption(format!("invalid utf-8 in column value: {}", e))),
        _ => Err(Error::corruption(format!("bad column value tag {}", tag))),
    }
}

// ============================================================================
// Records
// ============================================================================

/// Encode one document's column record
pub fn encode_record(values: &[Option<FieldValue>]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut payload = Vec::new();
    for v in values {
        match v {
            None => encode_varint(0, &mut buf),
            Some(v) => {
                payload.clear();
                encode_value(v, &mut payload);
                encode_varint(payload.len() as u32 + 1, &mut buf);
                buf.extend_from_slice(&payload);
            }
        }
    }
    buf
}

/// Raw payload of field `index` inside `record`, `None` when absent
pub fn record_slice(record: &[u8], index: usize) -> Result<Option<&[u8]>> {
    let mut pos = 0;
    let mut field = 0;
    loop {
        if pos >= record.len() {
            return Ok(None);
        }
        let (len_plus_one, n) = decode_varint(&record[pos..])
            .ok_or_else(|| Error::corruption("truncated column record"))?;
        pos += n;
        let len = len_plus_one.saturating_sub(1) as usize;
        if field == index {
            if len_plus_one == 0 {
                return Ok(None);
            }
            let end = pos + len;
            if end > record.len() {
                return Err(Error::corruption("column value overruns record"));
            }
            return Ok(Some(&record[pos..end]));
        }
        pos += len;
        field += 1;
    }
}

/// Decode field `index` of `record`
pub fn record_field(record: &[u8], index: usize) -> Result<Option<FieldValue>> {
    match record_slice(record, index)? {
        Some(payload) => decode_value(payload).map(Some),
        None => Ok(None),
    }
}

/// Decode the first `count` fields of `record`
pub fn decode_record(record: &[u8], count: usize) -> Result<Vec<Option<FieldValue>>> {
    let mut out = Vec::with_capacity(count);
    let mut pos = 0;
    for _ in 0..count {
        if pos >= record.len() {
            out.push(None);
            continue;
        }
        let (len_plus_one, n) = decode_varint(&record[pos..])
            .ok_or_else(|| Error::corruption("truncated column record"))?;
        pos += n;
        if len_plus_one == 0 {
            out.push(None);
            continue;
        }
        let end = pos + len_plus_one as usize - 1;
        if end > record.len() {
            return Err(Error::corruption("column value overruns record"));
        }
        out.push(Some(decode_value(&record[pos..end])?));
        pos = end;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding_size() {
        let mut buf = Vec::new();
        encode_varint(127, &mut buf);
        assert_eq!(buf.len(), 1);
        buf.clear();
        encode_varint(128, &mut buf);
        assert_eq!(buf.len(), 2);
        buf.clear();
        encode_varint(u32::MAX, &mut buf);
        assert_eq!(buf.len(), 5);
        assert_eq!(decode_varint(&buf), Some((u32::MAX, 5)));
    }

    #[test]
    fn test_varint_truncated() {
        assert_eq!(decode_varint(&[0x80]), None);
        assert_eq!(decode_varint(&[]), None);
    }

    #[test]
    fn test_record_random_access() {
        let values = vec![
            Some(FieldValue::from("alpha")),
            None,
            Some(FieldValue::from(42i64)),
            Some(FieldValue::from(true)),
        ];
        let record = encode_record(&values);
        assert_eq!(record_field(&record, 2).unwrap(), Some(FieldValue::from(42i64)));
        assert_eq!(record_field(&record, 1).unwrap(), None);
        assert_eq!(record_field(&record, 0).unwrap(), Some(FieldValue::from("alpha")));
        assert_eq!(record_field(&record, 9).unwrap(), None);
        assert_eq!(decode_record(&record, 4).unwrap(), values);
    }

    #[test]
    fn test_decode_rejects_bad_tag() {
        assert!(decode_value(&[9]).is_err());
        assert!(decode_value(&[]).is_err());
        assert!(decode_value(&[TAG_NUMBER, 1, 2]).is_err());
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let mut record = encode_record(&[Some(FieldValue::from("long string value"))]);
        record.truncate(4);
        assert!(record_field(&record, 0).is_err());
    }
}
