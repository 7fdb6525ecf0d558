//! Immutable index segments
//!
//! A segment holds a fixed set of documents, numbered `0..doc_count` in
//! primary-sort order. Per document it keeps the primary key, a norm (number
//! of indexed terms), the encoded sort-column record and one record per
//! stored-value column. Per indexed field it keeps a term dictionary mapping
//! each [`FieldValue`] to a sorted posting list.
//!
//! Deletions never touch the segment itself: a [`Segment`] pairs the shared
//! immutable [`SegmentCore`] with a roaring deletion mask, and a removal
//! produces a new `Segment` with a larger mask.
//!
//! ## File Format
//!
//! ```text
//! magic "TSEG"     4B
//! version          u32 LE
//! crc32            u32 LE   (of payload)
//! payload          MessagePack(SegmentFile)
//! ```
//! Posting lists inside the payload are delta-encoded varints.

use crate::column::{decode_record, decode_varint, encode_record, encode_varint};
use byteorder::{ByteOrder, LittleEndian};
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use tessera_core::value::{flatten, join_path, scalar_at};
use tessera_core::{DocId, Error, FieldValue, IndexMeta, LocalDocumentId, Result};

/// Magic bytes for segment files
const SEGMENT_MAGIC: &[u8; 4] = b"TSEG";
/// Current format version
const SEGMENT_VERSION: u32 = 1;
/// Header size in bytes
const HEADER_SIZE: usize = 12;

/// Term dictionary of one field
pub type TermDictionary = BTreeMap<FieldValue, Vec<DocId>>;

// ============================================================================
// SegmentCore
// ============================================================================

/// The immutable content of a segment
#[derive(Debug)]
pub struct SegmentCore {
    id: u64,
    pks: Vec<LocalDocumentId>,
    pk_index: FxHashMap<LocalDocumentId, DocId>,
    norms: Vec<u32>,
    fields: FxHashMap<String, TermDictionary>,
    sort_column: Vec<Option<Vec<u8>>>,
    stored_columns: Vec<Vec<Option<Vec<u8>>>>,
    size_bytes: u64,
}

impl SegmentCore {
    fn assemble(
        id: u64,
        pks: Vec<LocalDocumentId>,
        norms: Vec<u32>,
        fields: FxHashMap<String, TermDictionary>,
        sort_column: Vec<Option<Vec<u8>>>,
        stored_columns: Vec<Vec<Option<Vec<u8>>>>,
    ) -> Self {
        let pk_index = pks
            .iter()
            .enumerate()
            .map(|(doc, pk)| (*pk, doc as DocId))
            .collect();
        let column_bytes = |col: &[Option<Vec<u8>>]| -> u64 {
            col.iter().map(|r| r.as_ref().map_or(1, |r| r.len() as u64)).sum()
        };
        let posting_bytes: u64 = fields
            .values()
            .flat_map(|dict| dict.values())
            .map(|p| 8 + p.len() as u64 * 2)
            .sum();
        let size_bytes = pks.len() as u64 * 12
            + posting_bytes
            + column_bytes(&sort_column)
            + stored_columns.iter().map(|c| column_bytes(c)).sum::<u64>();
        SegmentCore {
            id,
            pks,
            pk_index,
            norms,
            fields,
            sort_column,
            stored_columns,
            size_bytes,
        }
    }

    /// Segment id, unique within a data store
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of documents, deleted ones included
    pub fn doc_count(&self) -> u32 {
        self.pks.len() as u32
    }

    /// Approximate in-memory/on-disk size
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Serialize into the segment file format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut fields: Vec<(String, Vec<(FieldValue, Vec<u8>)>)> = self
            .fields
            .iter()
            .map(|(name, dict)| {
                let terms = dict
                    .iter()
                    .map(|(term, docs)| (term.clone(), encode_postings(docs)))
                    .collect();
                (name.clone(), terms)
            })
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let file = SegmentFile {
            id: self.id,
            pks: self.pks.iter().map(|pk| pk.get()).collect(),
            norms: self.norms.clone(),
            fields,
            sort_column: self.sort_column.clone(),
            stored_columns: self.stored_columns.clone(),
        };
        let payload = rmp_serde::to_vec(&file)
            .map_err(|e| Error::serialization(format!("segment encode error: {}", e)))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(SEGMENT_MAGIC);
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], SEGMENT_VERSION);
        LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(&payload));
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Parse a segment file, validating magic, version and checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corruption("segment file too small"));
        }
        if &data[0..4] != SEGMENT_MAGIC {
            return Err(Error::corruption("bad segment magic"));
        }
        let version = LittleEndian::read_u32(&data[4..8]);
        if version != SEGMENT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let crc = LittleEndian::read_u32(&data[8..12]);
        let payload = &data[HEADER_SIZE..];
        if crc32fast::hash(payload) != crc {
            return Err(Error::corruption("segment checksum mismatch"));
        }
        let file: SegmentFile = rmp_serde::from_slice(payload)
            .map_err(|e| Error::corruption(format!("segment decode error: {}", e)))?;

        let doc_count = file.pks.len();
        if file.norms.len() != doc_count {
            return Err(Error::corruption("segment norms do not match document count"));
        }
        let mut fields = FxHashMap::default();
        for (name, terms) in file.fields {
            let mut dict = TermDictionary::new();
            for (term, encoded) in terms {
                let docs = decode_postings(&encoded)
                    .ok_or_else(|| Error::corruption("malformed posting list"))?;
                if docs.iter().any(|d| *d as usize >= doc_count) {
                    return Err(Error::corruption("posting references unknown document"));
                }
                dict.insert(term, docs);
            }
            fields.insert(name, dict);
        }
        Ok(SegmentCore::assemble(
            file.id,
            file.pks.into_iter().map(LocalDocumentId).collect(),
            file.norms,
            fields,
            file.sort_column,
            file.stored_columns,
        ))
    }
}

#[derive(Serialize, Deserialize)]
struct SegmentFile {
    id: u64,
    pks: Vec<u64>,
    norms: Vec<u32>,
    fields: Vec<(String, Vec<(FieldValue, Vec<u8>)>)>,
    sort_column: Vec<Option<Vec<u8>>>,
    stored_columns: Vec<Vec<Option<Vec<u8>>>>,
}

/// Delta-encode a sorted posting list
fn encode_postings(docs: &[DocId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(docs.len() + 4);
    encode_varint(docs.len() as u32, &mut buf);
    let mut prev = 0;
    for &doc in docs {
        encode_varint(doc - prev, &mut buf);
        prev = doc;
    }
    buf
}

fn decode_postings(data: &[u8]) -> Option<Vec<DocId>> {
    let (count, mut pos) = decode_varint(data)?;
    let mut out = Vec::with_capacity(count as usize);
    let mut prev = 0u32;
    for _ in 0..count {
        let (delta, n) = decode_varint(&data[pos..])?;
        pos += n;
        prev = prev.checked_add(delta)?;
        out.push(prev);
    }
    Some(out)
}

// ============================================================================
// Segment (core + deletion mask)
// ============================================================================

/// A segment as seen by one snapshot: shared core plus deletion mask
#[derive(Debug, Clone)]
pub struct Segment {
    core: Arc<SegmentCore>,
    deleted: Arc<RoaringBitmap>,
}

impl Segment {
    /// Wrap a freshly built core with no deletions
    pub fn new(core: Arc<SegmentCore>) -> Self {
        Segment {
            core,
            deleted: Arc::new(RoaringBitmap::new()),
        }
    }

    /// Same core, different deletion mask
    pub fn with_deletions(&self, deleted: RoaringBitmap) -> Self {
        Segment {
            core: Arc::clone(&self.core),
            deleted: Arc::new(deleted),
        }
    }

    /// Shared immutable content
    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    /// Segment id
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Number of documents, deleted ones included
    pub fn doc_count(&self) -> u32 {
        self.core.doc_count()
    }

    /// Number of documents not deleted
    pub fn live_doc_count(&self) -> u32 {
        self.core.doc_count() - self.deleted.len() as u32
    }

    /// Approximate size, scaled by the live fraction
    pub fn live_size_bytes(&self) -> u64 {
        let docs = self.doc_count().max(1) as u64;
        self.core.size_bytes * self.live_doc_count() as u64 / docs
    }

    /// Deletion mask
    pub fn deleted(&self) -> &RoaringBitmap {
        &self.deleted
    }

    /// True when `doc` has been removed
    pub fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted.contains(doc)
    }

    /// Bitmap of every live document
    pub fn live_docs(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        all.insert_range(0..self.doc_count());
        all - &*self.deleted
    }

    /// Primary key of `doc`
    pub fn pk(&self, doc: DocId) -> Option<LocalDocumentId> {
        self.core.pks.get(doc as usize).copied()
    }

    /// Document number for a primary key, deleted or not
    pub fn find_pk(&self, pk: LocalDocumentId) -> Option<DocId> {
        self.core.pk_index.get(&pk).copied()
    }

    /// Number of indexed terms in `doc`
    pub fn norm(&self, doc: DocId) -> u32 {
        self.core.norms.get(doc as usize).copied().unwrap_or(0)
    }

    /// Term dictionary of a field (dotted path)
    pub fn field(&self, field: &str) -> Option<&TermDictionary> {
        self.core.fields.get(field)
    }

    /// Every indexed field with its term dictionary, in no particular order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &TermDictionary)> {
        self.core.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Posting list of one term, deleted documents included
    pub fn postings(&self, field: &str, term: &FieldValue) -> &[DocId] {
        self.field(field)
            .and_then(|dict| dict.get(term))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterate terms of a field inside a value range
    pub fn terms_in_range<'a, R>(&'a self, field: &str, range: R) -> impl Iterator<Item = (&'a FieldValue, &'a [DocId])> + 'a
    where
        R: RangeBounds<FieldValue> + 'a,
    {
        let start = clone_bound(range.start_bound());
        let end = clone_bound(range.end_bound());
        let dict = self.core.fields.get(field);
        let valid = match (&start, &end) {
            (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => {
                s < e || (s == e && matches!((&start, &end), (Bound::Included(_), Bound::Included(_))))
            }
            _ => true,
        };
        dict.filter(|_| valid)
            .into_iter()
            .flat_map(move |d| d.range((start.clone(), end.clone())))
            .map(|(k, v)| (k, v.as_slice()))
    }

    /// Encoded sort-column record of `doc`
    pub fn sort_record(&self, doc: DocId) -> Option<&[u8]> {
        self.core
            .sort_column
            .get(doc as usize)
            .and_then(|r| r.as_deref())
    }

    /// Encoded record of stored column `column` for `doc`
    pub fn stored_record(&self, column: usize, doc: DocId) -> Option<&[u8]> {
        self.core
            .stored_columns
            .get(column)
            .and_then(|c| c.get(doc as usize))
            .and_then(|r| r.as_deref())
    }

    /// Number of stored columns written into this segment
    pub fn stored_column_count(&self) -> usize {
        self.core.stored_columns.len()
    }
}

fn clone_bound(b: Bound<&FieldValue>) -> Bound<FieldValue> {
    match b {
        Bound::Included(v) => Bound::Included(v.clone()),
        Bound::Excluded(v) => Bound::Excluded(v.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

// ============================================================================
// Building
// ============================================================================

struct PendingDoc {
    pk: LocalDocumentId,
    sort_key: Vec<Option<FieldValue>>,
    terms: Vec<(String, FieldValue)>,
    stored: Vec<Option<Vec<u8>>>,
}

/// Accumulates documents and produces a sorted [`SegmentCore`]
pub struct SegmentBuilder {
    meta: Arc<IndexMeta>,
    docs: Vec<PendingDoc>,
}

impl SegmentBuilder {
    /// Create a builder for an index definition
    pub fn new(meta: Arc<IndexMeta>) -> Self {
        SegmentBuilder {
            meta,
            docs: Vec::new(),
        }
    }

    /// Number of buffered documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Index one document
    pub fn add(&mut self, pk: LocalDocumentId, doc: &Value) {
        let sort_key = self
            .meta
            .primary_sort
            .fields()
            .iter()
            .map(|f| scalar_at(doc, &f.path))
            .collect();
        let mut terms: Vec<(String, FieldValue)> = flatten(doc)
            .into_iter()
            .filter(|(path, _)| self.meta.is_indexed(path))
            .map(|(path, value)| (join_path(&path), value))
            .collect();
        terms.sort();
        terms.dedup();
        let stored = self
            .meta
            .stored_values
            .columns()
            .iter()
            .map(|col| {
                let values: Vec<Option<FieldValue>> =
                    col.fields.iter().map(|path| scalar_at(doc, path)).collect();
                Some(encode_record(&values))
            })
            .collect();
        self.docs.push(PendingDoc {
            pk,
            sort_key,
            terms,
            stored,
        });
    }

    /// Sort buffered documents by the primary sort and freeze them
    pub fn build(mut self, id: u64) -> SegmentCore {
        let sort = &self.meta.primary_sort;
        let buckets = sort.size();
        if buckets > 0 {
            self.docs
                .sort_by(|a, b| sort.compare(&a.sort_key, &b.sort_key, buckets));
        }
        let has_sort = buckets > 0;

        let mut pks = Vec::with_capacity(self.docs.len());
        let mut norms = Vec::with_capacity(self.docs.len());
        let mut fields: FxHashMap<String, TermDictionary> = FxHashMap::default();
        let mut sort_column = Vec::new();
        let mut stored_columns: Vec<Vec<Option<Vec<u8>>>> =
            vec![Vec::with_capacity(self.docs.len()); self.meta.stored_values.columns().len()];

        for (doc_id, doc) in self.docs.into_iter().enumerate() {
            let doc_id = doc_id as DocId;
            pks.push(doc.pk);
            norms.push(doc.terms.len() as u32);
            for (field, term) in doc.terms {
                fields
                    .entry(field)
                    .or_default()
                    .entry(term)
                    .or_default()
                    .push(doc_id);
            }
            if has_sort {
                sort_column.push(Some(encode_record(&doc.sort_key)));
            }
            for (col, record) in stored_columns.iter_mut().zip(doc.stored) {
                col.push(record);
            }
        }
        SegmentCore::assemble(id, pks, norms, fields, sort_column, stored_columns)
    }
}

/// Merge the live documents of `segments` into one new sorted core.
///
/// Postings, norms and column records are carried over without access to
/// the original documents.
pub fn merge_segments(meta: &IndexMeta, segments: &[Segment], id: u64) -> Result<SegmentCore> {
    let sort = &meta.primary_sort;
    let buckets = sort.size();

    let mut order: Vec<(usize, DocId, Vec<Option<FieldValue>>)> = Vec::new();
    for (seg_idx, seg) in segments.iter().enumerate() {
        for doc in seg.live_docs().iter() {
            let key = match (buckets, seg.sort_record(doc)) {
                (0, _) | (_, None) => Vec::new(),
                (n, Some(record)) => decode_record(record, n)?,
            };
            order.push((seg_idx, doc, key));
        }
    }
    if buckets > 0 {
        order.sort_by(|a, b| sort.compare(&a.2, &b.2, buckets));
    }

    let mut remap: Vec<Vec<Option<DocId>>> = segments
        .iter()
        .map(|s| vec![None; s.doc_count() as usize])
        .collect();
    let mut pks = Vec::with_capacity(order.len());
    let mut norms = Vec::with_capacity(order.len());
    let mut sort_column = Vec::new();
    let columns = meta.stored_values.columns().len();
    let mut stored_columns: Vec<Vec<Option<Vec<u8>>>> = vec![Vec::with_capacity(order.len()); columns];

    for (new_doc, (seg_idx, doc, _)) in order.iter().enumerate() {
        let seg = &segments[*seg_idx];
        remap[*seg_idx][*doc as usize] = Some(new_doc as DocId);
        pks.push(seg.pk(*doc).ok_or_else(|| Error::internal("document without primary key"))?);
        norms.push(seg.norm(*doc));
        if buckets > 0 {
            sort_column.push(seg.sort_record(*doc).map(<[u8]>::to_vec));
        }
        for (col, out) in stored_columns.iter_mut().enumerate() {
            out.push(seg.stored_record(col, *doc).map(<[u8]>::to_vec));
        }
    }

    let mut fields: FxHashMap<String, TermDictionary> = FxHashMap::default();
    for (seg_idx, seg) in segments.iter().enumerate() {
        for (name, dict) in &seg.core.fields {
            for (term, docs) in dict {
                let mapped = docs.iter().filter_map(|d| remap[seg_idx][*d as usize]);
                let target = fields
                    .entry(name.clone())
                    .or_default()
                    .entry(term.clone())
                    .or_default();
                target.extend(mapped);
            }
        }
    }
    for dict in fields.values_mut() {
        dict.retain(|_, docs| !docs.is_empty());
        for docs in dict.values_mut() {
            docs.sort_unstable();
        }
    }
    fields.retain(|_, dict| !dict.is_empty());

    Ok(SegmentCore::assemble(id, pks, norms, fields, sort_column, stored_columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::record_field;
    use serde_json::json;

    fn sorted_meta() -> Arc<IndexMeta> {
        Arc::new(
            IndexMeta::from_json(&json!({
                "primarySort": [{"field": "rank", "asc": true}],
                "storedValues": [["name"]]
            }))
            .unwrap(),
        )
    }

    fn build(meta: &Arc<IndexMeta>, id: u64, docs: &[(u64, Value)]) -> Segment {
        let mut b = SegmentBuilder::new(Arc::clone(meta));
        for (pk, doc) in docs {
            b.add(LocalDocumentId(*pk), doc);
        }
        Segment::new(Arc::new(b.build(id)))
    }

    #[test]
    fn test_builder_orders_by_primary_sort() {
        let meta = sorted_meta();
        let seg = build(
            &meta,
            1,
            &[
                (10, json!({"rank": 3, "name": "c"})),
                (11, json!({"rank": 1, "name": "a"})),
                (12, json!({"rank": 2, "name": "b"})),
            ],
        );
        assert_eq!(seg.pk(0), Some(LocalDocumentId(11)));
        assert_eq!(seg.pk(2), Some(LocalDocumentId(10)));
        assert_eq!(seg.find_pk(LocalDocumentId(12)), Some(1));
        let name = record_field(seg.stored_record(0, 1).unwrap(), 0).unwrap();
        assert_eq!(name, Some(FieldValue::from("b")));
    }

    #[test]
    fn test_postings_and_ranges() {
        let meta = sorted_meta();
        let seg = build(
            &meta,
            1,
            &[
                (1, json!({"rank": 1, "tag": "x"})),
                (2, json!({"rank": 2, "tag": "y"})),
                (3, json!({"rank": 3, "tag": "x"})),
            ],
        );
        assert_eq!(seg.postings("tag", &FieldValue::from("x")), &[0, 2]);
        let hits: Vec<_> = seg
            .terms_in_range("rank", FieldValue::from(2i64)..)
            .flat_map(|(_, d)| d.iter().copied())
            .collect();
        assert_eq!(hits, vec![1, 2]);
        assert_eq!(seg.norm(0), 2);
    }

    #[test]
    fn test_empty_range_yields_nothing() {
        let meta = sorted_meta();
        let seg = build(&meta, 1, &[(1, json!({"rank": 1}))]);
        let inverted = (Bound::Included(FieldValue::from(5i64)), Bound::Excluded(FieldValue::from(1i64)));
        assert_eq!(seg.terms_in_range("rank", inverted).count(), 0);
    }

    #[test]
    fn test_deletion_mask_is_per_view() {
        let meta = sorted_meta();
        let seg = build(&meta, 1, &[(1, json!({"rank": 1})), (2, json!({"rank": 2}))]);
        let mut mask = RoaringBitmap::new();
        mask.insert(0);
        let trimmed = seg.with_deletions(mask);
        assert_eq!(seg.live_doc_count(), 2);
        assert_eq!(trimmed.live_doc_count(), 1);
        assert!(trimmed.is_deleted(0));
        assert_eq!(trimmed.live_docs().iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_file_roundtrip() {
        let meta = sorted_meta();
        let seg = build(
            &meta,
            7,
            &[(1, json!({"rank": 2, "name": "b"})), (2, json!({"rank": 1, "name": "a"}))],
        );
        let bytes = seg.core().to_bytes().unwrap();
        let loaded = Segment::new(Arc::new(SegmentCore::from_bytes(&bytes).unwrap()));
        assert_eq!(loaded.id(), 7);
        assert_eq!(loaded.doc_count(), 2);
        assert_eq!(loaded.pk(0), Some(LocalDocumentId(2)));
        assert_eq!(loaded.postings("name", &FieldValue::from("b")), &[1]);
        assert_eq!(loaded.sort_record(1), seg.sort_record(1));
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let meta = sorted_meta();
        let seg = build(&meta, 1, &[(1, json!({"rank": 1}))]);
        let mut bytes = seg.core().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(SegmentCore::from_bytes(&bytes).is_err());
        assert!(SegmentCore::from_bytes(b"XXXX").is_err());
    }

    #[test]
    fn test_merge_drops_deleted_and_resorts() {
        let meta = sorted_meta();
        let a = build(&meta, 1, &[(1, json!({"rank": 1, "t": "a"})), (2, json!({"rank": 4, "t": "b"}))]);
        let b = build(&meta, 2, &[(3, json!({"rank": 2, "t": "a"})), (4, json!({"rank": 3, "t": "c"}))]);
        let mut mask = RoaringBitmap::new();
        mask.insert(1);
        let b = b.with_deletions(mask);

        let merged = Segment::new(Arc::new(merge_segments(&meta, &[a, b], 3).unwrap()));
        assert_eq!(merged.doc_count(), 3);
        let pks: Vec<_> = (0..3).map(|d| merged.pk(d).unwrap().get()).collect();
        assert_eq!(pks, vec![1, 3, 2]);
        assert_eq!(merged.postings("t", &FieldValue::from("a")), &[0, 1]);
        assert!(merged.field("t").unwrap().get(&FieldValue::from("c")).is_none());
    }
}
