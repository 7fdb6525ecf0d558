//! Covering projections
//!
//! Values served straight from the index columns instead of the document.
//! Every column of a segment (the primary-sort column first, if the index
//! has a primary sort, then each stored-value column) holds one encoded
//! record per document. Logical field numbers run over all columns in that
//! order; a prefix-sum table maps a logical number back to its column and
//! the field position inside the column's record.

use tessera_core::{DocId, Error, FieldValue, IndexMeta, Result};
use tessera_storage::column::record_field;
use tessera_storage::Segment;

/// Column number of the primary-sort column
pub const SORT_COLUMN: isize = -1;

/// Encoded record of `column` for `doc`
pub fn column_record(seg: &Segment, column: isize, doc: DocId) -> Option<&[u8]> {
    if column == SORT_COLUMN {
        seg.sort_record(doc)
    } else {
        usize::try_from(column)
            .ok()
            .and_then(|c| seg.stored_record(c, doc))
    }
}

/// Decode one field of one column for `doc`
pub fn column_value(seg: &Segment, column: isize, field: usize, doc: DocId) -> Result<Option<FieldValue>> {
    match column_record(seg, column, doc) {
        Some(record) => record_field(record, field),
        None => Ok(None),
    }
}

/// Field layout of an index's columns plus the fields one query reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveringProjection {
    columns: Vec<isize>,
    prefix: Vec<usize>,
    requested: Vec<usize>,
}

impl CoveringProjection {
    /// Layout of every column of `meta`, with nothing requested
    pub fn new(meta: &IndexMeta) -> Self {
        let mut columns = Vec::new();
        let mut prefix = vec![0];
        if !meta.primary_sort.is_empty() {
            columns.push(SORT_COLUMN);
            prefix.push(meta.primary_sort.size());
        }
        for (i, col) in meta.stored_values.columns().iter().enumerate() {
            columns.push(i as isize);
            let last = prefix.last().copied().unwrap_or(0);
            prefix.push(last + col.fields.len());
        }
        CoveringProjection {
            columns,
            prefix,
            requested: Vec::new(),
        }
    }

    /// Layout of `meta` reading the given `(column, field)` pairs
    pub fn with_requests(meta: &IndexMeta, requests: &[(isize, usize)]) -> Result<Self> {
        let mut p = Self::new(meta);
        for &(column, field) in requests {
            let logical = p.logical_index(column, field).ok_or_else(|| {
                Error::bad_parameter(format!(
                    "stored value reference out of range: column {}, field {}",
                    column, field
                ))
            })?;
            p.requested.push(logical);
        }
        Ok(p)
    }

    /// Total number of fields over all columns
    pub fn field_count(&self) -> usize {
        self.prefix.last().copied().unwrap_or(0)
    }

    /// Logical numbers of the requested fields, in request order
    pub fn requests(&self) -> &[usize] {
        &self.requested
    }

    /// Logical number of `field` inside `column`
    pub fn logical_index(&self, column: isize, field: usize) -> Option<usize> {
        let pos = self.columns.iter().position(|c| *c == column)?;
        let start = self.prefix[pos];
        (start + field < self.prefix[pos + 1]).then_some(start + field)
    }

    /// Column and field position of a logical number
    pub fn resolve(&self, logical: usize) -> Option<(isize, usize)> {
        if logical >= self.field_count() {
            return None;
        }
        // First column whose end lies past `logical`
        let pos = self.prefix[1..].partition_point(|end| *end <= logical);
        Some((self.columns[pos], logical - self.prefix[pos]))
    }

    /// Value of one logical field for `doc`
    pub fn value(&self, seg: &Segment, doc: DocId, logical: usize) -> Result<Option<FieldValue>> {
        match self.resolve(logical) {
            Some((column, field)) => column_value(seg, column, field, doc),
            None => Ok(None),
        }
    }

    /// Values of every requested field for `doc`, in request order.
    ///
    /// Each column record is looked up once per document.
    pub fn project(&self, seg: &Segment, doc: DocId) -> Result<Vec<Option<FieldValue>>> {
        let mut out = Vec::with_capacity(self.requested.len());
        let mut cached: Option<(isize, Option<&[u8]>)> = None;
        for &logical in &self.requested {
            let Some((column, field)) = self.resolve(logical) else {
                out.push(None);
                continue;
            };
            let record = match cached {
                Some((c, r)) if c == column => r,
                _ => {
                    let r = column_record(seg, column, doc);
                    cached = Some((column, r));
                    r
                }
            };
            out.push(match record {
                Some(r) => record_field(r, field)?,
                None => None,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::LocalDocumentId;
    use tessera_storage::SegmentBuilder;

    fn meta() -> IndexMeta {
        IndexMeta::from_json(&json!({
            "primarySort": [{"field": "name", "asc": true}, {"field": "n", "asc": false}],
            "storedValues": [["a", "b"], ["c"]],
        }))
        .unwrap()
    }

    #[test]
    fn test_layout_and_resolve() {
        let p = CoveringProjection::new(&meta());
        assert_eq!(p.field_count(), 5);
        assert_eq!(p.resolve(0), Some((SORT_COLUMN, 0)));
        assert_eq!(p.resolve(1), Some((SORT_COLUMN, 1)));
        assert_eq!(p.resolve(2), Some((0, 0)));
        assert_eq!(p.resolve(3), Some((0, 1)));
        assert_eq!(p.resolve(4), Some((1, 0)));
        assert_eq!(p.resolve(5), None);
        assert_eq!(p.logical_index(1, 0), Some(4));
        assert_eq!(p.logical_index(1, 1), None);
        assert_eq!(p.logical_index(SORT_COLUMN, 1), Some(1));
    }

    #[test]
    fn test_layout_without_sort() {
        let meta = IndexMeta::from_json(&json!({"storedValues": [["x"]]})).unwrap();
        let p = CoveringProjection::new(&meta);
        assert_eq!(p.resolve(0), Some((0, 0)));
        assert!(p.logical_index(SORT_COLUMN, 0).is_none());
        assert!(CoveringProjection::with_requests(&meta, &[(SORT_COLUMN, 0)])
            .unwrap_err()
            .is_bad_parameter());
    }

    #[test]
    fn test_project_reads_columns() {
        let meta = Arc::new(meta());
        let mut b = SegmentBuilder::new(Arc::clone(&meta));
        b.add(LocalDocumentId(1), &json!({"name": "x", "n": 1, "a": "A", "b": 2, "c": true}));
        let seg = Segment::new(Arc::new(b.build(1)));
        let p = CoveringProjection::with_requests(&meta, &[(1, 0), (SORT_COLUMN, 0), (0, 1), (0, 0)]).unwrap();
        let values = p.project(&seg, 0).unwrap();
        assert_eq!(
            values,
            vec![
                Some(FieldValue::Bool(true)),
                Some(FieldValue::from("x")),
                Some(FieldValue::Number(2.0)),
                Some(FieldValue::from("A")),
            ]
        );
        assert_eq!(p.value(&seg, 0, 1).unwrap(), Some(FieldValue::Number(1.0)));
    }
}
