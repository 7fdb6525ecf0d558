//! Primary-sort merge
//!
//! Every segment is written in primary-sort order, so a view-wide sorted
//! stream is a k-way merge: one head per segment, keyed by its decoded sort
//! record, kept in a min-heap. Documents without a sort record are skipped.
//! Equal keys come out in heap order; no tie-break beyond the configured
//! sort fields is applied.

use crate::filter::Filter;
use crate::iterator::{CountApproximate, Hit, Materializer, PreparedSearch, SearchIterator};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tessera_core::{DocId, Error, FieldValue, PrimarySort, Result};
use tessera_storage::column::decode_record;

#[derive(Debug)]
struct SortOrder {
    sort: PrimarySort,
    buckets: usize,
}

/// Current document of one segment
#[derive(Debug)]
struct Head {
    key: Vec<Option<FieldValue>>,
    segment: usize,
    offset: usize,
    doc: DocId,
    order: Arc<SortOrder>,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the smallest key must surface
        self.order
            .sort
            .compare(&other.key, &self.key, self.order.buckets)
    }
}

/// Iterates matches of every segment in global primary-sort order
#[derive(Debug)]
pub struct MergeIterator {
    prepared: PreparedSearch,
    materializer: Materializer,
    count_approximate: CountApproximate,
    rearmable: bool,
    order: Arc<SortOrder>,
    heap: BinaryHeap<Head>,
    started: bool,
}

impl MergeIterator {
    /// Merge `prepared` by `sort`, comparing the first `buckets` fields
    /// (all of them when `buckets` is zero)
    pub fn new(prepared: PreparedSearch, materializer: Materializer, sort: PrimarySort, buckets: usize) -> Result<Self> {
        if sort.is_empty() {
            return Err(Error::internal("merge iteration requires a primary sort"));
        }
        let buckets = if buckets == 0 { sort.size() } else { buckets.min(sort.size()) };
        Ok(MergeIterator {
            prepared,
            materializer,
            count_approximate: CountApproximate::Exact,
            rearmable: false,
            order: Arc::new(SortOrder { sort, buckets }),
            heap: BinaryHeap::new(),
            started: false,
        })
    }

    /// Counting mode of `skip_all`
    pub fn with_count_approximate(mut self, mode: CountApproximate) -> Self {
        self.count_approximate = mode;
        self
    }

    /// Allow the tail filter to be replaced
    pub fn rearmable(mut self, rearmable: bool) -> Self {
        self.rearmable = rearmable;
        self
    }

    /// Underlying prepared search
    pub fn prepared(&self) -> &PreparedSearch {
        &self.prepared
    }

    /// First match of `segment` at or after `from` that has a sort record
    fn seek(&self, segment: usize, from: usize) -> Result<Option<Head>> {
        let seg = self.prepared.snapshot().segment(segment);
        let matches = self.prepared.matches(segment);
        for (offset, &doc) in matches.iter().enumerate().skip(from) {
            if let Some(record) = seg.sort_record(doc) {
                return Ok(Some(Head {
                    key: decode_record(record, self.order.sort.size())?,
                    segment,
                    offset,
                    doc,
                    order: Arc::clone(&self.order),
                }));
            }
        }
        Ok(None)
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.heap.clear();
        for segment in 0..self.prepared.segment_count() {
            if let Some(head) = self.seek(segment, 0)? {
                self.heap.push(head);
            }
        }
        self.started = true;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<(usize, DocId)>> {
        self.start()?;
        let Some(head) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.seek(head.segment, head.offset + 1)? {
            self.heap.push(next);
        }
        Ok(Some((head.segment, head.doc)))
    }
}

impl SearchIterator for MergeIterator {
    fn next_hits(&mut self, limit: usize, sink: &mut dyn FnMut(Hit)) -> Result<bool> {
        let mut emitted = 0;
        while emitted < limit {
            let Some((segment, doc)) = self.pop()? else {
                break;
            };
            if let Some(hit) = self.materializer.materialize(&self.prepared, segment, doc)? {
                sink(hit);
                emitted += 1;
            }
        }
        self.start()?;
        Ok(!self.heap.is_empty())
    }

    fn skip(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count && self.pop()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    fn skip_all(&mut self) -> Result<u64> {
        if self.count_approximate == CountApproximate::Cost && !self.started {
            self.started = true;
            self.heap.clear();
            return Ok(self.prepared.cost_estimate());
        }
        let mut skipped = 0u64;
        while self.pop()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    fn reset(&mut self) {
        self.started = false;
        self.heap.clear();
    }

    fn can_rearm(&self) -> bool {
        self.rearmable
    }

    fn rearm(&mut self, tail: Filter) -> Result<bool> {
        if !self.rearmable {
            return Ok(false);
        }
        self.prepared.rearm(tail);
        self.reset();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::tests::snapshot_of;
    use serde_json::json;
    use tessera_core::IndexMeta;

    fn meta() -> IndexMeta {
        IndexMeta::from_json(&json!({"primarySort": [{"field": "n", "asc": true}]})).unwrap()
    }

    fn drain(it: &mut MergeIterator) -> Vec<f64> {
        let mut out = Vec::new();
        let prepared_docs: Vec<Hit> = {
            let mut hits = Vec::new();
            while it.next_hits(2, &mut |h| hits.push(h)).unwrap() {}
            hits
        };
        for h in prepared_docs {
            let seg = it.prepared().snapshot().segment(h.segment);
            let key = decode_record(seg.sort_record(h.doc).unwrap(), 1).unwrap();
            out.push(key[0].as_ref().and_then(FieldValue::as_f64).unwrap_or(f64::NAN));
        }
        out
    }

    #[test]
    fn test_merges_segments_in_sort_order() {
        let meta = meta();
        let snap = snapshot_of(
            meta.clone(),
            &[
                vec![json!({"n": 5}), json!({"n": 1}), json!({"n": 9})],
                vec![json!({"n": 4}), json!({"n": 2})],
                vec![json!({"n": 3}), json!({"n": 8})],
            ],
        );
        let prepared = PreparedSearch::prepare(snap, vec![], Filter::all(), vec![], 1).unwrap();
        let mut it = MergeIterator::new(prepared, Materializer::ids(), meta.primary_sort.clone(), 0).unwrap();
        assert_eq!(drain(&mut it), vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0, 9.0]);
        it.reset();
        assert_eq!(it.skip(3).unwrap(), 3);
        assert_eq!(it.skip_all().unwrap(), 4);
    }

    #[test]
    fn test_reset_after_estimated_count() {
        let meta = meta();
        let snap = snapshot_of(meta.clone(), &[vec![json!({"n": 2}), json!({"n": 1})], vec![json!({"n": 3})]]);
        let prepared = PreparedSearch::prepare(snap, vec![], Filter::all(), vec![], 1).unwrap();
        let mut it = MergeIterator::new(prepared, Materializer::ids(), meta.primary_sort.clone(), 0)
            .unwrap()
            .with_count_approximate(CountApproximate::Cost);
        assert_eq!(it.skip_all().unwrap(), 3);
        assert!(drain(&mut it).is_empty());
        it.reset();
        assert_eq!(drain(&mut it), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_descending_sort() {
        let meta = IndexMeta::from_json(&json!({"primarySort": [{"field": "n", "asc": false}]})).unwrap();
        let snap = snapshot_of(meta.clone(), &[vec![json!({"n": 1}), json!({"n": 3})], vec![json!({"n": 2})]]);
        let prepared = PreparedSearch::prepare(snap, vec![], Filter::all(), vec![], 1).unwrap();
        let mut it = MergeIterator::new(prepared, Materializer::ids(), meta.primary_sort.clone(), 1).unwrap();
        assert_eq!(drain(&mut it), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_requires_primary_sort() {
        let snap = snapshot_of(IndexMeta::default(), &[vec![json!({"n": 1})]]);
        let prepared = PreparedSearch::prepare(snap, vec![], Filter::all(), vec![], 1).unwrap();
        let err = MergeIterator::new(prepared, Materializer::ids(), PrimarySort::default(), 0).unwrap_err();
        assert!(err.is_internal());
    }
}
