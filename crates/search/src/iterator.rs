//! Retrieval iterators
//!
//! This module provides:
//! - PreparedSearch: a filter bound to a view snapshot, evaluated per segment
//! - Materializer: turns a matching (segment, doc) into a [`Hit`]
//! - SearchIterator: the pull contract consumed by the query executor
//! - RetrievalIterator: segment-order iteration
//!
//! The filter is split into immutable parts, prepared once, and a tail that
//! may be swapped by [`SearchIterator::rearm`] without touching the rest.
//! Per-segment matches are computed eagerly when the search is prepared,
//! optionally on a dedicated thread pool.

use crate::catalog::DocumentReader;
use crate::covering::CoveringProjection;
use crate::filter::Filter;
use crate::scorer::{DocStats, Scorer, ScorerContext};
use crate::view_snapshot::ViewSnapshot;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use serde_json::Value;
use smallvec::SmallVec;
use std::sync::Arc;
use tessera_core::{DataSourceId, DocId, Error, FieldValue, LocalDocumentId, Result};
use tracing::{debug, trace};

// ============================================================================
// Hits
// ============================================================================

/// What a hit carries besides its identity
#[derive(Debug, Clone, PartialEq)]
pub enum HitPayload {
    /// Identity only
    None,
    /// The full document
    Document(Value),
    /// Requested covering values, in request order
    Covering(Vec<Option<FieldValue>>),
}

/// One matching document
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// Flat segment position inside the view snapshot
    pub segment: usize,
    /// Document number inside the segment
    pub doc: DocId,
    /// Collection the document belongs to
    pub source: DataSourceId,
    /// Primary key, when requested
    pub pk: Option<LocalDocumentId>,
    /// One score per scorer, in scorer order
    pub scores: SmallVec<[f32; 2]>,
    /// Materialized content
    pub payload: HitPayload,
}

/// How matches are materialized
#[derive(Debug, Clone, PartialEq)]
pub enum ReadShape {
    /// Identity only (late materialization)
    Ids,
    /// Full documents read from the collection
    Documents,
    /// Values served from index columns
    Covering(CoveringProjection),
}

/// How `skip_all` counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountApproximate {
    /// Iterate and count every match
    #[default]
    Exact,
    /// Return the filter cost estimate
    Cost,
}

impl CountApproximate {
    /// Option value
    pub fn as_str(self) -> &'static str {
        match self {
            CountApproximate::Exact => "exact",
            CountApproximate::Cost => "cost",
        }
    }

    /// Parse an option value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(CountApproximate::Exact),
            "cost" => Some(CountApproximate::Cost),
            _ => None,
        }
    }
}

// ============================================================================
// PreparedSearch
// ============================================================================

/// A filter prepared against every segment of a view snapshot
pub struct PreparedSearch {
    snapshot: Arc<ViewSnapshot>,
    immutable: Vec<Filter>,
    immutable_sets: Vec<RoaringBitmap>,
    tail: Filter,
    matches: Vec<Vec<DocId>>,
    scorers: Vec<Arc<dyn Scorer>>,
    leaf_sets: Vec<Vec<RoaringBitmap>>,
    scorer_ctx: ScorerContext,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for PreparedSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedSearch")
            .field("segments", &self.matches.len())
            .field("immutable", &self.immutable.len())
            .field("tail", &self.tail)
            .field("scorers", &self.scorers.len())
            .field("parallel", &self.pool.is_some())
            .finish()
    }
}

impl PreparedSearch {
    /// Prepare `immutable` and `tail` against `snapshot`.
    ///
    /// With `parallelism > 1` segments are evaluated on a dedicated pool of
    /// that many threads.
    pub fn prepare(
        snapshot: Arc<ViewSnapshot>,
        immutable: Vec<Filter>,
        tail: Filter,
        scorers: Vec<Arc<dyn Scorer>>,
        parallelism: usize,
    ) -> Result<Self> {
        let pool = if parallelism > 1 && snapshot.segment_count() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(parallelism)
                .thread_name(|i| format!("tessera-search-{}", i))
                .build()
                .map_err(|e| Error::internal(format!("failed to prepare search: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        let mut prepared = PreparedSearch {
            snapshot,
            immutable,
            immutable_sets: Vec::new(),
            tail,
            matches: Vec::new(),
            scorers,
            leaf_sets: Vec::new(),
            scorer_ctx: ScorerContext::default(),
            pool,
        };
        prepared.immutable_sets = prepared.per_segment(|seg_idx, p| {
            let seg = p.snapshot.segment(seg_idx);
            let mut set = seg.live_docs();
            for part in &p.immutable {
                set &= part.execute(seg);
            }
            set
        });
        prepared.evaluate_tail();
        debug!(
            target: "tessera::search",
            segments = prepared.matches.len(),
            immutable = prepared.immutable.len(),
            matches = prepared.match_count(),
            "search prepared"
        );
        Ok(prepared)
    }

    fn per_segment<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize, &PreparedSearch) -> T + Send + Sync,
    {
        let n = self.snapshot.segment_count();
        match &self.pool {
            Some(pool) => pool.install(|| (0..n).into_par_iter().map(|i| f(i, self)).collect()),
            None => (0..n).map(|i| f(i, self)).collect(),
        }
    }

    fn evaluate_tail(&mut self) {
        self.matches = self.per_segment(|seg_idx, p| {
            let seg = p.snapshot.segment(seg_idx);
            let mut set = p.tail.execute(seg);
            set &= &p.immutable_sets[seg_idx];
            set.iter().collect()
        });
        if self.scorers.is_empty() {
            return;
        }
        let (leaf_sets, scorer_ctx) = {
            let leaves = self.scoring_leaves();
            let sets: Vec<Vec<RoaringBitmap>> = self.per_segment(|seg_idx, p| {
                let seg = p.snapshot.segment(seg_idx);
                p.scoring_leaves().iter().map(|leaf| leaf.execute(seg)).collect()
            });
            (sets, ScorerContext::build(&self.snapshot, &leaves))
        };
        self.leaf_sets = leaf_sets;
        self.scorer_ctx = scorer_ctx;
    }

    fn scoring_leaves(&self) -> Vec<&Filter> {
        let mut leaves: Vec<&Filter> = self.immutable.iter().flat_map(Filter::scoring_leaves).collect();
        leaves.extend(self.tail.scoring_leaves());
        leaves
    }

    /// Replace the tail filter, keeping the immutable parts prepared
    pub fn rearm(&mut self, tail: Filter) {
        trace!(target: "tessera::search", ?tail, "re-arming search");
        self.tail = tail;
        self.evaluate_tail();
    }

    /// Snapshot the search runs against
    pub fn snapshot(&self) -> &Arc<ViewSnapshot> {
        &self.snapshot
    }

    /// Current tail filter
    pub fn tail(&self) -> &Filter {
        &self.tail
    }

    /// Number of immutable parts
    pub fn immutable_count(&self) -> usize {
        self.immutable.len()
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.matches.len()
    }

    /// Matching documents of one segment, ascending
    pub fn matches(&self, segment: usize) -> &[DocId] {
        self.matches.get(segment).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of matches
    pub fn match_count(&self) -> u64 {
        self.matches.iter().map(|m| m.len() as u64).sum()
    }

    /// Cheap upper bound of the number of matches
    pub fn cost_estimate(&self) -> u64 {
        self.snapshot
            .segments()
            .map(|seg| {
                self.immutable
                    .iter()
                    .map(|f| f.estimate(seg))
                    .chain(std::iter::once(self.tail.estimate(seg)))
                    .min()
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Number of scorers
    pub fn scorer_count(&self) -> usize {
        self.scorers.len()
    }

    /// Scores of one document, in scorer order
    pub fn score(&self, segment: usize, doc: DocId) -> SmallVec<[f32; 2]> {
        if self.scorers.is_empty() {
            return SmallVec::new();
        }
        let matched: SmallVec<[usize; 8]> = self
            .leaf_sets
            .get(segment)
            .into_iter()
            .flatten()
            .enumerate()
            .filter(|(_, set)| set.contains(doc))
            .map(|(i, _)| i)
            .collect();
        let stats = DocStats {
            norm: self.snapshot.segment(segment).norm(doc),
            matched: &matched,
        };
        self.scorers
            .iter()
            .map(|s| s.score(&stats, &self.scorer_ctx))
            .collect()
    }
}

// ============================================================================
// Materializer
// ============================================================================

/// Builds hits in the configured read shape
#[derive(Clone)]
pub struct Materializer {
    shape: ReadShape,
    reader: Option<Arc<dyn DocumentReader>>,
    emit_pk: bool,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("shape", &self.shape)
            .field("emit_pk", &self.emit_pk)
            .finish()
    }
}

impl Materializer {
    /// Identity-only hits without primary keys
    pub fn ids() -> Self {
        Materializer {
            shape: ReadShape::Ids,
            reader: None,
            emit_pk: false,
        }
    }

    /// Hits of `shape`; documents are read through `reader`
    pub fn new(shape: ReadShape, reader: Option<Arc<dyn DocumentReader>>, emit_pk: bool) -> Result<Self> {
        if shape == ReadShape::Documents && reader.is_none() {
            return Err(Error::internal("document materialization requires a document reader"));
        }
        Ok(Materializer { shape, reader, emit_pk })
    }

    /// Configured read shape
    pub fn shape(&self) -> &ReadShape {
        &self.shape
    }

    /// Build the hit for one match; `None` when its document is gone
    pub fn materialize(&self, prepared: &PreparedSearch, segment: usize, doc: DocId) -> Result<Option<Hit>> {
        let snapshot = prepared.snapshot();
        let seg = snapshot.segment(segment);
        let source = snapshot.source_of(segment);
        let needs_pk = self.emit_pk || self.shape == ReadShape::Documents;
        let pk = if needs_pk { seg.pk(doc) } else { None };
        let payload = match &self.shape {
            ReadShape::Ids => HitPayload::None,
            ReadShape::Covering(projection) => HitPayload::Covering(projection.project(seg, doc)?),
            ReadShape::Documents => {
                let read = match (&self.reader, pk) {
                    (Some(reader), Some(pk)) => reader.read_document(source, pk),
                    _ => None,
                };
                match read {
                    Some(value) => HitPayload::Document(value),
                    None => {
                        debug!(target: "tessera::search", %source, ?pk, "skipping match without document");
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(Hit {
            segment,
            doc,
            source,
            pk: if self.emit_pk { pk } else { None },
            scores: prepared.score(segment, doc),
            payload,
        }))
    }
}

// ============================================================================
// SearchIterator
// ============================================================================

/// Pull interface over the matches of a prepared search
pub trait SearchIterator: Send {
    /// Emit up to `limit` hits into `sink`; returns false once exhausted
    fn next_hits(&mut self, limit: usize, sink: &mut dyn FnMut(Hit)) -> Result<bool>;

    /// Advance past up to `count` matches without materializing them
    fn skip(&mut self, count: usize) -> Result<usize>;

    /// Skip every remaining match and return how many there were
    fn skip_all(&mut self) -> Result<u64>;

    /// Restart from the first match
    fn reset(&mut self);

    /// True when the tail filter may be replaced
    fn can_rearm(&self) -> bool;

    /// Replace the tail filter and restart; false when not re-armable
    fn rearm(&mut self, tail: Filter) -> Result<bool>;
}

/// Iterates matches segment by segment, in document order
#[derive(Debug)]
pub struct RetrievalIterator {
    prepared: PreparedSearch,
    materializer: Materializer,
    count_approximate: CountApproximate,
    rearmable: bool,
    segment: usize,
    offset: usize,
}

impl RetrievalIterator {
    /// Iterator over `prepared`
    pub fn new(prepared: PreparedSearch, materializer: Materializer) -> Self {
        RetrievalIterator {
            prepared,
            materializer,
            count_approximate: CountApproximate::Exact,
            rearmable: false,
            segment: 0,
            offset: 0,
        }
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

    fn settle(&mut self) -> bool {
        while self.segment < self.prepared.segment_count() {
            if self.offset < self.prepared.matches(self.segment).len() {
                return true;
            }
            self.segment += 1;
            self.offset = 0;
        }
        false
    }

    /// Shared advance loop: visits up to `limit` matches, counting those
    /// for which `visit` returns true.
    fn advance<F>(&mut self, limit: usize, mut visit: F) -> Result<usize>
    where
        F: FnMut(&PreparedSearch, usize, DocId) -> Result<bool>,
    {
        let mut done = 0;
        while done < limit && self.settle() {
            let doc = self.prepared.matches(self.segment)[self.offset];
            self.offset += 1;
            if visit(&self.prepared, self.segment, doc)? {
                done += 1;
            }
        }
        Ok(done)
    }
}

impl SearchIterator for RetrievalIterator {
    fn next_hits(&mut self, limit: usize, sink: &mut dyn FnMut(Hit)) -> Result<bool> {
        let materializer = self.materializer.clone();
        self.advance(limit, |prepared, segment, doc| {
            Ok(match materializer.materialize(prepared, segment, doc)? {
                Some(hit) => {
                    sink(hit);
                    true
                }
                None => false,
            })
        })?;
        Ok(self.settle())
    }

    fn skip(&mut self, count: usize) -> Result<usize> {
        self.advance(count, |_, _, _| Ok(true))
    }

    fn skip_all(&mut self) -> Result<u64> {
        let count = match self.count_approximate {
            CountApproximate::Cost if self.segment == 0 && self.offset == 0 => self.prepared.cost_estimate(),
            _ => {
                let mut remaining = 0u64;
                while self.settle() {
                    remaining += (self.prepared.matches(self.segment).len() - self.offset) as u64;
                    self.offset = self.prepared.matches(self.segment).len();
                }
                remaining
            }
        };
        self.segment = self.prepared.segment_count();
        self.offset = 0;
        Ok(count)
    }

    fn reset(&mut self) {
        self.segment = 0;
        self.offset = 0;
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
pub(crate) mod tests {
    use super::*;
    use crate::scorer::Bm25Scorer;
    use serde_json::json;
    use tessera_core::{IndexId, IndexMeta};
    use tessera_storage::{DataSnapshot, Segment, SegmentBuilder};

    /// Snapshot with one segment per entry of `segments`; documents get
    /// primary keys 1, 2, ... across the whole snapshot.
    pub(crate) fn snapshot_of(meta: IndexMeta, segments: &[Vec<serde_json::Value>]) -> Arc<ViewSnapshot> {
        let meta = Arc::new(meta);
        let mut pk = 0u64;
        let segs = segments
            .iter()
            .enumerate()
            .map(|(i, docs)| {
                let mut b = SegmentBuilder::new(Arc::clone(&meta));
                for d in docs {
                    pk += 1;
                    b.add(LocalDocumentId(pk), d);
                }
                Segment::new(Arc::new(b.build(i as u64 + 1)))
            })
            .collect();
        Arc::new(ViewSnapshot::from_snapshots(vec![(
            DataSourceId(7),
            IndexId(70),
            Arc::new(DataSnapshot::new(segs, 1, 1)),
        )]))
    }

    fn term(field: &str, value: impl Into<FieldValue>) -> Filter {
        Filter::Term {
            field: field.into(),
            value: value.into(),
            boost: 1.0,
        }
    }

    fn docs() -> Arc<ViewSnapshot> {
        snapshot_of(
            IndexMeta::default(),
            &[
                vec![json!({"k": "a", "n": 1}), json!({"k": "b", "n": 2})],
                vec![],
                vec![json!({"k": "a", "n": 3}), json!({"k": "a", "n": 4})],
            ],
        )
    }

    fn collect(it: &mut dyn SearchIterator, limit: usize) -> (Vec<Hit>, bool) {
        let mut hits = Vec::new();
        let more = it.next_hits(limit, &mut |h| hits.push(h)).unwrap();
        (hits, more)
    }

    #[test]
    fn test_iterates_segments_in_order() {
        let prepared = PreparedSearch::prepare(docs(), vec![], term("k", "a"), vec![], 1).unwrap();
        assert_eq!(prepared.match_count(), 3);
        let mut it = RetrievalIterator::new(prepared, Materializer::new(ReadShape::Ids, None, true).unwrap());
        let (hits, more) = collect(&mut it, 2);
        assert!(more);
        assert_eq!(
            hits.iter().map(|h| (h.segment, h.doc, h.pk)).collect::<Vec<_>>(),
            vec![(0, 0, Some(LocalDocumentId(1))), (2, 0, Some(LocalDocumentId(3)))]
        );
        let (hits, more) = collect(&mut it, 10);
        assert_eq!(hits.len(), 1);
        assert!(!more);
        assert!(hits.iter().all(|h| h.source == DataSourceId(7)));
    }

    #[test]
    fn test_skip_and_reset() {
        let prepared = PreparedSearch::prepare(docs(), vec![], Filter::all(), vec![], 1).unwrap();
        let mut it = RetrievalIterator::new(prepared, Materializer::ids());
        assert_eq!(it.skip(3).unwrap(), 3);
        assert_eq!(it.skip(3).unwrap(), 1);
        it.reset();
        let (hits, _) = collect(&mut it, 10);
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|h| h.pk.is_none()));
        it.reset();
        assert_eq!(it.skip_all().unwrap(), 4);
        assert_eq!(it.skip_all().unwrap(), 0);
    }

    #[test]
    fn test_count_approximate_cost() {
        let prepared = PreparedSearch::prepare(docs(), vec![], term("k", "a"), vec![], 1).unwrap();
        let estimate = prepared.cost_estimate();
        assert!(estimate >= 3);
        let mut it = RetrievalIterator::new(prepared, Materializer::ids()).with_count_approximate(CountApproximate::Cost);
        assert_eq!(it.skip_all().unwrap(), estimate);
        assert_eq!(CountApproximate::parse("cost"), Some(CountApproximate::Cost));
        assert_eq!(CountApproximate::parse("fuzzy"), None);
    }

    #[test]
    fn test_rearm_keeps_immutable_parts() {
        let prepared = PreparedSearch::prepare(docs(), vec![term("k", "a")], term("n", 1.0), vec![], 1).unwrap();
        let mut it = RetrievalIterator::new(prepared, Materializer::ids());
        assert!(!it.can_rearm());
        assert!(!it.rearm(term("n", 3.0)).unwrap());

        let prepared = PreparedSearch::prepare(docs(), vec![term("k", "a")], term("n", 1.0), vec![], 1).unwrap();
        let mut it = RetrievalIterator::new(prepared, Materializer::ids()).rearmable(true);
        assert_eq!(it.skip_all().unwrap(), 1);
        assert!(it.rearm(term("n", 2.0)).unwrap());
        assert_eq!(it.skip_all().unwrap(), 0);
        assert!(it.rearm(term("n", 4.0)).unwrap());
        let (hits, _) = collect(&mut it, 10);
        assert_eq!(hits.iter().map(|h| (h.segment, h.doc)).collect::<Vec<_>>(), vec![(2, 1)]);
        assert_eq!(it.prepared().immutable_count(), 1);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let a = PreparedSearch::prepare(docs(), vec![], term("k", "a"), vec![], 1).unwrap();
        let b = PreparedSearch::prepare(docs(), vec![], term("k", "a"), vec![], 4).unwrap();
        for seg in 0..a.segment_count() {
            assert_eq!(a.matches(seg), b.matches(seg));
        }
    }

    #[test]
    fn test_scores_are_emitted() {
        let scorer: Arc<dyn Scorer> = Arc::new(Bm25Scorer::default());
        let filter = Filter::Or(vec![term("k", "b"), term("n", 1.0)]);
        let prepared = PreparedSearch::prepare(docs(), vec![], filter, vec![scorer], 1).unwrap();
        let mut it = RetrievalIterator::new(prepared, Materializer::ids());
        let (hits, _) = collect(&mut it, 10);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.scores.len() == 1 && h.scores[0] > 0.0));
    }

    struct NoDocs;
    impl DocumentReader for NoDocs {
        fn read_document(&self, _: DataSourceId, pk: LocalDocumentId) -> Option<Value> {
            (pk.get() % 2 == 0).then(|| json!({"pk": pk.get()}))
        }
    }

    #[test]
    fn test_documents_skip_missing() {
        assert!(Materializer::new(ReadShape::Documents, None, false).is_err());
        let prepared = PreparedSearch::prepare(docs(), vec![], Filter::all(), vec![], 1).unwrap();
        let reader: Arc<dyn DocumentReader> = Arc::new(NoDocs);
        let mut it = RetrievalIterator::new(prepared, Materializer::new(ReadShape::Documents, Some(reader), false).unwrap());
        let (hits, _) = collect(&mut it, 10);
        assert_eq!(
            hits.iter().map(|h| h.payload.clone()).collect::<Vec<_>>(),
            vec![
                HitPayload::Document(json!({"pk": 2})),
                HitPayload::Document(json!({"pk": 4})),
            ]
        );
    }
}
