//! Bounded top-K retrieval
//!
//! When a query sorts by scores or stored columns and then limits, only the
//! best K matches are ever needed. [`HeapSortIterator`] scans every match,
//! keeps the K best in a bounded heap whose top is the worst retained
//! candidate, and materializes just the winners.

use crate::covering::column_value;
use crate::filter::Filter;
use crate::iterator::{CountApproximate, Hit, Materializer, PreparedSearch, SearchIterator};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tessera_core::{DocId, FieldValue, Result};
use tracing::debug;

/// Where a sort value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortSource {
    /// Output of the scorer with this index
    Score(usize),
    /// Field of an index column (`-1` is the primary-sort column)
    Column {
        /// Column number
        column: isize,
        /// Field position inside the column
        field: usize,
    },
}

/// One component of a bounded sort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSortElement {
    /// Value source
    pub source: SortSource,
    /// Sort direction
    pub ascending: bool,
    /// Attribute path below the column value. Columns hold scalars only,
    /// so a non-empty postfix never resolves and sorts as null.
    pub postfix: Vec<String>,
}

#[derive(Debug, Clone)]
enum SortKey {
    Score(f32),
    Value(Option<FieldValue>),
}

impl SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Score(a), SortKey::Score(b)) => a.total_cmp(b),
            (SortKey::Value(a), SortKey::Value(b)) => a.cmp(b),
            (SortKey::Score(_), SortKey::Value(_)) => Ordering::Greater,
            (SortKey::Value(_), SortKey::Score(_)) => Ordering::Less,
        }
    }
}

// ============================================================================
// TopK
// ============================================================================

#[derive(Debug)]
struct Candidate {
    keys: SmallVec<[SortKey; 2]>,
    seq: u64,
    segment: usize,
    doc: DocId,
    directions: Arc<[bool]>,
}

impl Candidate {
    /// Less means ranked earlier
    fn rank(&self, other: &Self) -> Ordering {
        for ((a, b), asc) in self.keys.iter().zip(&other.keys).zip(self.directions.iter()) {
            let ord = a.cmp(b);
            let ord = if *asc { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.seq.cmp(&other.seq)
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Keeps the `limit` best-ranked candidates seen so far
#[derive(Debug)]
struct TopK {
    limit: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    fn new(limit: usize) -> Self {
        TopK {
            limit,
            heap: BinaryHeap::with_capacity(limit.min(1024) + 1),
        }
    }

    fn push(&mut self, c: Candidate) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() < self.limit {
            self.heap.push(c);
        } else if let Some(worst) = self.heap.peek() {
            if c.rank(worst) == Ordering::Less {
                self.heap.pop();
                self.heap.push(c);
            }
        }
    }

    /// Best first
    fn into_sorted(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

// ============================================================================
// HeapSortIterator
// ============================================================================

/// Emits at most `limit` matches in the order of `elements`
#[derive(Debug)]
pub struct HeapSortIterator {
    prepared: PreparedSearch,
    materializer: Materializer,
    elements: Vec<HeapSortElement>,
    directions: Arc<[bool]>,
    limit: usize,
    count_approximate: CountApproximate,
    rearmable: bool,
    winners: Option<Vec<(usize, DocId)>>,
    /// Drained by an estimated count; cleared by reset and rearm
    estimated: bool,
    position: usize,
    total_matches: u64,
}

impl HeapSortIterator {
    /// Top-`limit` iterator over `prepared`
    pub fn new(prepared: PreparedSearch, materializer: Materializer, elements: Vec<HeapSortElement>, limit: usize) -> Self {
        let directions: Arc<[bool]> = elements.iter().map(|e| e.ascending).collect();
        HeapSortIterator {
            prepared,
            materializer,
            elements,
            directions,
            limit,
            count_approximate: CountApproximate::Exact,
            rearmable: false,
            winners: None,
            estimated: false,
            position: 0,
            total_matches: 0,
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

    /// Matches ranked by the last fill
    pub fn scanned(&self) -> u64 {
        self.total_matches
    }

    fn keys(&self, segment: usize, doc: DocId) -> Result<SmallVec<[SortKey; 2]>> {
        let needs_scores = self
            .elements
            .iter()
            .any(|e| matches!(e.source, SortSource::Score(_)));
        let scores = if needs_scores {
            self.prepared.score(segment, doc)
        } else {
            SmallVec::new()
        };
        let seg = self.prepared.snapshot().segment(segment);
        self.elements
            .iter()
            .map(|e| {
                Ok(match e.source {
                    SortSource::Score(i) => SortKey::Score(scores.get(i).copied().unwrap_or(0.0)),
                    SortSource::Column { .. } if !e.postfix.is_empty() => SortKey::Value(None),
                    SortSource::Column { column, field } => SortKey::Value(column_value(seg, column, field, doc)?),
                })
            })
            .collect()
    }

    fn fill(&mut self) -> Result<()> {
        if self.estimated || self.winners.is_some() {
            return Ok(());
        }
        let mut top = TopK::new(self.limit);
        let mut seq = 0u64;
        for segment in 0..self.prepared.segment_count() {
            for &doc in self.prepared.matches(segment) {
                top.push(Candidate {
                    keys: self.keys(segment, doc)?,
                    seq,
                    segment,
                    doc,
                    directions: Arc::clone(&self.directions),
                });
                seq += 1;
            }
        }
        let winners: Vec<(usize, DocId)> = top.into_sorted().into_iter().map(|c| (c.segment, c.doc)).collect();
        debug!(
            target: "tessera::search",
            scanned = seq,
            kept = winners.len(),
            limit = self.limit,
            "heap sort filled"
        );
        self.total_matches = seq;
        self.winners = Some(winners);
        self.position = 0;
        Ok(())
    }

    fn remaining(&self) -> usize {
        if self.estimated {
            return 0;
        }
        self.winners
            .as_ref()
            .map_or(0, |w| w.len().saturating_sub(self.position))
    }
}

impl SearchIterator for HeapSortIterator {
    fn next_hits(&mut self, limit: usize, sink: &mut dyn FnMut(Hit)) -> Result<bool> {
        self.fill()?;
        let mut emitted = 0;
        while emitted < limit && self.remaining() > 0 {
            let (segment, doc) = match &self.winners {
                Some(w) => w[self.position],
                None => break,
            };
            self.position += 1;
            if let Some(hit) = self.materializer.materialize(&self.prepared, segment, doc)? {
                sink(hit);
                emitted += 1;
            }
        }
        Ok(self.remaining() > 0)
    }

    fn skip(&mut self, count: usize) -> Result<usize> {
        self.fill()?;
        let skipped = count.min(self.remaining());
        self.position += skipped;
        Ok(skipped)
    }

    fn skip_all(&mut self) -> Result<u64> {
        if self.count_approximate == CountApproximate::Cost && self.winners.is_none() && !self.estimated {
            self.estimated = true;
            return Ok(self.prepared.cost_estimate().min(self.limit as u64));
        }
        self.fill()?;
        let skipped = self.remaining() as u64;
        self.position += skipped as usize;
        Ok(skipped)
    }

    fn reset(&mut self) {
        self.estimated = false;
        self.position = 0;
    }

    fn can_rearm(&self) -> bool {
        self.rearmable
    }

    fn rearm(&mut self, tail: Filter) -> Result<bool> {
        if !self.rearmable {
            return Ok(false);
        }
        self.prepared.rearm(tail);
        self.winners = None;
        self.estimated = false;
        self.position = 0;
        Ok(true)
    }
}
