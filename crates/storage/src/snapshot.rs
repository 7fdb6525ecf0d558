//! Published data snapshots
//!
//! A [`DataSnapshot`] is what a commit publishes: a fixed list of segments
//! (each with its deletion mask) and the storage tick it corresponds to.
//! Readers clone the `Arc` and keep a consistent view for as long as they
//! hold it, regardless of later commits or consolidations.

use crate::segment::Segment;
use tessera_core::Tick;

/// Immutable committed state of one data store
#[derive(Debug, Clone, Default)]
pub struct DataSnapshot {
    segments: Vec<Segment>,
    tick: Tick,
    generation: u64,
}

impl DataSnapshot {
    /// Build from committed segments
    pub fn new(segments: Vec<Segment>, tick: Tick, generation: u64) -> Self {
        DataSnapshot {
            segments,
            tick,
            generation,
        }
    }

    /// Segments in commit order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Storage tick the snapshot corresponds to. Used to correlate the index
    /// state with the transaction engine.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Commit generation that published this snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Documents not deleted
    pub fn live_docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.live_doc_count() as u64).sum()
    }

    /// All documents, deleted included
    pub fn docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count() as u64).sum()
    }

    /// True when there is no segment at all
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
