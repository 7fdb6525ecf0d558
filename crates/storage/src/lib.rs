//! Storage layer for Tessera
//!
//! One [`DataStore`] per search index (or per index shard). It owns a single
//! [`IndexWriter`] and publishes immutable [`DataSnapshot`]s that readers
//! consume lock-free. Everything below the store is segment plumbing:
//!
//! - `segment`: immutable segments, term dictionaries, deletion masks, merging
//! - `column`: varint + value codec for sort and stored-value records
//! - `writer`: batches and the single writer
//! - `directory`: on-disk layout, manifest, directory lock
//! - `merge_policy`: consolidation candidate selection
//! - `handle`: weak handle / strong lock used by every consumer of a store
//! - `maintenance`: background commit, cleanup and consolidation
//! - `trx_state`: per-transaction write state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod column;
pub mod directory;
pub mod handle;
pub mod maintenance;
pub mod merge_policy;
pub mod segment;
pub mod snapshot;
pub mod store;
pub mod trx_state;
pub mod writer;

pub use directory::Directory;
pub use handle::{AsyncHandle, StrongLock};
pub use maintenance::{MaintenanceScheduler, SchedulerStats, TaskPriority};
pub use merge_policy::select_candidates;
pub use segment::{merge_segments, Segment, SegmentBuilder, SegmentCore, TermDictionary};
pub use snapshot::DataSnapshot;
pub use store::{CommitResult, ConsolidationResult, DataStore, OpStatsSnapshot, StoreStats};
pub use trx_state::IndexTrxState;
pub use writer::{Batch, BatchOp, IndexWriter};
