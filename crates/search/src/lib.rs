//! Search execution for Tessera views
//!
//! This crate provides:
//! - Catalog of collections, shards and views, and the links between them
//! - Transaction with its per-transaction snapshot cache and index writes
//! - ViewSnapshot: read-consistent aggregation of linked data snapshots
//! - Filter compilation from condition expressions
//! - Scorer trait with BM25 and TF-IDF
//! - Retrieval, merge and bounded top-K iterators
//! - Covering projections served from index columns
//!
//! # Usage
//!
//! ```ignore
//! use tessera_search::{Catalog, Transaction, TrxOptions};
//!
//! let trx = Transaction::begin(catalog.clone(), TrxOptions::default())?;
//! let snapshot = make_view_snapshot(&trx, &key, false, &view.lock_links(None)?)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod covering;
pub mod filter;
pub mod heap_sort;
pub mod iterator;
pub mod merge;
pub mod scorer;
pub mod transaction;
pub mod view_snapshot;

// Re-export commonly used types
pub use catalog::{Catalog, Collection, DocumentReader, IndexLink, SearchView};
pub use covering::{CoveringProjection, SORT_COLUMN};
pub use filter::{ConditionOptimization, Filter, FilterCompiler, FILTER_OPTIMIZATION_MAX, FILTER_OPTIMIZATION_NONE};
pub use heap_sort::{HeapSortElement, HeapSortIterator, SortSource};
pub use iterator::{
    CountApproximate, Hit, HitPayload, Materializer, PreparedSearch, ReadShape, RetrievalIterator, SearchIterator,
};
pub use merge::MergeIterator;
pub use scorer::{compile_scorer, Bm25Scorer, Scorer, ScorerContext, TfIdfScorer};
pub use transaction::{CacheKey, Transaction, TrxOptions, TrxStatus};
pub use view_snapshot::{make_view_snapshot, LockedLink, SnapshotEntry, ViewSnapshot};
