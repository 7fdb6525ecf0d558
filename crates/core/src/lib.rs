//! Core types for Tessera
//!
//! This crate defines the foundational types shared by the storage, search
//! and query crates:
//! - Error: error taxonomy and `Result` alias
//! - Types: collection/index/view/plan-node ids, shard ids, server role
//! - FieldValue: totally ordered scalar used by term dictionaries and sort columns
//! - ExprArena: filter/sort/scorer expression trees handed over by the planner
//! - IndexMeta: primary sort, stored columns, consolidation policy, field definitions
//! - SearchConfig: `search.toml` process-wide settings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod config;
pub mod error;
pub mod meta;
pub mod types;
pub mod value;

pub use ast::{CompareOp, Expr, ExprArena, ExprId, MATCH_ALL};
pub use config::{OutOfSyncPolicy, SearchConfig};
pub use error::{Error, Result};
pub use meta::{
    Compression, ConsolidationPolicy, FieldMeta, IndexMeta, PrimarySort, SortField, StoredColumn,
    StoredValues, TierPolicy,
};
pub use types::{
    DataSourceId, DocId, IndexId, LocalDocumentId, PlanNodeId, ServerRole, ShardId, Tick,
    VariableId, ViewId,
};
pub use value::FieldValue;
