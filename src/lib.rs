//! Tessera - search views over transactional collections
//!
//! A search view indexes one or more collections (or, on a data server,
//! their local shards). Queries read a view through a search plan node that
//! snapshots every linked index consistently for the lifetime of the
//! transaction and streams matches through one execution strategy.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{Catalog, ExecutionPlan, QueryContext, SearchConfig, SearchNode, ServerRole, ROOT_NODE};
//!
//! let catalog = Arc::new(Catalog::new(ServerRole::Single, path));
//! let view = catalog.create_view("v", IndexMeta::default())?;
//! catalog.link(&view, &catalog.create_collection("docs")?)?;
//!
//! let ctx = QueryContext::new(catalog.clone(), SearchConfig::default());
//! let mut plan = ExecutionPlan::new();
//! let doc = plan.create_variable("d");
//! let node = SearchNode::new(&mut plan, &ctx, ROOT_NODE, view, doc, None, None, vec![])?;
//! let rows = node.create_executor(&plan, &ctx, &trx, &|_| None)?.collect_rows()?;
//! ```
//!
//! # Architecture
//!
//! - `tessera_core`: errors, ids, expressions, index metadata, configuration
//! - `tessera_storage`: segments, data stores, snapshots, maintenance
//! - `tessera_search`: catalog, transactions, view snapshots, iterators
//! - `tessera_query`: execution plan, search node, execution strategies

pub use tessera_core::{
    CompareOp, DataSourceId, Error, ExprArena, ExprId, IndexId, IndexMeta, OutOfSyncPolicy, PlanNodeId, Result,
    SearchConfig, ServerRole, ShardId, VariableId, ViewId, MATCH_ALL,
};
pub use tessera_query::{
    ExecutionPlan, ExecutorKey, QueryContext, Row, SearchExecutor, SearchNode, SearchOptions, SearchScorer, Strategy,
    ViewValuesVar, ROOT_NODE,
};
pub use tessera_search::{Catalog, SearchView, Transaction, TrxOptions, ViewSnapshot};
pub use tessera_storage::{AsyncHandle, CommitResult, DataStore, MaintenanceScheduler};
