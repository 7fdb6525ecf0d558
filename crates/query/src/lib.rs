//! Query integration for Tessera search views
//!
//! This crate connects the planner to the search layer:
//! - ExecutionPlan: plan nodes, variables and their producers
//! - QueryContext: catalog, settings and non-fatal warnings of one query
//! - SearchNode: options, volatility, snapshot acquisition and the
//!   persisted plan record of a search over a view
//! - SearchExecutor: the execution strategy chosen for a node, producing
//!   rows bound to the node's output variables
//!
//! # Usage
//!
//! ```ignore
//! use tessera_query::{ExecutionPlan, QueryContext, SearchNode, ROOT_NODE};
//!
//! let mut plan = ExecutionPlan::new();
//! let doc = plan.create_variable("d");
//! let node = SearchNode::new(&mut plan, &ctx, ROOT_NODE, view, doc, Some(cond), None, vec![])?;
//! let mut exec = node.create_executor(&plan, &ctx, &trx, &|_| None)?;
//! let rows = exec.collect_rows()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod plan;
pub mod search_node;
pub mod strategy;

pub use context::QueryContext;
pub use plan::{ExecutionPlan, NodeKind, PlanNode, Variable, ROOT_NODE};
pub use search_node::{
    parse_options, CostEstimate, MaterializeMode, Materialization, SearchNode, SearchOptions, SearchScorer,
    ViewValuesVar, VOLATILE_FILTER, VOLATILE_SORT, VOLATILITY_UNKNOWN,
};
pub use strategy::{ExecutorKey, Row, SearchExecutor, Strategy};
