//! The search plan node
//!
//! A [`SearchNode`] enumerates the documents of a search view that match a
//! condition. It owns everything the planner decided about that
//! enumeration:
//!
//! - the filter condition and scorer expressions (in the plan's arena)
//! - output variables: the document, an id for late materialization, the
//!   search document handle, per-column stored values and scores
//! - an optional primary-sort or bounded top-K order
//! - per-query options and, on data servers, the local shard map
//!
//! Submodules:
//! - `options`: option parsing and persistence
//! - `volatility`: per-row re-evaluation analysis
//! - `snapshot`: view snapshot acquisition per server role
//! - `serialize`: persisted plan record

mod options;
mod serialize;
mod snapshot;
mod volatility;

pub use options::{parse_options, SearchOptions};
pub use volatility::{evaluate_volatility, has_dependencies, VOLATILE_FILTER, VOLATILE_SORT, VOLATILITY_UNKNOWN};

use crate::context::QueryContext;
use crate::plan::{ExecutionPlan, NodeKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tessera_core::{
    Error, ExprId, IndexId, PlanNodeId, PrimarySort, Result, ServerRole, ShardId, VariableId, MATCH_ALL,
};
use tessera_search::{
    Collection, HeapSortElement, SearchView, SortSource, Transaction, FILTER_OPTIMIZATION_NONE, SORT_COLUMN,
};
use tracing::warn;

/// A scorer expression and the variable receiving its score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchScorer {
    /// Output variable
    pub var: VariableId,
    /// Scorer call expression
    pub expr: ExprId,
}

/// A stored-column field bound to an output variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewValuesVar {
    /// Field position inside the column
    pub field: usize,
    /// Output variable
    pub var: VariableId,
}

/// What the node produces for each match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterializeMode {
    /// Full documents
    Materialize,
    /// Document ids, read later by another node
    LateMaterialize,
    /// Nothing but scores and stored values
    NotMaterialize,
}

/// Materialization mode plus the stored-values flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Materialization {
    /// Document output
    pub mode: MaterializeMode,
    /// Stored column values are emitted
    pub use_stored_values: bool,
}

/// Rough cost of running a node
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostEstimate {
    /// Expected number of rows produced
    pub estimated_items: u64,
    /// Abstract cost units
    pub estimated_cost: f64,
}

/// Plan node enumerating a search view
#[derive(Debug, Clone)]
pub struct SearchNode {
    id: PlanNodeId,
    view: Arc<SearchView>,
    out_variable: VariableId,
    out_search_doc: Option<VariableId>,
    out_nm_doc: Option<VariableId>,
    no_materialization: bool,
    out_values: BTreeMap<isize, Vec<ViewValuesVar>>,
    filter: ExprId,
    scorers: Vec<SearchScorer>,
    sort_buckets: Option<usize>,
    heap_sort: Vec<HeapSortElement>,
    heap_sort_limit: usize,
    shards: BTreeMap<ShardId, Vec<IndexId>>,
    options: SearchOptions,
    volatility: i32,
    immutable_parts: usize,
}

impl SearchNode {
    /// Add a search over `view` to `plan`, after `dependency`.
    ///
    /// `filter` defaults to match-all; `options` is the object expression
    /// of the query's OPTIONS clause. On a data server the node serves the
    /// view's local shards.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: &mut ExecutionPlan,
        ctx: &QueryContext,
        dependency: PlanNodeId,
        view: Arc<SearchView>,
        out_variable: VariableId,
        filter: Option<ExprId>,
        options: Option<ExprId>,
        scorers: Vec<SearchScorer>,
    ) -> Result<Self> {
        let options = parse_options(ctx, &view, plan.arena(), options)?;
        let shards = if ctx.role() == ServerRole::DbServer {
            ctx.catalog().local_shards(&view)
        } else {
            BTreeMap::new()
        };
        let id = plan.add_node(NodeKind::Search, dependency, Vec::new())?;
        let node = SearchNode {
            id,
            view,
            out_variable,
            out_search_doc: None,
            out_nm_doc: None,
            no_materialization: options.no_materialization,
            out_values: BTreeMap::new(),
            filter: filter.unwrap_or(MATCH_ALL),
            scorers,
            sort_buckets: None,
            heap_sort: Vec::new(),
            heap_sort_limit: 0,
            shards,
            options,
            volatility: VOLATILITY_UNKNOWN,
            immutable_parts: 0,
        };
        node.publish_variables(plan)?;
        Ok(node)
    }

    fn publish_variables(&self, plan: &mut ExecutionPlan) -> Result<()> {
        plan.set_variables(self.id, self.variables_set_here())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Node id
    pub fn id(&self) -> PlanNodeId {
        self.id
    }

    /// Target view, shared with the catalog
    pub fn view(&self) -> &Arc<SearchView> {
        &self.view
    }

    /// Variable holding the current document
    pub fn out_variable(&self) -> VariableId {
        self.out_variable
    }

    /// Variable holding the search document handle
    pub fn search_doc_variable(&self) -> Option<VariableId> {
        self.out_search_doc
    }

    /// Variable holding the id of a late-materialized document
    pub fn late_materialized_variable(&self) -> Option<VariableId> {
        self.out_nm_doc
    }

    /// Filter condition, [`MATCH_ALL`] when unconditioned
    pub fn filter(&self) -> ExprId {
        self.filter
    }

    /// True when the node has no filter condition
    pub fn filter_is_empty(&self) -> bool {
        self.filter == MATCH_ALL
    }

    /// Scorers in output order
    pub fn scorers(&self) -> &[SearchScorer] {
        &self.scorers
    }

    /// Options
    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    /// Stored-value output variables by column (`-1` is the sort column)
    pub fn view_values(&self) -> &BTreeMap<isize, Vec<ViewValuesVar>> {
        &self.out_values
    }

    /// Local shards and the index ids serving them
    pub fn shards(&self) -> &BTreeMap<ShardId, Vec<IndexId>> {
        &self.shards
    }

    /// Primary sort and the number of leading fields used, when the node
    /// emits in index order
    pub fn sort(&self) -> Option<(&PrimarySort, usize)> {
        self.sort_buckets
            .map(|buckets| (&self.view.meta().primary_sort, buckets))
    }

    /// Bounded top-K elements
    pub fn heap_sort(&self) -> &[HeapSortElement] {
        &self.heap_sort
    }

    /// Bound of the top-K, zero when no top-K is set
    pub fn heap_sort_limit(&self) -> usize {
        self.heap_sort_limit
    }

    /// Leading conjuncts kept prepared across re-arms
    pub fn immutable_parts(&self) -> usize {
        self.immutable_parts
    }

    /// True when document ids are emitted for later materialization
    pub fn is_late_materialized(&self) -> bool {
        self.out_nm_doc.is_some()
    }

    /// True when no document output is produced at all
    pub fn is_no_materialization(&self) -> bool {
        self.no_materialization
    }

    /// Effective materialization
    pub fn materialization(&self) -> Materialization {
        let mode = if self.is_late_materialized() {
            MaterializeMode::LateMaterialize
        } else if self.no_materialization {
            MaterializeMode::NotMaterialize
        } else {
            MaterializeMode::Materialize
        };
        Materialization {
            mode,
            use_stored_values: self.out_values.values().any(|vars| !vars.is_empty()),
        }
    }

    /// Filter optimization level in effect. Rewriting a scored filter would
    /// change its scores, so scorers disable it.
    pub fn filter_optimization(&self) -> i64 {
        if self.scorers.is_empty() {
            self.options.filter_optimization
        } else {
            FILTER_OPTIMIZATION_NONE
        }
    }

    // ------------------------------------------------------------------------
    // Optimizer hooks
    // ------------------------------------------------------------------------

    /// Replace the filter condition; `None` means match-all
    pub fn set_filter(&mut self, filter: Option<ExprId>) {
        self.filter = filter.unwrap_or(MATCH_ALL);
        self.volatility = VOLATILITY_UNKNOWN;
    }

    /// Replace the scorers
    pub fn set_scorers(&mut self, plan: &mut ExecutionPlan, scorers: Vec<SearchScorer>) -> Result<()> {
        self.scorers = scorers;
        self.volatility = VOLATILITY_UNKNOWN;
        self.publish_variables(plan)
    }

    /// Emit in primary-sort order, comparing the first `buckets` fields
    pub fn set_sort(&mut self, buckets: usize) -> Result<()> {
        let size = self.view.meta().primary_sort.size();
        if size == 0 {
            return Err(Error::bad_parameter(format!(
                "view '{}' has no primary sort",
                self.view.name()
            )));
        }
        if buckets == 0 || buckets > size {
            return Err(Error::bad_parameter(format!(
                "invalid primary sort buckets {}: view '{}' sorts by {} field(s)",
                buckets,
                self.view.name(),
                size
            )));
        }
        if !self.heap_sort.is_empty() {
            return Err(Error::internal("primary sort and heap sort are mutually exclusive"));
        }
        self.sort_buckets = Some(buckets);
        Ok(())
    }

    /// Keep only the `limit` best matches by `elements`
    pub fn set_heap_sort(&mut self, elements: Vec<HeapSortElement>, limit: usize) -> Result<()> {
        if self.sort_buckets.is_some() {
            return Err(Error::internal("primary sort and heap sort are mutually exclusive"));
        }
        if !elements.is_empty() && limit == 0 {
            return Err(Error::bad_parameter("heap sort limit must be positive"));
        }
        for (i, e) in elements.iter().enumerate() {
            self.check_sort_source(&e.source, i)?;
        }
        let limit = if elements.is_empty() { 0 } else { limit };
        self.heap_sort = elements;
        self.heap_sort_limit = limit;
        Ok(())
    }

    fn check_sort_source(&self, source: &SortSource, i: usize) -> Result<()> {
        let in_range = match *source {
            SortSource::Score(idx) => idx < self.scorers.len(),
            SortSource::Column { column, field } => self.column_width(column).is_some_and(|w| field < w),
        };
        if in_range {
            Ok(())
        } else {
            Err(Error::bad_parameter(format!("'heapSort[{}].source' attribute is out of range", i)))
        }
    }

    /// Number of fields of `column`, `None` when there is no such column
    fn column_width(&self, column: isize) -> Option<usize> {
        let meta = self.view.meta();
        if column == SORT_COLUMN {
            let size = meta.primary_sort.size();
            (size > 0).then_some(size)
        } else {
            usize::try_from(column)
                .ok()
                .and_then(|c| meta.stored_values.columns().get(c))
                .map(|c| c.fields.len())
        }
    }

    /// Emit document ids into `var` instead of documents
    pub fn set_late_materialized(&mut self, plan: &mut ExecutionPlan, var: VariableId) -> Result<()> {
        self.out_nm_doc = Some(var);
        self.no_materialization = false;
        self.publish_variables(plan)
    }

    /// Emit no document output
    pub fn set_no_materialization(&mut self, plan: &mut ExecutionPlan) -> Result<()> {
        self.out_nm_doc = None;
        self.no_materialization = true;
        self.publish_variables(plan)
    }

    /// Emit the search document handle into `var`
    pub fn set_search_doc_variable(&mut self, plan: &mut ExecutionPlan, var: VariableId) -> Result<()> {
        self.out_search_doc = Some(var);
        self.publish_variables(plan)
    }

    /// Bind stored-column fields to output variables
    pub fn set_view_values(&mut self, plan: &mut ExecutionPlan, column: isize, vars: Vec<ViewValuesVar>) -> Result<()> {
        let width = self
            .column_width(column)
            .ok_or_else(|| Error::bad_parameter(format!("view '{}' has no stored column {}", self.view.name(), column)))?;
        if let Some(bad) = vars.iter().find(|v| v.field >= width) {
            return Err(Error::bad_parameter(format!(
                "field {} is out of range of stored column {}",
                bad.field, column
            )));
        }
        if vars.is_empty() {
            self.out_values.remove(&column);
        } else {
            self.out_values.insert(column, vars);
        }
        self.publish_variables(plan)
    }

    /// Keep the first `parts` conjuncts of the filter prepared across re-arms
    pub fn set_immutable_parts(&mut self, parts: usize) {
        self.immutable_parts = parts;
    }

    /// Restrict the node to `shards` (set by the cluster planner)
    pub fn set_shards(&mut self, shards: BTreeMap<ShardId, Vec<IndexId>>) {
        self.shards = shards;
    }

    // ------------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------------

    /// `(filter volatile, sort volatile)`. The mask is cached and only
    /// recomputed when `force` is set or it was never computed.
    pub fn volatility(&mut self, plan: &ExecutionPlan, force: bool) -> (bool, bool) {
        if force || self.volatility < 0 {
            let scorers: Vec<ExprId> = self.scorers.iter().map(|s| s.expr).collect();
            self.volatility = evaluate_volatility(plan, self.id, self.out_variable, self.filter, &scorers);
        }
        (
            self.volatility & VOLATILE_FILTER != 0,
            self.volatility & VOLATILE_SORT != 0,
        )
    }

    /// Raw volatility mask, negative when not computed
    pub fn volatility_mask(&self) -> i32 {
        self.volatility
    }

    /// True when the `collections` option admits `collection`. Data servers
    /// match shards by the logical collection they belong to.
    pub(crate) fn admits(&self, ctx: &QueryContext, collection: &Collection) -> bool {
        if !self.options.restrict_sources {
            return true;
        }
        let id = match ctx.role() {
            ServerRole::DbServer => collection.plan_id(),
            _ => collection.id(),
        };
        self.options.sources.contains(&id)
    }

    /// Collections read by the node: linked and not excluded by the
    /// `collections` option
    pub fn collections(&self, ctx: &QueryContext) -> Vec<Arc<Collection>> {
        let mut out = Vec::new();
        for cid in self.view.linked_collections() {
            match ctx.catalog().collection(cid) {
                Some(c) if self.admits(ctx, &c) => out.push(c),
                Some(_) => {}
                None => {
                    warn!(target: "tessera::search", collection = %cid, "collection is not registered with the query");
                }
            }
        }
        out
    }

    /// True when the view has no linked collection
    pub fn empty(&self) -> bool {
        self.view.linked_collections().is_empty()
    }

    /// Copy of this node appended to `plan` after `dependency`
    pub fn clone_node(&self, plan: &mut ExecutionPlan, dependency: PlanNodeId) -> Result<SearchNode> {
        let id = plan.add_node(NodeKind::Search, dependency, self.variables_set_here())?;
        Ok(SearchNode { id, ..self.clone() })
    }

    /// Rename variables in the filter and scorers
    pub fn replace_variables(&mut self, plan: &mut ExecutionPlan, replacements: &HashMap<VariableId, VariableId>) {
        let arena = plan.arena_mut();
        if self.filter != MATCH_ALL {
            self.filter = arena.replace_variables(self.filter, replacements);
        }
        for scorer in &mut self.scorers {
            scorer.expr = arena.replace_variables(scorer.expr, replacements);
        }
        self.volatility = VOLATILITY_UNKNOWN;
    }

    /// Variables read by the filter and scorers, other than the node's own
    /// document variable
    pub fn variables_used_here(&self, plan: &ExecutionPlan) -> BTreeSet<VariableId> {
        let arena = plan.arena();
        let mut vars = BTreeSet::new();
        if self.filter != MATCH_ALL {
            arena.referenced_variables(self.filter, &mut vars);
        }
        for scorer in &self.scorers {
            arena.referenced_variables(scorer.expr, &mut vars);
        }
        vars.remove(&self.out_variable);
        vars
    }

    /// Variables produced by the node: scores, then the document (or its id
    /// and stored values), then the search document handle
    pub fn variables_set_here(&self) -> Vec<VariableId> {
        let mut vars: Vec<VariableId> = self.scorers.iter().map(|s| s.var).collect();
        if self.is_late_materialized() || self.no_materialization {
            vars.extend(self.out_nm_doc);
            vars.extend(self.out_values.values().flatten().map(|v| v.var));
        } else {
            vars.push(self.out_variable);
        }
        vars.extend(self.out_search_doc);
        vars
    }

    /// Stored column and field a view-value variable is read from
    pub fn source_column_info(&self, var: VariableId) -> Option<(isize, usize)> {
        self.out_values
            .iter()
            .find_map(|(column, vars)| vars.iter().find(|v| v.var == var).map(|v| (*column, v.field)))
    }

    /// Cost of enumerating the node once per row of `input`
    pub fn estimate_cost(&self, ctx: &QueryContext, trx: &Transaction, input: CostEstimate) -> CostEstimate {
        if !trx.is_running() {
            return CostEstimate::default();
        }
        let per_row: u64 = self.collections(ctx).iter().map(|c| c.len() as u64).sum();
        let estimated_items = input.estimated_items.max(1) * per_row;
        CostEstimate {
            estimated_items,
            estimated_cost: input.estimated_cost + estimated_items as f64,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plan::ROOT_NODE;
    use serde_json::{json, Value};
    use tessera_core::{IndexMeta, SearchConfig};
    use tessera_search::{Catalog, TrxOptions};

    pub(crate) struct Fixture {
        pub _dir: tempfile::TempDir,
        pub ctx: QueryContext,
        pub view: Arc<SearchView>,
        pub plan: ExecutionPlan,
        pub doc: VariableId,
    }

    pub(crate) fn fixture(meta: Value) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::new(ServerRole::Single, dir.path()));
        let c1 = catalog.create_collection("c1").unwrap();
        let c2 = catalog.create_collection("c2").unwrap();
        let view = catalog
            .create_view("v", IndexMeta::from_json(&meta).unwrap())
            .unwrap();
        catalog.link(&view, &c1).unwrap();
        catalog.link(&view, &c2).unwrap();
        let mut plan = ExecutionPlan::new();
        let doc = plan.create_variable("d");
        Fixture {
            _dir: dir,
            ctx: QueryContext::new(catalog, SearchConfig::default()),
            view,
            plan,
            doc,
        }
    }

    pub(crate) fn node(f: &mut Fixture, options: Option<Value>) -> SearchNode {
        let options = options.map(|o| f.plan.arena_mut().object_from_json(&o));
        SearchNode::new(
            &mut f.plan,
            &f.ctx,
            ROOT_NODE,
            Arc::clone(&f.view),
            f.doc,
            None,
            options,
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_new_node_publishes_document_variable() {
        let mut f = fixture(json!({}));
        let n = node(&mut f, None);
        assert!(n.filter_is_empty());
        assert_eq!(f.plan.setter_of(f.doc).map(|p| p.id), Some(n.id()));
        assert_eq!(
            n.materialization(),
            Materialization {
                mode: MaterializeMode::Materialize,
                use_stored_values: false
            }
        );
    }

    #[test]
    fn test_materialization_modes_exclusive() {
        let mut f = fixture(json!({"storedValues": [["a", "b"]]}));
        let mut n = node(&mut f, Some(json!({"noMaterialization": true})));
        assert_eq!(n.materialization().mode, MaterializeMode::NotMaterialize);

        let id_var = f.plan.create_variable("id");
        n.set_late_materialized(&mut f.plan, id_var).unwrap();
        assert_eq!(n.materialization().mode, MaterializeMode::LateMaterialize);
        assert!(!n.is_no_materialization());

        let b = f.plan.create_variable("b");
        n.set_view_values(&mut f.plan, 0, vec![ViewValuesVar { field: 1, var: b }])
            .unwrap();
        assert!(n.materialization().use_stored_values);
        assert_eq!(n.variables_set_here(), vec![id_var, b]);
        assert_eq!(n.source_column_info(b), Some((0, 1)));
        assert_eq!(f.plan.setter_of(b).map(|p| p.id), Some(n.id()));

        n.set_no_materialization(&mut f.plan).unwrap();
        assert_eq!(n.materialization().mode, MaterializeMode::NotMaterialize);
        assert_eq!(n.variables_set_here(), vec![b]);

        let err = n
            .set_view_values(&mut f.plan, 0, vec![ViewValuesVar { field: 2, var: b }])
            .unwrap_err();
        assert!(err.is_bad_parameter());
        assert!(n.set_view_values(&mut f.plan, 3, vec![]).is_err());
    }

    #[test]
    fn test_sort_and_heap_sort_exclusive() {
        let mut f = fixture(json!({"primarySort": [{"field": "a", "asc": true}]}));
        let mut n = node(&mut f, None);
        assert!(n.set_sort(2).unwrap_err().is_bad_parameter());
        n.set_sort(1).unwrap();
        assert_eq!(n.sort().map(|(s, b)| (s.size(), b)), Some((1, 1)));
        let element = HeapSortElement {
            source: SortSource::Column { column: SORT_COLUMN, field: 0 },
            ascending: true,
            postfix: vec![],
        };
        assert!(n.set_heap_sort(vec![element.clone()], 5).unwrap_err().is_internal());

        let mut m = node(&mut f, None);
        m.set_heap_sort(vec![element], 5).unwrap();
        assert!(m.set_sort(1).is_err());
        let score = HeapSortElement {
            source: SortSource::Score(0),
            ascending: false,
            postfix: vec![],
        };
        let err = m.set_heap_sort(vec![score], 5).unwrap_err();
        assert!(err.to_string().contains("'heapSort[0].source' attribute is out of range"));
    }

    #[test]
    fn test_scorers_disable_filter_optimization() {
        let mut f = fixture(json!({}));
        let mut n = node(&mut f, None);
        assert_eq!(n.filter_optimization(), tessera_search::FILTER_OPTIMIZATION_MAX);
        let score = f.plan.create_variable("s");
        let d = f.plan.arena_mut().reference(f.doc);
        let call = f.plan.arena_mut().call("BM25", vec![d]);
        n.set_scorers(&mut f.plan, vec![SearchScorer { var: score, expr: call }])
            .unwrap();
        assert_eq!(n.filter_optimization(), FILTER_OPTIMIZATION_NONE);
        assert_eq!(n.variables_set_here(), vec![score, f.doc]);
    }

    #[test]
    fn test_collections_restriction() {
        let mut f = fixture(json!({}));
        let all = node(&mut f, None);
        assert_eq!(all.collections(&f.ctx).len(), 2);
        assert!(!all.empty());

        let restricted = node(&mut f, Some(json!({"collections": ["c1"]})));
        let names: Vec<String> = restricted
            .collections(&f.ctx)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["c1"]);
    }

    #[test]
    fn test_variables_used_and_replaced() {
        let mut f = fixture(json!({}));
        let x = f.plan.create_variable("x");
        let y = f.plan.create_variable("y");
        let arena = f.plan.arena_mut();
        let lhs = arena.attribute_path(f.doc, "a");
        let rhs = arena.reference(x);
        let cond = arena.compare(tessera_core::CompareOp::Eq, lhs, rhs);
        let mut n = node(&mut f, None);
        n.set_filter(Some(cond));
        assert_eq!(n.variables_used_here(&f.plan).into_iter().collect::<Vec<_>>(), vec![x]);

        let mut map = HashMap::new();
        map.insert(x, y);
        n.replace_variables(&mut f.plan, &map);
        assert_ne!(n.filter(), cond);
        assert_eq!(n.variables_used_here(&f.plan).into_iter().collect::<Vec<_>>(), vec![y]);
        assert_eq!(n.volatility_mask(), VOLATILITY_UNKNOWN);
    }

    #[test]
    fn test_volatility_memoized() {
        let mut f = fixture(json!({}));
        let x = f.plan.create_variable("x");
        let outer = f
            .plan
            .add_node(NodeKind::EnumerateList, ROOT_NODE, vec![x])
            .unwrap();
        let arena = f.plan.arena_mut();
        let lhs = arena.attribute_path(f.doc, "a");
        let rhs = arena.reference(x);
        let cond = arena.compare(tessera_core::CompareOp::Eq, lhs, rhs);
        let mut n = SearchNode::new(
            &mut f.plan,
            &f.ctx,
            outer,
            Arc::clone(&f.view),
            f.doc,
            Some(cond),
            None,
            vec![],
        )
        .unwrap();
        assert_eq!(n.volatility_mask(), VOLATILITY_UNKNOWN);
        assert_eq!(n.volatility(&f.plan, false), (true, false));
        n.set_filter(None);
        assert_eq!(n.volatility(&f.plan, false), (false, false));
    }

    #[test]
    fn test_clone_node_gets_new_id() {
        let mut f = fixture(json!({}));
        let n = node(&mut f, Some(json!({"waitForSync": true})));
        let copy = n.clone_node(&mut f.plan, ROOT_NODE).unwrap();
        assert_ne!(copy.id(), n.id());
        assert_eq!(copy.options(), n.options());
        assert_eq!(copy.variables_set_here(), n.variables_set_here());
    }

    #[test]
    fn test_estimate_cost_counts_collections() {
        let mut f = fixture(json!({}));
        let c1 = f.ctx.catalog().collection_by_name("c1").unwrap();
        let trx = Transaction::begin(Arc::clone(f.ctx.catalog()), TrxOptions::default()).unwrap();
        trx.insert(&c1, json!({"a": 1})).unwrap();
        trx.insert(&c1, json!({"a": 2})).unwrap();
        trx.commit().unwrap();

        let n = node(&mut f, None);
        let reader = Transaction::begin(Arc::clone(f.ctx.catalog()), TrxOptions::default()).unwrap();
        let cost = n.estimate_cost(
            &f.ctx,
            &reader,
            CostEstimate {
                estimated_items: 3,
                estimated_cost: 1.0,
            },
        );
        assert_eq!(cost.estimated_items, 6);
        assert_eq!(cost.estimated_cost, 7.0);
        reader.abort();
        assert_eq!(n.estimate_cost(&f.ctx, &reader, CostEstimate::default()), CostEstimate::default());
    }
}
