//! Execution strategies for search nodes
//!
//! A search node runs as exactly one iterator shape. Which one is decided
//! by an [`ExecutorKey`]: the materialization mode, whether stored values
//! are read, index-order versus top-K emission, scorers, the search
//! document output and segment parallelism. Keys map through a table built
//! once per process to the constructor of the matching iterator.
//!
//! [`SearchExecutor`] drives that iterator and binds each hit to the
//! node's output variables as a [`Row`].

use crate::context::QueryContext;
use crate::plan::ExecutionPlan;
use crate::search_node::{evaluate_volatility, MaterializeMode, SearchNode, VOLATILE_FILTER, VOLATILE_SORT};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tessera_core::{Error, ExprId, Result, ServerRole, VariableId};
use tessera_search::{
    compile_scorer, CoveringProjection, DocumentReader, Filter, FilterCompiler, HeapSortIterator, Hit, HitPayload,
    Materializer, MergeIterator, PreparedSearch, ReadShape, RetrievalIterator, Scorer, SearchIterator, Transaction,
};
use tracing::{debug, warn};

/// Values of a node's output variables for one match
pub type Row = BTreeMap<VariableId, Value>;

/// Point in the space of execution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorKey {
    /// Document output
    pub materialize: MaterializeMode,
    /// Stored column values are read
    pub use_stored_values: bool,
    /// Emitted in primary-sort order
    pub sorted: bool,
    /// Scorers are evaluated
    pub ordered: bool,
    /// Bounded top-K
    pub heap_sort: bool,
    /// Search document handles are emitted
    pub emit_search_doc: bool,
    /// Segments are evaluated in parallel
    pub parallel: bool,
}

/// Chosen execution of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing can match; no snapshot is touched
    NoResults,
    /// Run the iterator selected by the key
    Iterate(ExecutorKey),
}

struct IteratorArgs<'a> {
    node: &'a SearchNode,
    prepared: PreparedSearch,
    materializer: Materializer,
    rearmable: bool,
}

type IteratorFactory = fn(IteratorArgs<'_>) -> Result<Box<dyn SearchIterator>>;

fn retrieval(args: IteratorArgs<'_>) -> Result<Box<dyn SearchIterator>> {
    Ok(Box::new(
        RetrievalIterator::new(args.prepared, args.materializer)
            .with_count_approximate(args.node.options().count_approximate)
            .rearmable(args.rearmable),
    ))
}

fn merge(args: IteratorArgs<'_>) -> Result<Box<dyn SearchIterator>> {
    let (sort, buckets) = args
        .node
        .sort()
        .ok_or_else(|| Error::internal("sorted execution without a primary sort"))?;
    let it = MergeIterator::new(args.prepared, args.materializer, sort.clone(), buckets)?;
    Ok(Box::new(
        it.with_count_approximate(args.node.options().count_approximate)
            .rearmable(args.rearmable),
    ))
}

fn heap_sort(args: IteratorArgs<'_>) -> Result<Box<dyn SearchIterator>> {
    let node = args.node;
    Ok(Box::new(
        HeapSortIterator::new(
            args.prepared,
            args.materializer,
            node.heap_sort().to_vec(),
            node.heap_sort_limit(),
        )
        .with_count_approximate(node.options().count_approximate)
        .rearmable(args.rearmable),
    ))
}

/// Every valid key and its iterator constructor. Primary-sort and top-K
/// emission exclude each other.
static FACTORIES: Lazy<HashMap<ExecutorKey, IteratorFactory>> = Lazy::new(|| {
    let modes = [
        MaterializeMode::Materialize,
        MaterializeMode::LateMaterialize,
        MaterializeMode::NotMaterialize,
    ];
    let flags = [false, true];
    let mut table: HashMap<ExecutorKey, IteratorFactory> = HashMap::new();
    for materialize in modes {
        for use_stored_values in flags {
            for ordered in flags {
                for emit_search_doc in flags {
                    for parallel in flags {
                        for (sorted, heap, factory) in [
                            (false, false, retrieval as IteratorFactory),
                            (true, false, merge as IteratorFactory),
                            (false, true, heap_sort as IteratorFactory),
                        ] {
                            let key = ExecutorKey {
                                materialize,
                                use_stored_values,
                                sorted,
                                ordered,
                                heap_sort: heap,
                                emit_search_doc,
                                parallel,
                            };
                            table.insert(key, factory);
                        }
                    }
                }
            }
        }
    }
    table
});

// ============================================================================
// Node side
// ============================================================================

impl SearchNode {
    /// Strategy key of the node
    pub fn executor_key(&self) -> ExecutorKey {
        let materialization = self.materialization();
        ExecutorKey {
            materialize: materialization.mode,
            use_stored_values: materialization.use_stored_values,
            sorted: self.sort().is_some(),
            ordered: !self.scorers().is_empty(),
            heap_sort: !self.heap_sort().is_empty(),
            emit_search_doc: self.search_doc_variable().is_some(),
            parallel: self.options().parallelism > 1,
        }
    }

    /// Volatility mask, evaluated now when the cached one is unknown
    fn effective_volatility(&self, plan: &ExecutionPlan) -> i32 {
        let mask = self.volatility_mask();
        if mask >= 0 {
            return mask;
        }
        let scorers: Vec<ExprId> = self.scorers().iter().map(|s| s.expr).collect();
        evaluate_volatility(plan, self.id(), self.out_variable(), self.filter(), &scorers)
    }

    /// Build the executor running this node inside `trx`.
    ///
    /// `bindings` resolves the outer variables the condition and scorers
    /// read, for the current outer row.
    pub fn create_executor(
        &self,
        plan: &ExecutionPlan,
        ctx: &QueryContext,
        trx: &Transaction,
        bindings: &dyn Fn(VariableId) -> Option<Value>,
    ) -> Result<SearchExecutor> {
        if ctx.role() == ServerRole::Coordinator || self.empty() {
            debug!(target: "tessera::search", node = %self.id(), view = %self.view().name(), "search has no sources");
            return Ok(SearchExecutor::no_results(self));
        }
        let snapshot = self.snapshot(ctx, trx)?;
        if snapshot.live_docs_count() == 0 {
            debug!(target: "tessera::search", node = %self.id(), view = %self.view().name(), "view snapshot is empty");
            return Ok(SearchExecutor::no_results(self));
        }

        let key = self.executor_key();
        let factory = FACTORIES
            .get(&key)
            .ok_or_else(|| Error::internal(format!("no execution strategy for {:?}", key)))?;

        let compiler = FilterCompiler::new(plan.arena(), self.out_variable(), bindings);
        let (immutable, tail) = compiler
            .compile_split(
                self.filter(),
                self.immutable_parts(),
                self.options().condition_optimization,
                self.filter_optimization(),
            )
            .map_err(|e| {
                warn!(target: "tessera::search", view = %self.view().name(), error = %e, "failed to prepare filter");
                e
            })?;
        let scorers = self
            .scorers()
            .iter()
            .map(|s| compile_scorer(plan.arena(), s.expr, self.out_variable()).map(Arc::<dyn Scorer>::from))
            .collect::<Result<Vec<_>>>()?;
        let prepared = PreparedSearch::prepare(snapshot, immutable, tail, scorers, self.options().parallelism)?;

        let (materializer, covering) = self.materializer(ctx)?;
        let volatility = self.effective_volatility(plan);
        let iterator = factory(IteratorArgs {
            node: self,
            prepared,
            materializer,
            rearmable: volatility & VOLATILE_FILTER != 0,
        })?;
        debug!(target: "tessera::search", node = %self.id(), ?key, "search executor created");
        Ok(SearchExecutor {
            strategy: Strategy::Iterate(key),
            iterator: Some(iterator),
            outputs: Outputs::of(self, covering),
            sort_volatile: volatility & VOLATILE_SORT != 0,
        })
    }

    /// Recompile only the mutable tail of the condition for new bindings
    pub fn compile_tail(&self, plan: &ExecutionPlan, bindings: &dyn Fn(VariableId) -> Option<Value>) -> Result<Filter> {
        FilterCompiler::new(plan.arena(), self.out_variable(), bindings).compile_tail(
            self.filter(),
            self.immutable_parts(),
            self.options().condition_optimization,
            self.filter_optimization(),
        )
    }

    fn materializer(&self, ctx: &QueryContext) -> Result<(Materializer, Vec<VariableId>)> {
        let m = self.materialization();
        if m.mode == MaterializeMode::Materialize {
            let reader: Arc<dyn DocumentReader> = Arc::clone(ctx.catalog()) as Arc<dyn DocumentReader>;
            return Ok((Materializer::new(ReadShape::Documents, Some(reader), false)?, Vec::new()));
        }
        let emit_pk = m.mode == MaterializeMode::LateMaterialize;
        if !m.use_stored_values {
            return Ok((Materializer::new(ReadShape::Ids, None, emit_pk)?, Vec::new()));
        }
        let mut requests = Vec::new();
        let mut vars = Vec::new();
        for (column, values) in self.view_values() {
            for v in values {
                requests.push((*column, v.field));
                vars.push(v.var);
            }
        }
        let projection = CoveringProjection::with_requests(self.view().meta(), &requests)?;
        Ok((Materializer::new(ReadShape::Covering(projection), None, emit_pk)?, vars))
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Output variables a hit is bound to
#[derive(Debug, Clone)]
struct Outputs {
    mode: MaterializeMode,
    document: VariableId,
    document_id: Option<VariableId>,
    search_doc: Option<VariableId>,
    scores: Vec<VariableId>,
    covering: Vec<VariableId>,
}

impl Outputs {
    fn of(node: &SearchNode, covering: Vec<VariableId>) -> Self {
        Outputs {
            mode: node.materialization().mode,
            document: node.out_variable(),
            document_id: node.late_materialized_variable(),
            search_doc: node.search_doc_variable(),
            scores: node.scorers().iter().map(|s| s.var).collect(),
            covering,
        }
    }

    fn bind(&self, hit: Hit) -> Row {
        let mut row = Row::new();
        for (var, score) in self.scores.iter().zip(hit.scores.iter()) {
            row.insert(*var, json!(score));
        }
        if let (MaterializeMode::LateMaterialize, Some(var)) = (self.mode, self.document_id) {
            let pk = hit.pk.map_or(Value::Null, |pk| json!(pk.get()));
            row.insert(var, json!({"source": hit.source.get(), "pk": pk}));
        }
        if let Some(var) = self.search_doc {
            row.insert(var, json!({"segment": hit.segment, "doc": hit.doc}));
        }
        match hit.payload {
            HitPayload::Document(doc) => {
                row.insert(self.document, doc);
            }
            HitPayload::Covering(values) => {
                for (var, value) in self.covering.iter().zip(values) {
                    row.insert(*var, value.map_or(Value::Null, |v| v.to_json()));
                }
            }
            HitPayload::None => {}
        }
        row
    }
}

/// Runs one search node and produces rows
pub struct SearchExecutor {
    strategy: Strategy,
    iterator: Option<Box<dyn SearchIterator>>,
    outputs: Outputs,
    sort_volatile: bool,
}

impl std::fmt::Debug for SearchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchExecutor")
            .field("strategy", &self.strategy)
            .field("sort_volatile", &self.sort_volatile)
            .finish()
    }
}

impl SearchExecutor {
    fn no_results(node: &SearchNode) -> Self {
        SearchExecutor {
            strategy: Strategy::NoResults,
            iterator: None,
            outputs: Outputs::of(node, Vec::new()),
            sort_volatile: false,
        }
    }

    /// Strategy in use
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Append up to `limit` rows to `out`; false once exhausted
    pub fn next_rows(&mut self, limit: usize, out: &mut Vec<Row>) -> Result<bool> {
        let Some(iterator) = self.iterator.as_mut() else {
            return Ok(false);
        };
        let outputs = &self.outputs;
        iterator.next_hits(limit, &mut |hit| out.push(outputs.bind(hit)))
    }

    /// Every remaining row
    pub fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.next_rows(1000, &mut rows)? {}
        Ok(rows)
    }

    /// Skip up to `count` rows
    pub fn skip(&mut self, count: usize) -> Result<usize> {
        match self.iterator.as_mut() {
            Some(it) => it.skip(count),
            None => Ok(0),
        }
    }

    /// Skip and count every remaining row
    pub fn skip_all(&mut self) -> Result<u64> {
        match self.iterator.as_mut() {
            Some(it) => it.skip_all(),
            None => Ok(0),
        }
    }

    /// Restart from the first row
    pub fn reset(&mut self) {
        if let Some(it) = self.iterator.as_mut() {
            it.reset();
        }
    }

    /// Re-bind the condition to a new outer row. Returns false when the
    /// executor cannot follow (volatile scorers, or a filter that was not
    /// prepared re-armable); the caller then creates a new executor.
    pub fn rearm(
        &mut self,
        node: &SearchNode,
        plan: &ExecutionPlan,
        bindings: &dyn Fn(VariableId) -> Option<Value>,
    ) -> Result<bool> {
        let Some(iterator) = self.iterator.as_mut() else {
            return Ok(true);
        };
        if self.sort_volatile || !iterator.can_rearm() {
            return Ok(false);
        }
        let tail = node.compile_tail(plan, bindings)?;
        iterator.rearm(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NodeKind, ROOT_NODE};
    use crate::search_node::tests::{fixture, node};
    use crate::search_node::{SearchScorer, ViewValuesVar};
    use tessera_core::CompareOp;
    use tessera_search::{HeapSortElement, SortSource, TrxOptions, SORT_COLUMN};

    fn no_bindings(_: VariableId) -> Option<Value> {
        None
    }

    fn write(ctx: &QueryContext, collection: &str, docs: Vec<Value>) {
        let c = ctx.catalog().collection_by_name(collection).unwrap();
        let trx = Transaction::begin(Arc::clone(ctx.catalog()), TrxOptions::default()).unwrap();
        for d in docs {
            trx.insert(&c, d).unwrap();
        }
        trx.commit().unwrap();
    }

    fn begin(ctx: &QueryContext) -> Transaction {
        Transaction::begin(Arc::clone(ctx.catalog()), TrxOptions::default()).unwrap()
    }

    #[test]
    fn test_table_covers_valid_keys_only() {
        let base = ExecutorKey {
            materialize: MaterializeMode::Materialize,
            use_stored_values: false,
            sorted: false,
            ordered: false,
            heap_sort: false,
            emit_search_doc: false,
            parallel: false,
        };
        assert!(FACTORIES.contains_key(&base));
        assert!(FACTORIES.contains_key(&ExecutorKey { sorted: true, ..base }));
        assert!(FACTORIES.contains_key(&ExecutorKey { heap_sort: true, ..base }));
        assert!(!FACTORIES.contains_key(&ExecutorKey {
            sorted: true,
            heap_sort: true,
            ..base
        }));
        assert_eq!(FACTORIES.len(), 3 * 2 * 2 * 2 * 2 * 3);
    }

    #[test]
    fn test_executor_key_follows_node() {
        let mut f = fixture(json!({"primarySort": [{"field": "n", "asc": true}]}));
        let mut n = node(&mut f, Some(json!({"parallelism": 4})));
        let key = n.executor_key();
        assert!(key.parallel);
        assert!(!key.sorted);
        assert_eq!(key.materialize, MaterializeMode::Materialize);

        n.set_sort(1).unwrap();
        let sd = f.plan.create_variable("sd");
        n.set_search_doc_variable(&mut f.plan, sd).unwrap();
        let key = n.executor_key();
        assert!(key.sorted);
        assert!(key.emit_search_doc);
    }

    #[test]
    fn test_empty_snapshot_yields_no_results() {
        let mut f = fixture(json!({}));
        let n = node(&mut f, None);
        let trx = begin(&f.ctx);
        let mut exec = n.create_executor(&f.plan, &f.ctx, &trx, &no_bindings).unwrap();
        assert_eq!(exec.strategy(), Strategy::NoResults);
        assert!(exec.collect_rows().unwrap().is_empty());
        assert_eq!(exec.skip_all().unwrap(), 0);
    }

    #[test]
    fn test_materialized_documents_bound_to_out_variable() {
        let mut f = fixture(json!({}));
        write(&f.ctx, "c1", vec![json!({"t": "a"}), json!({"t": "b"})]);
        write(&f.ctx, "c2", vec![json!({"t": "a"})]);
        let arena = f.plan.arena_mut();
        let lhs = arena.attribute_path(f.doc, "t");
        let rhs = arena.value(json!("a"));
        let cond = arena.compare(CompareOp::Eq, lhs, rhs);
        let mut n = node(&mut f, Some(json!({"waitForSync": true})));
        n.set_filter(Some(cond));

        let trx = begin(&f.ctx);
        let mut exec = n.create_executor(&f.plan, &f.ctx, &trx, &no_bindings).unwrap();
        assert!(matches!(exec.strategy(), Strategy::Iterate(_)));
        let rows = exec.collect_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r[&f.doc]["t"] == json!("a")));

        exec.reset();
        assert_eq!(exec.skip(5).unwrap(), 2);
    }

    #[test]
    fn test_heap_sort_emits_at_most_limit() {
        let mut f = fixture(json!({"primarySort": [{"field": "n", "asc": true}]}));
        write(&f.ctx, "c1", (0..10).map(|n| json!({"n": n})).collect());
        write(&f.ctx, "c2", (10..15).map(|n| json!({"n": n})).collect());
        let mut n = node(&mut f, Some(json!({"waitForSync": true})));
        n.set_heap_sort(
            vec![HeapSortElement {
                source: SortSource::Column {
                    column: SORT_COLUMN,
                    field: 0,
                },
                ascending: false,
                postfix: vec![],
            }],
            3,
        )
        .unwrap();

        let trx = begin(&f.ctx);
        let mut exec = n.create_executor(&f.plan, &f.ctx, &trx, &no_bindings).unwrap();
        let rows = exec.collect_rows().unwrap();
        let ns: Vec<Value> = rows.iter().map(|r| r[&f.doc]["n"].clone()).collect();
        assert_eq!(ns, vec![json!(14), json!(13), json!(12)]);
    }

    #[test]
    fn test_late_materialization_with_stored_values_and_scores() {
        let mut f = fixture(json!({"storedValues": [["t", "n"]]}));
        write(&f.ctx, "c1", vec![json!({"t": "x", "n": 1}), json!({"t": "y", "n": 2})]);
        let nm = f.plan.create_variable("nm");
        let v = f.plan.create_variable("v");
        let score = f.plan.create_variable("score");
        let d = f.plan.arena_mut().reference(f.doc);
        let bm25 = f.plan.arena_mut().call("BM25", vec![d]);

        let mut n = node(&mut f, Some(json!({"waitForSync": true})));
        n.set_scorers(&mut f.plan, vec![SearchScorer { var: score, expr: bm25 }])
            .unwrap();
        n.set_late_materialized(&mut f.plan, nm).unwrap();
        n.set_view_values(&mut f.plan, 0, vec![ViewValuesVar { field: 0, var: v }])
            .unwrap();
        let key = n.executor_key();
        assert_eq!(key.materialize, MaterializeMode::LateMaterialize);
        assert!(key.use_stored_values && key.ordered);

        let trx = begin(&f.ctx);
        let mut exec = n.create_executor(&f.plan, &f.ctx, &trx, &no_bindings).unwrap();
        let rows = exec.collect_rows().unwrap();
        assert_eq!(rows.len(), 2);
        let mut values: Vec<&str> = rows.iter().map(|r| r[&v].as_str().unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, vec!["x", "y"]);
        for row in &rows {
            assert!(row[&nm]["pk"].is_u64());
            assert!(row.contains_key(&score));
            assert!(!row.contains_key(&f.doc));
        }
    }

    #[test]
    fn test_volatile_filter_rearms() {
        let mut f = fixture(json!({}));
        write(&f.ctx, "c1", (0..6).map(|n| json!({"n": n})).collect());
        let x = f.plan.create_variable("x");
        let outer = f
            .plan
            .add_node(NodeKind::EnumerateList, ROOT_NODE, vec![x])
            .unwrap();
        let arena = f.plan.arena_mut();
        let lhs = arena.attribute_path(f.doc, "n");
        let rhs = arena.reference(x);
        let cond = arena.compare(CompareOp::Ge, lhs, rhs);
        let options = f.plan.arena_mut().object_from_json(&json!({"waitForSync": true}));
        let mut n = SearchNode::new(
            &mut f.plan,
            &f.ctx,
            outer,
            Arc::clone(&f.view),
            f.doc,
            Some(cond),
            Some(options),
            vec![],
        )
        .unwrap();
        assert_eq!(n.volatility(&f.plan, false), (true, false));

        let trx = begin(&f.ctx);
        let at = |v: i64| move |var: VariableId| (var == x).then(|| json!(v));
        let mut exec = n.create_executor(&f.plan, &f.ctx, &trx, &at(4)).unwrap();
        assert_eq!(exec.collect_rows().unwrap().len(), 2);
        assert!(exec.rearm(&n, &f.plan, &at(1)).unwrap());
        assert_eq!(exec.collect_rows().unwrap().len(), 5);
    }
}
