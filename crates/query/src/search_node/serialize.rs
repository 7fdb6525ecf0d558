//! Persisted form of the search node
//!
//! The record is self-describing JSON. Expressions are written through the
//! arena's own JSON form and read back into the target plan's arena;
//! variables keep their ids. Volatility is persisted as computed and never
//! re-derived on load.

use super::{SearchNode, SearchOptions, SearchScorer, ViewValuesVar, VOLATILITY_UNKNOWN};
use crate::context::QueryContext;
use crate::plan::{ExecutionPlan, NodeKind, Variable};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::value::{join_path, parse_path};
use tessera_core::{Error, IndexId, PlanNodeId, Result, ShardId, VariableId, ViewId, MATCH_ALL};
use tessera_search::{HeapSortElement, SearchView, SortSource, SORT_COLUMN};
use tracing::debug;

/// Marker field of plans written by an incompatible older protocol
const LEGACY_MARKER: &str = "outNmColPtr";

fn bad(msg: impl Into<String>) -> Error {
    Error::bad_parameter(msg)
}

fn field<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.get(key).filter(|v| !v.is_null())
}

fn variable(plan: &mut ExecutionPlan, v: &Value, key: &str) -> Result<Option<VariableId>> {
    match field(v, key) {
        None => Ok(None),
        Some(var) => {
            let var = Variable::from_json(var).map_err(|e| bad(format!("invalid '{}': {}", key, e)))?;
            Ok(Some(plan.register_variable(var)))
        }
    }
}

fn usize_field(v: &Value, key: &str) -> Result<usize> {
    v.get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| bad(format!("'{}' attribute should be a non-negative integer", key)))
}

impl SearchNode {
    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Persisted record of the node
    pub fn to_json(&self, plan: &ExecutionPlan) -> Value {
        let arena = plan.arena();
        let mut m = Map::new();
        m.insert("id".into(), json!(self.id.get()));
        m.insert("view".into(), json!(self.view.name()));
        m.insert("viewId".into(), json!(self.view.id().to_string()));
        m.insert("outVariable".into(), plan.variable_json(self.out_variable));
        if let Some(var) = self.out_search_doc {
            m.insert("outSearchDocId".into(), plan.variable_json(var));
        }
        if let Some(var) = self.out_nm_doc {
            m.insert("outNmDocId".into(), plan.variable_json(var));
        }
        if self.no_materialization {
            m.insert("noMaterialization".into(), json!(true));
        }

        if !self.heap_sort.is_empty() {
            m.insert("heapSortLimit".into(), json!(self.heap_sort_limit));
            let elements: Vec<Value> = self.heap_sort.iter().map(heap_sort_element_json).collect();
            m.insert("heapSort".into(), Value::Array(elements));
        }

        m.insert("viewValuesVars".into(), self.view_values_json(plan));

        let condition = if self.filter == MATCH_ALL {
            json!({})
        } else {
            arena.to_json(self.filter)
        };
        m.insert("condition".into(), condition);

        let scorers: Vec<Value> = self
            .scorers
            .iter()
            .map(|s| {
                let var = plan.variable_json(s.var);
                json!({"id": var["id"], "name": var["name"], "node": arena.to_json(s.expr)})
            })
            .collect();
        m.insert("scorers".into(), Value::Array(scorers));

        let shards: Vec<&str> = self.shards.keys().map(ShardId::as_str).collect();
        m.insert("shards".into(), json!(shards));
        let mut indexes = Vec::new();
        for (offset, ids) in self.shards.values().enumerate() {
            for id in ids {
                indexes.push(json!(id.get()));
                indexes.push(json!(offset));
            }
        }
        m.insert("indexes".into(), Value::Array(indexes));

        m.insert("options".into(), self.options.to_json());
        m.insert("volatility".into(), json!(self.volatility));
        if self.immutable_parts != 0 {
            m.insert("immutableParts".into(), json!(self.immutable_parts + 1));
        }
        if let Some(buckets) = self.sort_buckets {
            m.insert("primarySortBuckets".into(), json!(buckets));
        }
        Value::Object(m)
    }

    fn view_values_json(&self, plan: &ExecutionPlan) -> Value {
        let meta = self.view.meta();
        let entry = |name: String, v: &ViewValuesVar| {
            let var = plan.variable_json(v.var);
            json!({"fieldNumber": v.field, "id": var["id"], "name": var["name"], "field": name})
        };
        let mut out = Vec::new();
        for (column, vars) in &self.out_values {
            if *column == SORT_COLUMN {
                for v in vars {
                    let name = meta
                        .primary_sort
                        .fields()
                        .get(v.field)
                        .map(|f| join_path(&f.path))
                        .unwrap_or_default();
                    out.push(entry(name, v));
                }
            } else {
                let fields = meta
                    .stored_values
                    .columns()
                    .get(*column as usize)
                    .map(|c| c.fields.as_slice())
                    .unwrap_or_default();
                let stored: Vec<Value> = vars
                    .iter()
                    .map(|v| entry(fields.get(v.field).map(|p| join_path(p)).unwrap_or_default(), v))
                    .collect();
                out.push(json!({"columnNumber": column, "viewStoredValuesVars": stored}));
            }
        }
        Value::Array(out)
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Rebuild a node from its persisted record, registering it in `plan`
    /// after `dependency`
    pub fn from_json(plan: &mut ExecutionPlan, ctx: &QueryContext, dependency: PlanNodeId, v: &Value) -> Result<Self> {
        if v.get(LEGACY_MARKER).is_some() {
            return Err(bad(
                "Incompatible search node parameters: the plan was written by an older version",
            ));
        }
        let view = resolve_view(ctx, v)?;

        let out_variable = variable(plan, v, "outVariable")?
            .ok_or_else(|| bad("search node requires 'outVariable'"))?;
        let out_search_doc = variable(plan, v, "outSearchDocId")?;
        let out_nm_doc = variable(plan, v, "outNmDocId")?;

        let filter = match field(v, "condition") {
            None => MATCH_ALL,
            Some(Value::Object(o)) if o.is_empty() => MATCH_ALL,
            Some(c @ Value::Object(_)) => plan.arena_mut().from_json(c)?,
            Some(_) => return Err(bad("'condition' attribute should be an object")),
        };

        let scorers = read_scorers(plan, v)?;
        let shards = read_shards(ctx, v)?;
        let options = match field(v, "options") {
            Some(o) => SearchOptions::from_json(o)?,
            None => SearchOptions::default(),
        };

        let volatility = match field(v, "volatility") {
            Some(n) => n
                .as_i64()
                .map(|n| n as i32)
                .ok_or_else(|| bad("'volatility' attribute should be an integer"))?,
            None => VOLATILITY_UNKNOWN,
        };
        let immutable_parts = match field(v, "immutableParts") {
            Some(n) => n
                .as_u64()
                .map(|n| (n as usize).saturating_sub(1))
                .ok_or_else(|| bad("'immutableParts' attribute should be an integer"))?,
            None => 0,
        };

        let sort_buckets = match field(v, "primarySortBuckets") {
            None => None,
            Some(n) => {
                let buckets = n
                    .as_u64()
                    .ok_or_else(|| bad("'primarySortBuckets' attribute should be an integer"))?
                    as usize;
                let size = view.meta().primary_sort.size();
                if buckets > size {
                    return Err(bad(format!(
                        "invalid value for 'primarySortBuckets': {} is greater than number of buckets {}",
                        buckets, size
                    )));
                }
                Some(buckets)
            }
        };

        let no_materialization = match field(v, "noMaterialization") {
            Some(flag) => flag
                .as_bool()
                .ok_or_else(|| bad("'noMaterialization' attribute should be a boolean"))?,
            None => false,
        };

        let id = plan.add_node(NodeKind::Search, dependency, Vec::new())?;
        let mut node = SearchNode {
            id,
            view,
            out_variable,
            out_search_doc,
            out_nm_doc,
            no_materialization,
            out_values: BTreeMap::new(),
            filter,
            scorers,
            sort_buckets,
            heap_sort: Vec::new(),
            heap_sort_limit: 0,
            shards,
            options,
            volatility,
            immutable_parts,
        };
        node.out_values = read_view_values(&node, plan, v)?;
        let (heap_sort, limit) = read_heap_sort(&node, v)?;
        node.heap_sort = heap_sort;
        node.heap_sort_limit = limit;
        if node.sort_buckets.is_some() && !node.heap_sort.is_empty() {
            return Err(bad("search node cannot use both primary sort and heap sort"));
        }
        node.publish_variables(plan)?;
        debug!(target: "tessera::search", node = %node.id, view = %node.view.name(), "search node restored");
        Ok(node)
    }
}

fn heap_sort_element_json(e: &HeapSortElement) -> Value {
    let (source, field) = match e.source {
        SortSource::Score(idx) => (idx as i64, -1),
        SortSource::Column { column, field } => (column as i64, field as i64),
    };
    json!({
        "source": source,
        "field": field,
        "asc": e.ascending,
        "postfix": join_path(&e.postfix),
    })
}

fn resolve_view(ctx: &QueryContext, v: &Value) -> Result<Arc<SearchView>> {
    let view_id = v
        .get("viewId")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("'viewId' attribute should be a string"))?;
    let catalog = ctx.catalog();
    let view = if ctx.role().is_cluster() {
        catalog.lookup_view(view_id)
    } else {
        view_id.parse::<u64>().ok().and_then(|id| catalog.view(ViewId(id)))
    };
    view.ok_or_else(|| Error::not_found(format!("unable to find search view with id '{}'", view_id)))
}

fn read_scorers(plan: &mut ExecutionPlan, v: &Value) -> Result<Vec<SearchScorer>> {
    let Some(items) = field(v, "scorers") else {
        return Ok(Vec::new());
    };
    let items = items
        .as_array()
        .ok_or_else(|| bad("'scorers' attribute should be an array"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let var = Variable::from_json(item).map_err(|e| bad(format!("invalid scorer: {}", e)))?;
        let node = item
            .get("node")
            .ok_or_else(|| bad("scorer requires a 'node' attribute"))?;
        let expr = plan.arena_mut().from_json(node)?;
        let var = plan.register_variable(var);
        out.push(SearchScorer { var, expr });
    }
    Ok(out)
}

fn read_shards(ctx: &QueryContext, v: &Value) -> Result<BTreeMap<ShardId, Vec<IndexId>>> {
    let Some(shards) = field(v, "shards") else {
        return Ok(BTreeMap::new());
    };
    let shards = shards
        .as_array()
        .ok_or_else(|| bad("'shards' attribute should be an array"))?;
    let indexes: Vec<u64> = match field(v, "indexes") {
        None => Vec::new(),
        Some(ids) => ids
            .as_array()
            .ok_or_else(|| bad("'indexes' attribute should be an array"))?
            .iter()
            .map(|i| i.as_u64().ok_or_else(|| bad("'indexes' attribute should hold integers")))
            .collect::<Result<_>>()?,
    };
    if indexes.len() % 2 != 0 {
        return Err(bad("'indexes' attribute should hold (index, shard) pairs"));
    }

    // Shards unknown on this server are skipped, and their offsets with them
    let mut by_offset: Vec<Option<ShardId>> = Vec::with_capacity(shards.len());
    for shard in shards {
        let name = shard
            .as_str()
            .ok_or_else(|| bad("'shards' attribute should hold strings"))?;
        let shard = ShardId::new(name);
        if ctx.catalog().shard(&shard).is_some() {
            by_offset.push(Some(shard));
        } else {
            debug!(target: "tessera::search", shard = %shard, "skipping unknown shard");
            by_offset.push(None);
        }
    }

    let mut out: BTreeMap<ShardId, Vec<IndexId>> = BTreeMap::new();
    for pair in indexes.chunks_exact(2) {
        let offset = pair[1] as usize;
        let slot = by_offset
            .get(offset)
            .ok_or_else(|| bad(format!("shard offset {} is out of range", offset)))?;
        if let Some(shard) = slot {
            out.entry(shard.clone()).or_default().push(IndexId(pair[0]));
        }
    }
    for shard in by_offset.into_iter().flatten() {
        out.entry(shard).or_default();
    }
    Ok(out)
}

fn read_view_values(node: &SearchNode, plan: &mut ExecutionPlan, v: &Value) -> Result<BTreeMap<isize, Vec<ViewValuesVar>>> {
    let mut out: BTreeMap<isize, Vec<ViewValuesVar>> = BTreeMap::new();
    let Some(entries) = field(v, "viewValuesVars") else {
        return Ok(out);
    };
    let entries = entries
        .as_array()
        .ok_or_else(|| bad("'viewValuesVars' attribute should be an array"))?;
    let read_var = |plan: &mut ExecutionPlan, column: isize, entry: &Value| -> Result<ViewValuesVar> {
        let field = usize_field(entry, "fieldNumber")?;
        let width = node
            .column_width(column)
            .ok_or_else(|| bad(format!("'columnNumber' {} is out of range", column)))?;
        if field >= width {
            return Err(bad(format!("'fieldNumber' {} is out of range of column {}", field, column)));
        }
        let var = Variable::from_json(entry).map_err(|e| bad(format!("invalid view value variable: {}", e)))?;
        Ok(ViewValuesVar {
            field,
            var: plan.register_variable(var),
        })
    };
    for entry in entries {
        match entry.get("columnNumber") {
            Some(column) => {
                let column = column
                    .as_u64()
                    .ok_or_else(|| bad("'columnNumber' attribute should be a non-negative integer"))?
                    as isize;
                let vars = entry
                    .get("viewStoredValuesVars")
                    .and_then(Value::as_array)
                    .ok_or_else(|| bad("'viewStoredValuesVars' attribute should be an array"))?;
                for var in vars {
                    let parsed = read_var(plan, column, var)?;
                    out.entry(column).or_default().push(parsed);
                }
            }
            None => {
                let parsed = read_var(plan, SORT_COLUMN, entry)?;
                out.entry(SORT_COLUMN).or_default().push(parsed);
            }
        }
    }
    Ok(out)
}

fn read_heap_sort(node: &SearchNode, v: &Value) -> Result<(Vec<HeapSortElement>, usize)> {
    if let Some(items) = field(v, "heapSort") {
        let items = items
            .as_array()
            .ok_or_else(|| bad("'heapSort' attribute should be an array"))?;
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let attr = |name: &str| bad(format!("'heapSort[{}].{}' attribute is invalid", i, name));
            let source = item.get("source").and_then(Value::as_i64).ok_or_else(|| attr("source"))?;
            let field = item.get("field").and_then(Value::as_i64).ok_or_else(|| attr("field"))?;
            let ascending = item.get("asc").and_then(Value::as_bool).ok_or_else(|| attr("asc"))?;
            let postfix = item.get("postfix").and_then(Value::as_str).ok_or_else(|| attr("postfix"))?;
            let source = if field < 0 {
                SortSource::Score(usize::try_from(source).map_err(|_| attr("source"))?)
            } else {
                SortSource::Column {
                    column: source as isize,
                    field: field as usize,
                }
            };
            node.check_sort_source(&source, i)?;
            out.push(HeapSortElement {
                source,
                ascending,
                postfix: if postfix.is_empty() { Vec::new() } else { parse_path(postfix) },
            });
        }
        let limit = usize_field(v, "heapSortLimit")?;
        if !out.is_empty() && limit == 0 {
            return Err(bad("'heapSortLimit' attribute should be positive"));
        }
        return Ok((out, limit));
    }

    // Older plans describe score-only top-K as 'scorersSort'
    match (field(v, "scorersSort"), field(v, "scorersSortLimit")) {
        (None, None) => Ok((Vec::new(), 0)),
        (Some(items), Some(_)) => {
            let items = items
                .as_array()
                .ok_or_else(|| bad("'scorersSort' attribute should be an array"))?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let index = usize_field(item, "index")?;
                if index >= node.scorers.len() {
                    return Err(bad(format!("'scorersSort[{}].index' attribute is out of range", i)));
                }
                let ascending = item
                    .get("asc")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| bad(format!("'scorersSort[{}].asc' attribute should be a boolean", i)))?;
                out.push(HeapSortElement {
                    source: SortSource::Score(index),
                    ascending,
                    postfix: Vec::new(),
                });
            }
            let limit = usize_field(v, "scorersSortLimit")?;
            if !out.is_empty() && limit == 0 {
                return Err(bad("'scorersSortLimit' attribute should be positive"));
            }
            Ok((out, limit))
        }
        _ => Err(bad(
            "'scorersSort' and 'scorersSortLimit' attributes must be both present or both absent",
        )),
    }
}
