//! Search node behavior tests
//!
//! These tests verify that:
//! 1. A `collections` restriction limits both the node's collections and
//!    the segments of its snapshot
//! 2. Indexes marked out of sync fail or warn according to policy
//! 3. Data servers read only their assigned, admitted shards
//! 4. A node restored from its persisted record runs like the original

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{
    CompareOp, DataSourceId, IndexMeta, OutOfSyncPolicy, SearchConfig, ServerRole, ShardId, VariableId,
};
use tessera_query::{ExecutionPlan, QueryContext, SearchNode, Strategy, ROOT_NODE};
use tessera_search::{Catalog, SearchView, Transaction, TrxOptions};

struct Env {
    _dir: TempDir,
    ctx: QueryContext,
    view: Arc<SearchView>,
}

fn setup(config: SearchConfig) -> Env {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::new(ServerRole::Single, dir.path()));
    let view = catalog.create_view("v", IndexMeta::default()).unwrap();
    for name in ["c1", "c2"] {
        let c = catalog.create_collection(name).unwrap();
        catalog.link(&view, &c).unwrap();
    }
    Env {
        _dir: dir,
        ctx: QueryContext::new(catalog, config),
        view,
    }
}

fn write(catalog: &Arc<Catalog>, collection: &str, docs: Vec<Value>) {
    let c = catalog.collection_by_name(collection).unwrap();
    let trx = Transaction::begin(Arc::clone(catalog), TrxOptions::default()).unwrap();
    for d in docs {
        trx.insert(&c, d).unwrap();
    }
    trx.commit().unwrap();
}

fn begin(catalog: &Arc<Catalog>) -> Transaction {
    Transaction::begin(Arc::clone(catalog), TrxOptions::default()).unwrap()
}

fn search(env: &Env, plan: &mut ExecutionPlan, doc: VariableId, options: Value) -> tessera_core::Result<SearchNode> {
    let options = plan.arena_mut().object_from_json(&options);
    SearchNode::new(plan, &env.ctx, ROOT_NODE, Arc::clone(&env.view), doc, None, Some(options), vec![])
}

fn no_bindings(_: VariableId) -> Option<Value> {
    None
}

// === Collections Restriction ===

#[test]
fn test_restriction_limits_collections_and_segments() {
    let env = setup(SearchConfig::default());
    let catalog = Arc::clone(env.ctx.catalog());
    write(&catalog, "c1", vec![json!({"k": 1}), json!({"k": 2})]);
    write(&catalog, "c2", vec![json!({"k": 3})]);
    let c1 = catalog.collection_by_name("c1").unwrap();

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let node = search(&env, &mut plan, doc, json!({"collections": ["c1"], "waitForSync": true})).unwrap();

    let ids: Vec<DataSourceId> = node.collections(&env.ctx).iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![c1.id()]);

    let trx = begin(&catalog);
    let snapshot = node.snapshot(&env.ctx, &trx).unwrap();
    assert_eq!(snapshot.sources(), vec![c1.id()]);
    assert!(snapshot.segments().count() > 0);
    assert_eq!(snapshot.live_docs_count(), 2);

    let rows = node
        .create_executor(&plan, &env.ctx, &trx, &no_bindings)
        .unwrap()
        .collect_rows()
        .unwrap();
    let mut ks: Vec<i64> = rows.iter().map(|r| r[&doc]["k"].as_i64().unwrap()).collect();
    ks.sort_unstable();
    assert_eq!(ks, vec![1, 2]);
}

#[test]
fn test_unlinked_source_rejected() {
    let env = setup(SearchConfig::default());
    let other = env.ctx.catalog().create_collection("c3").unwrap();
    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");

    let err = search(&env, &mut plan, doc, json!({"collections": ["c1", other.id().get()]})).unwrap_err();
    assert!(err.is_bad_parameter());
    let msg = err.to_string();
    assert!(msg.contains("only 1 out of 2 provided collection(s)"), "{}", msg);
    assert!(msg.contains(&other.id().to_string()), "{}", msg);
}

#[test]
fn test_unknown_option_is_a_warning() {
    let env = setup(SearchConfig::default());
    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    search(&env, &mut plan, doc, json!({"bogus": 1})).unwrap();
    assert_eq!(env.ctx.warnings(), vec!["unknown attribute 'bogus' in OPTIONS of FOR".to_string()]);
}

// === Out Of Sync ===

fn mark_out_of_sync(view: &SearchView) {
    let link = view.links().into_iter().next().unwrap();
    assert!(link.store.lock().unwrap().set_out_of_sync());
}

#[test]
fn test_out_of_sync_fails_under_fail_policy() {
    let env = setup(SearchConfig::default());
    write(env.ctx.catalog(), "c1", vec![json!({"k": 1})]);
    mark_out_of_sync(&env.view);

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let node = search(&env, &mut plan, doc, json!({"waitForSync": true})).unwrap();
    let trx = begin(env.ctx.catalog());
    let err = node.create_executor(&plan, &env.ctx, &trx, &no_bindings).unwrap_err();
    assert!(err.is_out_of_sync());
    assert!(err.to_string().contains("is out of sync and needs to be recreated"));
}

#[test]
fn test_out_of_sync_warns_under_warn_policy() {
    let env = setup(SearchConfig {
        out_of_sync_policy: OutOfSyncPolicy::Warn,
        ..SearchConfig::default()
    });
    write(env.ctx.catalog(), "c1", vec![json!({"k": 1})]);
    mark_out_of_sync(&env.view);

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let node = search(&env, &mut plan, doc, json!({"waitForSync": true})).unwrap();
    let trx = begin(env.ctx.catalog());
    let rows = node
        .create_executor(&plan, &env.ctx, &trx, &no_bindings)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 1);
    let warnings = env.ctx.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("out of sync"));
}

#[test]
fn test_out_of_sync_link_outside_restriction_ignored() {
    let env = setup(SearchConfig::default());
    let catalog = Arc::clone(env.ctx.catalog());
    write(&catalog, "c2", vec![json!({"k": 1})]);
    // The first link belongs to c1
    mark_out_of_sync(&env.view);

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let node = search(&env, &mut plan, doc, json!({"collections": ["c2"], "waitForSync": true})).unwrap();
    let trx = begin(&catalog);
    let rows = node
        .create_executor(&plan, &env.ctx, &trx, &no_bindings)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 1);
}

// === Cluster Roles ===

#[test]
fn test_db_server_reads_admitted_shards() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::new(ServerRole::DbServer, dir.path()));
    let view = catalog.create_view("v", IndexMeta::default()).unwrap();
    let (users, orders) = (DataSourceId(100), DataSourceId(200));
    for (shard, plan_id) in [("s1001", users), ("s1002", users), ("s2001", orders)] {
        let s = catalog.create_shard(&ShardId::new(shard), plan_id).unwrap();
        catalog.link(&view, &s).unwrap();
    }
    write(&catalog, "s1001", vec![json!({"k": 1})]);
    write(&catalog, "s1002", vec![json!({"k": 2})]);
    write(&catalog, "s2001", vec![json!({"k": 3})]);
    let ctx = QueryContext::new(Arc::clone(&catalog), SearchConfig::default());

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let node = SearchNode::new(&mut plan, &ctx, ROOT_NODE, Arc::clone(&view), doc, None, None, vec![]).unwrap();
    assert_eq!(node.shards().len(), 3);

    // Options arrive from the coordinator already resolved to logical ids
    let mut record = node.to_json(&plan);
    record["options"]["collections"] = json!([users.get()]);
    record["options"]["waitForSync"] = json!(true);
    record["shards"].as_array_mut().unwrap().push(json!("s9999"));
    let restored = SearchNode::from_json(&mut plan, &ctx, ROOT_NODE, &record).unwrap();
    assert_eq!(restored.shards().len(), 3);

    let trx = begin(&catalog);
    let snapshot = restored.snapshot(&ctx, &trx).unwrap();
    assert_eq!(snapshot.live_docs_count(), 2);
    assert_eq!(snapshot.sources().len(), 2);
    assert_eq!(restored.collections(&ctx).len(), 2);
}

#[test]
fn test_coordinator_never_touches_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::new(ServerRole::Coordinator, dir.path()));
    let view = catalog.create_view("v", IndexMeta::default()).unwrap();
    let c = catalog.create_collection("c1").unwrap();
    catalog.link(&view, &c).unwrap();
    let ctx = QueryContext::new(Arc::clone(&catalog), SearchConfig::default());

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let node = SearchNode::new(&mut plan, &ctx, ROOT_NODE, view, doc, None, None, vec![]).unwrap();
    let trx = begin(&catalog);
    let mut exec = node.create_executor(&plan, &ctx, &trx, &no_bindings).unwrap();
    assert_eq!(exec.strategy(), Strategy::NoResults);
    assert!(exec.collect_rows().unwrap().is_empty());
}

// === Persisted Plans ===

#[test]
fn test_restored_node_produces_same_rows() {
    let env = setup(SearchConfig::default());
    let catalog = Arc::clone(env.ctx.catalog());
    write(
        &catalog,
        "c1",
        vec![json!({"t": "a", "n": 1}), json!({"t": "b", "n": 2}), json!({"t": "a", "n": 3})],
    );

    let mut plan = ExecutionPlan::new();
    let doc = plan.create_variable("d");
    let arena = plan.arena_mut();
    let lhs = arena.attribute_path(doc, "t");
    let rhs = arena.value(json!("a"));
    let cond = arena.compare(CompareOp::Eq, lhs, rhs);
    let options = plan.arena_mut().object_from_json(&json!({"waitForSync": true}));
    let node = SearchNode::new(
        &mut plan,
        &env.ctx,
        ROOT_NODE,
        Arc::clone(&env.view),
        doc,
        Some(cond),
        Some(options),
        vec![],
    )
    .unwrap();

    let record = node.to_json(&plan);
    let text = serde_json::to_string(&record).unwrap();
    let mut fresh = ExecutionPlan::new();
    let restored = SearchNode::from_json(&mut fresh, &env.ctx, ROOT_NODE, &serde_json::from_str(&text).unwrap()).unwrap();
    assert_eq!(restored.to_json(&fresh), record);

    let run = |n: &SearchNode, p: &ExecutionPlan| {
        let trx = begin(&catalog);
        let mut ns: Vec<i64> = n
            .create_executor(p, &env.ctx, &trx, &no_bindings)
            .unwrap()
            .collect_rows()
            .unwrap()
            .iter()
            .map(|r| r[&doc]["n"].as_i64().unwrap())
            .collect();
        ns.sort_unstable();
        ns
    };
    assert_eq!(run(&node, &plan), vec![1, 3]);
    assert_eq!(run(&restored, &fresh), vec![1, 3]);
}
