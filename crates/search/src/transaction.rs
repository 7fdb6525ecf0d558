//! Transactions and transaction-scoped state
//!
//! A [`Transaction`] carries two kinds of state for the search layer:
//!
//! - view snapshots, keyed by [`CacheKey`], so every read of a view inside
//!   one transaction sees the same data;
//! - one [`IndexTrxState`] per index the transaction wrote to, which pins the
//!   data store and buffers the transaction's operations until commit.
//!
//! Both are dropped when the transaction ends, which releases every strong
//! lock and pinned snapshot it held.

use crate::catalog::{Catalog, Collection};
use crate::view_snapshot::ViewSnapshot;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{
    DataSourceId, Error, IndexId, LocalDocumentId, PlanNodeId, Result, Tick, ViewId,
};
use tessera_storage::{AsyncHandle, DataStore, IndexTrxState};
use tracing::{debug, warn};

static NEXT_TRX_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxStatus {
    /// Accepting reads and writes
    Running,
    /// Committed
    Committed,
    /// Aborted
    Aborted,
}

/// Transaction options
#[derive(Debug, Clone)]
pub struct TrxOptions {
    /// Streaming or scripted transaction managed outside the query
    pub globally_managed: bool,
    /// Top-level transaction of a query (not a nested one)
    pub main: bool,
    /// Views whose snapshot is captured when the transaction begins
    pub read_views: Vec<ViewId>,
}

impl Default for TrxOptions {
    fn default() -> Self {
        TrxOptions {
            globally_managed: false,
            main: true,
            read_views: Vec::new(),
        }
    }
}

/// Key under which a view snapshot is cached on a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Every unrestricted read of a view shares one snapshot
    View(ViewId),
    /// Reads restricted to some sources are keyed by the reading plan node
    Node(ViewId, PlanNodeId),
}

enum DocOp {
    Insert(DataSourceId, LocalDocumentId, Value),
    Remove(DataSourceId, LocalDocumentId),
}

struct IndexWrite {
    handle: AsyncHandle<DataStore>,
    state: IndexTrxState,
}

/// A transaction over the catalog's collections and their search indexes
pub struct Transaction {
    id: u64,
    catalog: Arc<Catalog>,
    options: TrxOptions,
    status: Mutex<TrxStatus>,
    snapshots: DashMap<CacheKey, Arc<ViewSnapshot>>,
    synced: DashSet<CacheKey>,
    implicit: FxHashMap<ViewId, Arc<ViewSnapshot>>,
    writes: Mutex<FxHashMap<IndexId, IndexWrite>>,
    doc_ops: Mutex<Vec<DocOp>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &*self.status.lock())
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

impl Transaction {
    /// Begin a transaction. Snapshots of `options.read_views` are captured
    /// immediately.
    pub fn begin(catalog: Arc<Catalog>, options: TrxOptions) -> Result<Self> {
        let mut implicit = FxHashMap::default();
        for view_id in &options.read_views {
            let view = catalog
                .view(*view_id)
                .ok_or_else(|| Error::not_found(format!("view '{}' not found", view_id)))?;
            let links = view.lock_links(None)?;
            implicit.insert(*view_id, Arc::new(ViewSnapshot::build(&links, false)?));
        }
        let id = NEXT_TRX_ID.fetch_add(1, Ordering::Relaxed);
        debug!(target: "tessera::search", trx = id, "transaction started");
        Ok(Transaction {
            id,
            catalog,
            options,
            status: Mutex::new(TrxStatus::Running),
            snapshots: DashMap::new(),
            synced: DashSet::new(),
            implicit,
            writes: Mutex::new(FxHashMap::default()),
            doc_ops: Mutex::new(Vec::new()),
        })
    }

    /// Transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Catalog the transaction runs against
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Options given at begin
    pub fn options(&self) -> &TrxOptions {
        &self.options
    }

    /// Current status
    pub fn status(&self) -> TrxStatus {
        *self.status.lock()
    }

    /// True while the transaction accepts work
    pub fn is_running(&self) -> bool {
        self.status() == TrxStatus::Running
    }

    /// Error unless the transaction is running
    pub fn ensure_running(&self) -> Result<()> {
        match self.status() {
            TrxStatus::Running => Ok(()),
            other => Err(Error::internal(format!(
                "failed to get transaction state: transaction {} is {:?}",
                self.id, other
            ))),
        }
    }

    // ========================================================================
    // Snapshot registry
    // ========================================================================

    /// Snapshot cached under `key`
    pub fn cached_snapshot(&self, key: &CacheKey) -> Option<Arc<ViewSnapshot>> {
        self.snapshots.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Cache `snapshot` under `key`, replacing any earlier one
    pub fn register_snapshot(&self, key: CacheKey, snapshot: Arc<ViewSnapshot>) {
        self.snapshots.insert(key, snapshot);
    }

    /// Snapshot of `view` captured when the transaction began
    pub fn implicit_snapshot(&self, view: ViewId) -> Option<Arc<ViewSnapshot>> {
        self.implicit.get(&view).cloned()
    }

    /// True once a synchronized snapshot was built for `key`
    pub fn is_synced(&self, key: &CacheKey) -> bool {
        self.synced.contains(key)
    }

    /// Remember that `key` was synchronized; false if it already was
    pub fn mark_synced(&self, key: CacheKey) -> bool {
        self.synced.insert(key)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn with_index_states(
        &self,
        collection: &Collection,
        mut f: impl FnMut(&mut IndexTrxState),
    ) -> Result<()> {
        let mut writes = self.writes.lock();
        for (index, handle) in collection.indexes() {
            if !writes.contains_key(&index) {
                let state = IndexTrxState::begin(&handle)?;
                writes.insert(index, IndexWrite { handle, state });
            }
            if let Some(w) = writes.get_mut(&index) {
                f(&mut w.state);
            }
        }
        Ok(())
    }

    /// Insert a document; returns its new id
    pub fn insert(&self, collection: &Collection, doc: Value) -> Result<LocalDocumentId> {
        self.ensure_running()?;
        let pk = collection.next_document_id();
        self.with_index_states(collection, |s| s.insert(pk, doc.clone()))?;
        self.doc_ops.lock().push(DocOp::Insert(collection.id(), pk, doc));
        Ok(pk)
    }

    /// Replace the document stored under `pk`
    pub fn update(&self, collection: &Collection, pk: LocalDocumentId, doc: Value) -> Result<()> {
        self.ensure_running()?;
        self.with_index_states(collection, |s| {
            s.remove(pk);
            s.insert(pk, doc.clone());
        })?;
        self.doc_ops.lock().push(DocOp::Insert(collection.id(), pk, doc));
        Ok(())
    }

    /// Remove a document
    pub fn remove(&self, collection: &Collection, pk: LocalDocumentId) -> Result<()> {
        self.ensure_running()?;
        self.with_index_states(collection, |s| s.remove(pk))?;
        self.doc_ops.lock().push(DocOp::Remove(collection.id(), pk));
        Ok(())
    }

    /// Commit: apply document writes and hand every index batch to its
    /// writer. Indexes become readable after their next data-store commit.
    ///
    /// An index that rejects its batch is marked out of sync; the
    /// transaction itself still commits.
    pub fn commit(&self) -> Result<Tick> {
        self.ensure_running()?;
        let tick = self.catalog.next_tick();
        let mut by_source: BTreeMap<DataSourceId, Vec<(LocalDocumentId, Option<Value>)>> = BTreeMap::new();
        for op in self.doc_ops.lock().drain(..) {
            match op {
                DocOp::Insert(source, pk, doc) => by_source.entry(source).or_default().push((pk, Some(doc))),
                DocOp::Remove(source, pk) => by_source.entry(source).or_default().push((pk, None)),
            }
        }
        let mut writes = std::mem::take(&mut *self.writes.lock());
        for (source, ops) in &by_source {
            let Some(collection) = self.catalog.collection(*source) else {
                continue;
            };
            for (index, handle) in collection.apply_documents(ops) {
                if writes.contains_key(&index) {
                    continue;
                }
                // Linked after these writes were buffered; replay them
                let Ok(mut state) = IndexTrxState::begin(&handle) else {
                    continue;
                };
                for (pk, doc) in ops {
                    state.remove(*pk);
                    if let Some(doc) = doc {
                        state.insert(*pk, doc.clone());
                    }
                }
                writes.insert(index, IndexWrite { handle, state });
            }
        }
        for (index, write) in writes {
            if let Err(e) = write.state.commit(tick) {
                warn!(
                    target: "tessera::search",
                    trx = self.id,
                    index = %index,
                    error = %e,
                    "failed to commit index batch, marking index out of sync"
                );
                if let Some(store) = write.handle.lock() {
                    store.set_out_of_sync();
                }
            }
        }
        *self.status.lock() = TrxStatus::Committed;
        self.release();
        debug!(target: "tessera::search", trx = self.id, tick, "transaction committed");
        Ok(tick)
    }

    /// Abort: discard buffered writes and release every held state
    pub fn abort(&self) {
        let mut status = self.status.lock();
        if *status != TrxStatus::Running {
            return;
        }
        *status = TrxStatus::Aborted;
        drop(status);
        self.doc_ops.lock().clear();
        self.writes.lock().clear();
        self.release();
        debug!(target: "tessera::search", trx = self.id, "transaction aborted");
    }

    fn release(&self) {
        self.snapshots.clear();
        self.synced.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_running() {
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{IndexMeta, ServerRole};

    fn setup(dir: &std::path::Path) -> (Arc<Catalog>, Arc<Collection>, Arc<crate::catalog::SearchView>) {
        let cat = Arc::new(Catalog::new(ServerRole::Single, dir));
        let c = cat.create_collection("c1").unwrap();
        let view = cat.create_view("v", IndexMeta::default()).unwrap();
        cat.link(&view, &c).unwrap();
        (cat, c, view)
    }

    #[test]
    fn test_commit_writes_documents_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, c, view) = setup(tmp.path());
        let trx = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        let a = trx.insert(&c, json!({"x": 1})).unwrap();
        let b = trx.insert(&c, json!({"x": 2})).unwrap();
        trx.remove(&c, b).unwrap();
        assert!(c.document(a).is_none());
        let tick = trx.commit().unwrap();
        assert_eq!(tick, cat.current_tick());
        assert_eq!(c.document(a), Some(json!({"x": 1})));
        assert!(c.document(b).is_none());

        let store = view.links()[0].store.lock().unwrap();
        assert_eq!(store.sync().unwrap().live_docs_count(), 1);
        assert_eq!(trx.status(), TrxStatus::Committed);
        assert!(trx.insert(&c, json!({})).unwrap_err().is_internal());
    }

    #[test]
    fn test_commit_reaches_index_linked_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, c, _view) = setup(tmp.path());
        let trx = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        trx.insert(&c, json!({"x": 1})).unwrap();
        let kept = trx.insert(&c, json!({"x": 2})).unwrap();
        trx.update(&c, kept, json!({"x": 3})).unwrap();

        let late = cat.create_view("late", IndexMeta::default()).unwrap();
        let index = cat.link(&late, &c).unwrap();
        let store = c.index(index).unwrap().lock().unwrap();
        assert_eq!(store.sync().unwrap().live_docs_count(), 0);

        trx.commit().unwrap();
        assert_eq!(store.sync().unwrap().live_docs_count(), 2);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_abort_releases_store_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, c, view) = setup(tmp.path());
        let trx = Transaction::begin(cat, TrxOptions::default()).unwrap();
        trx.insert(&c, json!({"x": 1})).unwrap();
        let handle = view.links()[0].store.clone();
        assert_eq!(handle.holders(), 1);
        trx.abort();
        assert_eq!(handle.holders(), 0);
        assert!(c.is_empty());
    }

    #[test]
    fn test_implicit_snapshot_captured_at_begin() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, c, view) = setup(tmp.path());
        let w = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        w.insert(&c, json!({"x": 1})).unwrap();
        w.commit().unwrap();
        view.links()[0].store.lock().unwrap().commit(true).unwrap();

        let opts = TrxOptions {
            read_views: vec![view.id()],
            ..TrxOptions::default()
        };
        let trx = Transaction::begin(Arc::clone(&cat), opts).unwrap();
        let w = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        w.insert(&c, json!({"x": 2})).unwrap();
        w.commit().unwrap();
        view.links()[0].store.lock().unwrap().commit(true).unwrap();

        assert_eq!(trx.implicit_snapshot(view.id()).unwrap().live_docs_count(), 1);
    }

    #[test]
    fn test_synced_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, _c, view) = setup(tmp.path());
        let trx = Transaction::begin(cat, TrxOptions::default()).unwrap();
        let key = CacheKey::Node(view.id(), PlanNodeId(3));
        assert!(!trx.is_synced(&key));
        assert!(trx.mark_synced(key.clone()));
        assert!(!trx.mark_synced(key.clone()));
        assert!(trx.is_synced(&key));
    }
}
