//! Collections, search views and the links between them
//!
//! A [`SearchView`] is the logical search index. Every collection (or shard)
//! linked to it owns one [`DataStore`] holding that collection's part of the
//! index. The view keeps the list of its links behind a read-write lock;
//! queries read-lock it and take a strong lock on every store they touch.
//!
//! On a single server the view links plain collections. On a DB server the
//! linked collections are shards, each carrying the id of the logical
//! collection it belongs to (`plan_id`), and the view only sees the shards
//! that live on this server.

use crate::view_snapshot::LockedLink;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{
    DataSourceId, Error, IndexId, IndexMeta, LocalDocumentId, Result, ServerRole, ShardId, Tick,
    ViewId,
};
use tessera_storage::{AsyncHandle, Batch, DataStore, MaintenanceScheduler};
use tracing::{debug, info};

// ============================================================================
// Collection
// ============================================================================

/// A document collection or, on a DB server, one shard of a collection
pub struct Collection {
    id: DataSourceId,
    name: String,
    plan_id: DataSourceId,
    next_pk: AtomicU64,
    documents: RwLock<BTreeMap<LocalDocumentId, Value>>,
    indexes: RwLock<FxHashMap<IndexId, AsyncHandle<DataStore>>>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("plan_id", &self.plan_id)
            .finish()
    }
}

impl Collection {
    fn new(id: DataSourceId, name: String, plan_id: DataSourceId) -> Self {
        Collection {
            id,
            name,
            plan_id,
            next_pk: AtomicU64::new(1),
            documents: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(FxHashMap::default()),
        }
    }

    /// Local id
    pub fn id(&self) -> DataSourceId {
        self.id
    }

    /// Name (shard name on a DB server)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the logical collection as the planner knows it
    pub fn plan_id(&self) -> DataSourceId {
        self.plan_id
    }

    /// Allocate a document id
    pub fn next_document_id(&self) -> LocalDocumentId {
        LocalDocumentId(self.next_pk.fetch_add(1, Ordering::Relaxed))
    }

    /// Committed document
    pub fn document(&self, pk: LocalDocumentId) -> Option<Value> {
        self.documents.read().get(&pk).cloned()
    }

    /// Number of committed documents
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// True when the collection holds no documents
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Apply committed writes (`None` removes) and return the indexes
    /// registered at that moment. Linking copies documents under the same
    /// lock, so every write lands either in the copy or in the returned set.
    pub(crate) fn apply_documents<'a>(
        &self,
        ops: impl IntoIterator<Item = &'a (LocalDocumentId, Option<Value>)>,
    ) -> Vec<(IndexId, AsyncHandle<DataStore>)> {
        let mut documents = self.documents.write();
        for (pk, doc) in ops {
            match doc {
                Some(doc) => {
                    documents.insert(*pk, doc.clone());
                }
                None => {
                    documents.remove(pk);
                }
            }
        }
        self.indexes()
    }

    /// Handle of a search index defined on this collection
    pub fn index(&self, id: IndexId) -> Option<AsyncHandle<DataStore>> {
        self.indexes.read().get(&id).cloned()
    }

    /// Every search index defined on this collection
    pub fn indexes(&self) -> Vec<(IndexId, AsyncHandle<DataStore>)> {
        let mut out: Vec<_> = self
            .indexes
            .read()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

// ============================================================================
// SearchView
// ============================================================================

/// One link of a view: the per-collection index feeding it
#[derive(Clone)]
pub struct IndexLink {
    /// Linked collection (or shard)
    pub collection: DataSourceId,
    /// Index id inside the collection
    pub index: IndexId,
    /// Handle to the data store
    pub store: AsyncHandle<DataStore>,
}

impl std::fmt::Debug for IndexLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexLink")
            .field("collection", &self.collection)
            .field("index", &self.index)
            .finish()
    }
}

/// A search view: one logical index over a set of linked collections
pub struct SearchView {
    id: ViewId,
    name: String,
    meta: Arc<IndexMeta>,
    links: RwLock<Vec<IndexLink>>,
}

impl std::fmt::Debug for SearchView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchView")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("links", &self.links.read().len())
            .finish()
    }
}

impl SearchView {
    /// View id
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// View name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Definition shared by every link (primary sort, stored values, ...)
    pub fn meta(&self) -> &Arc<IndexMeta> {
        &self.meta
    }

    /// Ids of the linked collections, in link order
    pub fn linked_collections(&self) -> Vec<DataSourceId> {
        self.links.read().iter().map(|l| l.collection).collect()
    }

    /// True when `collection` is linked
    pub fn is_linked(&self, collection: DataSourceId) -> bool {
        self.links.read().iter().any(|l| l.collection == collection)
    }

    /// Snapshot of the link list
    pub fn links(&self) -> Vec<IndexLink> {
        self.links.read().clone()
    }

    /// Strong-lock every link, optionally restricted to `sources`.
    ///
    /// Fails if any linked store was dropped concurrently; a partial set of
    /// locks is never returned.
    pub fn lock_links(&self, sources: Option<&[DataSourceId]>) -> Result<Vec<LockedLink>> {
        let links = self.links.read();
        let mut out = Vec::with_capacity(links.len());
        for link in links.iter() {
            if let Some(sources) = sources {
                if !sources.contains(&link.collection) {
                    continue;
                }
            }
            let store = link.store.lock().ok_or_else(|| {
                Error::internal(format!(
                    "failed to lock index '{}' of collection '{}' while reading view '{}'",
                    link.index, link.collection, self.name
                ))
            })?;
            out.push(LockedLink {
                source: link.collection,
                index: link.index,
                store,
            });
        }
        Ok(out)
    }
}

// ============================================================================
// Document access
// ============================================================================

/// Source of full documents for materialization
pub trait DocumentReader: Send + Sync {
    /// Committed document `pk` of collection `source`
    fn read_document(&self, source: DataSourceId, pk: LocalDocumentId) -> Option<Value>;
}

// ============================================================================
// Catalog
// ============================================================================

/// Registry of collections and views of one server
pub struct Catalog {
    role: ServerRole,
    root: PathBuf,
    next_id: AtomicU64,
    tick: AtomicU64,
    collections: RwLock<FxHashMap<DataSourceId, Arc<Collection>>>,
    views: RwLock<FxHashMap<ViewId, Arc<SearchView>>>,
    scheduler: Option<Arc<MaintenanceScheduler>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("role", &self.role)
            .field("root", &self.root)
            .field("collections", &self.collections.read().len())
            .field("views", &self.views.read().len())
            .finish()
    }
}

impl Catalog {
    /// Create an empty catalog whose index directories live below `root`
    pub fn new(role: ServerRole, root: &Path) -> Self {
        Catalog {
            role,
            root: root.to_path_buf(),
            next_id: AtomicU64::new(100),
            tick: AtomicU64::new(0),
            collections: RwLock::new(FxHashMap::default()),
            views: RwLock::new(FxHashMap::default()),
            scheduler: None,
        }
    }

    /// Register every data store created from now on with `scheduler`
    pub fn with_scheduler(mut self, scheduler: Arc<MaintenanceScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Role of this server
    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Allocate the next commit tick
    pub fn next_tick(&self) -> Tick {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last allocated tick
    pub fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------------

    /// Create a collection
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        let id = DataSourceId(self.allocate_id());
        self.insert_collection(Collection::new(id, name.to_string(), id))
    }

    /// Create a shard of the logical collection `plan_id`
    pub fn create_shard(&self, shard: &ShardId, plan_id: DataSourceId) -> Result<Arc<Collection>> {
        let id = DataSourceId(self.allocate_id());
        self.insert_collection(Collection::new(id, shard.as_str().to_string(), plan_id))
    }

    fn insert_collection(&self, collection: Collection) -> Result<Arc<Collection>> {
        let mut collections = self.collections.write();
        if collections.values().any(|c| c.name == collection.name) {
            return Err(Error::bad_parameter(format!(
                "duplicate collection name '{}'",
                collection.name
            )));
        }
        let collection = Arc::new(collection);
        collections.insert(collection.id, Arc::clone(&collection));
        Ok(collection)
    }

    /// Look up a collection by id
    pub fn collection(&self, id: DataSourceId) -> Option<Arc<Collection>> {
        self.collections.read().get(&id).cloned()
    }

    /// Look up a collection (or shard) by name
    pub fn collection_by_name(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Look up a shard by its id
    pub fn shard(&self, shard: &ShardId) -> Option<Arc<Collection>> {
        self.collection_by_name(shard.as_str())
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    /// Create a view. `meta` defines the primary sort, stored values and
    /// indexing rules of every link.
    pub fn create_view(&self, name: &str, meta: IndexMeta) -> Result<Arc<SearchView>> {
        let mut views = self.views.write();
        if views.values().any(|v| v.name == name) {
            return Err(Error::bad_parameter(format!("duplicate view name '{}'", name)));
        }
        let view = Arc::new(SearchView {
            id: ViewId(self.allocate_id()),
            name: name.to_string(),
            meta: Arc::new(meta),
            links: RwLock::new(Vec::new()),
        });
        views.insert(view.id, Arc::clone(&view));
        info!(target: "tessera::search", view = %view.name, id = %view.id, "view created");
        Ok(view)
    }

    /// Look up a view by id
    pub fn view(&self, id: ViewId) -> Option<Arc<SearchView>> {
        self.views.read().get(&id).cloned()
    }

    /// Look up a view by name
    pub fn view_by_name(&self, name: &str) -> Option<Arc<SearchView>> {
        self.views.read().values().find(|v| v.name == name).cloned()
    }

    /// Look up a view by numeric id or by name
    pub fn lookup_view(&self, id_or_name: &str) -> Option<Arc<SearchView>> {
        id_or_name
            .parse::<u64>()
            .ok()
            .and_then(|id| self.view(ViewId(id)))
            .or_else(|| self.view_by_name(id_or_name))
    }

    /// Link `collection` to `view`: open a data store for it and index the
    /// collection's committed documents.
    pub fn link(&self, view: &SearchView, collection: &Collection) -> Result<IndexId> {
        if view.is_linked(collection.id) {
            return Err(Error::bad_parameter(format!(
                "collection '{}' is already linked to view '{}'",
                collection.name, view.name
            )));
        }
        let index = IndexId(self.allocate_id());
        let path = self.root.join(format!("index-{}", index));
        let store = DataStore::open(index, &path, (*view.meta).clone())?;

        // Commits wait until the copy is registered
        let documents = collection.documents.write();
        if !documents.is_empty() {
            let mut batch = Batch::new();
            for (pk, doc) in documents.iter() {
                batch.insert(*pk, doc.clone());
            }
            store.apply(&batch, self.current_tick())?;
            store.commit(true)?;
        }

        let handle = AsyncHandle::new(store);
        if let Some(scheduler) = &self.scheduler {
            scheduler.register(handle.clone())?;
        }
        collection.indexes.write().insert(index, handle.clone());
        drop(documents);
        view.links.write().push(IndexLink {
            collection: collection.id,
            index,
            store: handle,
        });
        info!(
            target: "tessera::search",
            view = %view.name,
            collection = %collection.name,
            index = %index,
            "collection linked"
        );
        Ok(index)
    }

    /// Remove the link between `view` and `collection` and drop its store.
    ///
    /// Blocks until every query holding the store has released it.
    pub fn unlink(&self, view: &SearchView, collection: &Collection) -> Result<()> {
        let link = {
            let mut links = view.links.write();
            let pos = links
                .iter()
                .position(|l| l.collection == collection.id)
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "collection '{}' is not linked to view '{}'",
                        collection.name, view.name
                    ))
                })?;
            links.remove(pos)
        };
        collection.indexes.write().remove(&link.index);
        if let Some(store) = link.store.reset() {
            store.close()?;
        }
        debug!(target: "tessera::search", view = %view.name, index = %link.index, "collection unlinked");
        Ok(())
    }

    /// Drop a view together with every link
    pub fn drop_view(&self, id: ViewId) -> Result<()> {
        let view = self
            .views
            .write()
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("view '{}' not found", id)))?;
        for link in view.links() {
            if let Some(collection) = self.collection(link.collection) {
                self.unlink(&view, &collection)?;
            }
        }
        Ok(())
    }

    /// Shards of `view` present on this server with the local index ids
    /// serving them, in shard-name order
    pub fn local_shards(&self, view: &SearchView) -> BTreeMap<ShardId, Vec<IndexId>> {
        let mut out: BTreeMap<ShardId, Vec<IndexId>> = BTreeMap::new();
        for link in view.links() {
            if let Some(collection) = self.collection(link.collection) {
                out.entry(ShardId::new(collection.name.clone()))
                    .or_default()
                    .push(link.index);
            }
        }
        out
    }
}

impl DocumentReader for Catalog {
    fn read_document(&self, source: DataSourceId, pk: LocalDocumentId) -> Option<Value> {
        self.collection(source).and_then(|c| c.document(pk))
    }
}
