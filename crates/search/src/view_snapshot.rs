//! Per-transaction view snapshots
//!
//! A [`ViewSnapshot`] pins one [`DataSnapshot`] per linked collection (or
//! shard) and flattens their segments into a single sequence. It is built at
//! most once per transaction and cache key, then stored on the transaction so
//! that every later read inside the same transaction sees the same data.
//!
//! Reuse is keyed twice: by the [`CacheKey`] and by the set of links the
//! snapshot was built from. A cached snapshot whose link set differs from
//! the requested one is never returned.

use crate::transaction::{CacheKey, Transaction};
use std::sync::Arc;
use tessera_core::{DataSourceId, Error, IndexId, Result};
use tessera_storage::{DataSnapshot, DataStore, Segment, StrongLock};
use tracing::debug;

/// A linked index, strong-locked for the duration of snapshot assembly
pub struct LockedLink {
    /// Collection (or shard) the index belongs to
    pub source: DataSourceId,
    /// Index id
    pub index: IndexId,
    /// Pinned data store
    pub store: StrongLock<DataStore>,
}

impl std::fmt::Debug for LockedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedLink")
            .field("source", &self.source)
            .field("index", &self.index)
            .finish()
    }
}

/// One pinned data snapshot inside a view snapshot
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// Collection the data belongs to
    pub source: DataSourceId,
    /// Index the data was read from
    pub index: IndexId,
    /// Pinned data snapshot
    pub snapshot: Arc<DataSnapshot>,
}

#[derive(Debug, Clone)]
struct FlatSegment {
    entry: usize,
    segment: Segment,
}

/// Read-consistent aggregation of data snapshots across linked sources
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    entries: Vec<SnapshotEntry>,
    segments: Vec<FlatSegment>,
    live_docs: u64,
    docs: u64,
}

impl ViewSnapshot {
    /// Snapshot over no sources at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble a snapshot from the current data snapshots of `links`,
    /// synchronizing each store first when `sync` is set.
    pub fn build(links: &[LockedLink], sync: bool) -> Result<Self> {
        let mut snap = ViewSnapshot::default();
        for link in links {
            if !link.store.is_valid() {
                return Err(Error::internal(format!(
                    "failed to build view snapshot: index '{}' of collection '{}' is closed",
                    link.index, link.source
                )));
            }
            let data = if sync {
                link.store.sync()?
            } else {
                link.store.snapshot()
            };
            snap.push(link.source, link.index, data);
        }
        Ok(snap)
    }

    /// Snapshot over already pinned data snapshots
    pub fn from_snapshots(snapshots: Vec<(DataSourceId, IndexId, Arc<DataSnapshot>)>) -> Self {
        let mut snap = ViewSnapshot::default();
        for (source, index, data) in snapshots {
            snap.push(source, index, data);
        }
        snap
    }

    fn push(&mut self, source: DataSourceId, index: IndexId, data: Arc<DataSnapshot>) {
        let entry = self.entries.len();
        for segment in data.segments() {
            self.segments.push(FlatSegment {
                entry,
                segment: segment.clone(),
            });
        }
        self.live_docs += data.live_docs_count();
        self.docs += data.docs_count();
        self.entries.push(SnapshotEntry {
            source,
            index,
            snapshot: data,
        });
    }

    /// Pinned data snapshots, in link order
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Number of segments across all sources
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment by flat position
    pub fn segment(&self, idx: usize) -> &Segment {
        &self.segments[idx].segment
    }

    /// Every segment, in flat order
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().map(|s| &s.segment)
    }

    /// Collection the segment at `idx` belongs to
    pub fn source_of(&self, idx: usize) -> DataSourceId {
        self.entries[self.segments[idx].entry].source
    }

    /// Collections covered by this snapshot, in link order
    pub fn sources(&self) -> Vec<DataSourceId> {
        self.entries.iter().map(|e| e.source).collect()
    }

    /// Live documents across every source
    pub fn live_docs_count(&self) -> u64 {
        self.live_docs
    }

    /// Documents across every source, deleted ones included
    pub fn docs_count(&self) -> u64 {
        self.docs
    }

    /// True when no live document is visible
    pub fn is_empty(&self) -> bool {
        self.live_docs == 0
    }

    /// True when this snapshot was built from exactly `links`
    pub fn same_links(&self, links: &[LockedLink]) -> bool {
        self.entries.len() == links.len()
            && self
                .entries
                .iter()
                .zip(links)
                .all(|(e, l)| e.source == l.source && e.index == l.index)
    }
}

// ============================================================================
// Transaction-scoped lookup
// ============================================================================

/// Snapshot cached on `trx` under `key`, whatever links it was built from
pub fn get_view_snapshot(trx: &Transaction, key: &CacheKey) -> Option<Arc<ViewSnapshot>> {
    trx.cached_snapshot(key)
}

/// Cached snapshot for `key`, but only if it covers exactly `links`
pub fn find(trx: &Transaction, key: &CacheKey, links: &[LockedLink]) -> Option<Arc<ViewSnapshot>> {
    trx.cached_snapshot(key).filter(|s| s.same_links(links))
}

/// Cached snapshot for `key` and `links`, or a freshly built one that
/// replaces whatever was cached
pub fn find_or_create(trx: &Transaction, key: &CacheKey, links: &[LockedLink]) -> Result<Arc<ViewSnapshot>> {
    if let Some(found) = find(trx, key, links) {
        return Ok(found);
    }
    let snap = Arc::new(ViewSnapshot::build(links, false)?);
    trx.register_snapshot(key.clone(), Arc::clone(&snap));
    debug!(
        target: "tessera::snapshot",
        trx = trx.id(),
        key = ?key,
        sources = links.len(),
        live_docs = snap.live_docs_count(),
        "view snapshot created"
    );
    Ok(snap)
}

/// Synchronize every linked store and rebuild the snapshot for `key`.
///
/// Happens at most once per transaction and key: later calls with the same
/// links return the snapshot built by the first one.
pub fn sync_and_replace(trx: &Transaction, key: &CacheKey, links: &[LockedLink]) -> Result<Arc<ViewSnapshot>> {
    if trx.is_synced(key) {
        if let Some(found) = find(trx, key, links) {
            return Ok(found);
        }
    }
    let snap = Arc::new(ViewSnapshot::build(links, true)?);
    trx.register_snapshot(key.clone(), Arc::clone(&snap));
    trx.mark_synced(key.clone());
    debug!(
        target: "tessera::snapshot",
        trx = trx.id(),
        key = ?key,
        sources = links.len(),
        live_docs = snap.live_docs_count(),
        "view snapshot synchronized"
    );
    Ok(snap)
}

/// Build (or reuse) the snapshot for `key`, synchronizing first when
/// `force_sync` is set
pub fn make_view_snapshot(
    trx: &Transaction,
    key: &CacheKey,
    force_sync: bool,
    links: &[LockedLink],
) -> Result<Arc<ViewSnapshot>> {
    trx.ensure_running()?;
    if force_sync {
        sync_and_replace(trx, key, links)
    } else {
        find_or_create(trx, key, links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::transaction::TrxOptions;
    use serde_json::json;
    use tessera_core::{IndexMeta, ServerRole};

    fn setup(dir: &std::path::Path) -> (Arc<Catalog>, Arc<crate::catalog::SearchView>) {
        let cat = Arc::new(Catalog::new(ServerRole::Single, dir));
        let c1 = cat.create_collection("c1").unwrap();
        let c2 = cat.create_collection("c2").unwrap();
        let view = cat.create_view("v", IndexMeta::default()).unwrap();
        cat.link(&view, &c1).unwrap();
        cat.link(&view, &c2).unwrap();
        let trx = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        trx.insert(&c1, json!({"a": 1})).unwrap();
        trx.insert(&c2, json!({"a": 2})).unwrap();
        trx.insert(&c2, json!({"a": 3})).unwrap();
        trx.commit().unwrap();
        (cat, view)
    }

    #[test]
    fn test_build_counts_and_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let (_cat, view) = setup(tmp.path());
        let links = view.lock_links(None).unwrap();
        let unsynced = ViewSnapshot::build(&links, false).unwrap();
        assert_eq!(unsynced.live_docs_count(), 0);
        let synced = ViewSnapshot::build(&links, true).unwrap();
        assert_eq!(synced.live_docs_count(), 3);
        assert_eq!(synced.sources().len(), 2);
        assert_eq!(synced.segment_count(), 2);
        assert_eq!(synced.source_of(1), synced.entries()[1].source);
    }

    #[test]
    fn test_find_or_create_reuses_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, view) = setup(tmp.path());
        let trx = Transaction::begin(cat, TrxOptions::default()).unwrap();
        let key = CacheKey::View(view.id());
        let links = view.lock_links(None).unwrap();
        let a = find_or_create(&trx, &key, &links).unwrap();
        let b = find_or_create(&trx, &key, &links).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let restricted = view.lock_links(Some(&[links[0].source])).unwrap();
        assert!(find(&trx, &key, &restricted).is_none());
        let c = find_or_create(&trx, &key, &restricted).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.entries().len(), 1);
    }

    #[test]
    fn test_sync_happens_once_per_key() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, view) = setup(tmp.path());
        let trx = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        let key = CacheKey::View(view.id());
        let links = view.lock_links(None).unwrap();
        let first = sync_and_replace(&trx, &key, &links).unwrap();
        assert_eq!(first.live_docs_count(), 3);

        // A write committed after the first sync stays invisible to this
        // transaction even when it asks to sync again.
        let c1 = cat.collection_by_name("c1").unwrap();
        let writer = Transaction::begin(Arc::clone(&cat), TrxOptions::default()).unwrap();
        writer.insert(&c1, json!({"a": 4})).unwrap();
        writer.commit().unwrap();
        let second = make_view_snapshot(&trx, &key, true, &links).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.live_docs_count(), 3);
    }

    #[test]
    fn test_aborted_transaction_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (cat, view) = setup(tmp.path());
        let trx = Transaction::begin(cat, TrxOptions::default()).unwrap();
        trx.abort();
        let links = view.lock_links(None).unwrap();
        let err = make_view_snapshot(&trx, &CacheKey::View(view.id()), false, &links).unwrap_err();
        assert!(err.is_internal());
    }
}
