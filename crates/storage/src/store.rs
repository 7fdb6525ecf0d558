//! Data store
//!
//! Owns one index writer plus its directory and the currently published
//! [`DataSnapshot`]. Readers load the snapshot lock-free through an
//! `ArcSwap`; `commit`, `consolidate` and `cleanup` are the only mutators.
//!
//! Serialization rules:
//! - commits serialize on the commit mutex; a caller that does not want to
//!   wait gets [`CommitResult::InProgress`] instead
//! - consolidation runs against the last published snapshot and does not
//!   take the commit mutex; its result becomes visible with the next commit
//! - cleanup serializes only with other cleanups

use crate::directory::Directory;
use crate::merge_policy::select_candidates;
use crate::segment::{merge_segments, Segment, SegmentCore};
use crate::snapshot::DataSnapshot;
use crate::writer::{Batch, IndexWriter};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tessera_core::{ConsolidationPolicy, Error, IndexId, IndexMeta, Result, Tick};
use tracing::{debug, info, warn};

/// Outcome of [`DataStore::commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// Nothing was buffered
    NoChanges,
    /// A new snapshot has been published
    Done,
    /// Another commit is running and the caller chose not to wait
    InProgress,
}

/// Outcome of [`DataStore::consolidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationResult {
    /// The policy found nothing worth merging
    NoOp,
    /// `merged` segments were replaced by one
    Done {
        /// Number of input segments
        merged: usize,
    },
    /// Another consolidation is running
    InProgress,
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one kind of maintenance operation
#[derive(Debug, Default)]
pub struct OpStats {
    runs: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
    last_micros: AtomicU64,
}

impl OpStats {
    fn record(&self, elapsed: Duration, ok: bool) {
        let micros = elapsed.as_micros() as u64;
        self.runs.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.last_micros.store(micros, Ordering::Relaxed);
    }

    /// Plain copy of the counters
    pub fn snapshot(&self) -> OpStatsSnapshot {
        OpStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_time: Duration::from_micros(self.total_micros.load(Ordering::Relaxed)),
            last_time: Duration::from_micros(self.last_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`OpStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpStatsSnapshot {
    /// Completed runs, failed ones included
    pub runs: u64,
    /// Failed runs
    pub failures: u64,
    /// Accumulated duration
    pub total_time: Duration,
    /// Duration of the most recent run
    pub last_time: Duration,
}

/// Per-store maintenance counters
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Commit counters
    pub commit: OpStats,
    /// Consolidation counters
    pub consolidation: OpStats,
    /// Cleanup counters
    pub cleanup: OpStats,
}

// ============================================================================
// DataStore
// ============================================================================

struct StoreParts {
    directory: Directory,
    writer: IndexWriter,
}

/// One index's writer, directory and published snapshot
pub struct DataStore {
    id: IndexId,
    meta: RwLock<Arc<IndexMeta>>,
    parts: RwLock<Option<StoreParts>>,
    snapshot: ArcSwap<DataSnapshot>,
    commit_lock: Mutex<()>,
    consolidation_lock: Mutex<()>,
    cleanup_lock: Mutex<()>,
    loaded: Mutex<FxHashMap<u64, Weak<SegmentCore>>>,
    out_of_sync: AtomicBool,
    recovery_tick_low: Tick,
    recovery_tick_high: AtomicU64,
    commits_since_cleanup: AtomicU64,
    stats: StoreStats,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .field("generation", &self.snapshot.load().generation())
            .finish()
    }
}

impl DataStore {
    /// Open (or create) the store in `path`, restoring the last committed
    /// state if a manifest exists.
    pub fn open(id: IndexId, path: &Path, meta: IndexMeta) -> Result<Self> {
        let meta = Arc::new(meta);
        let directory = Directory::open(path)?;
        let removed = directory.remove_temp_files()?;
        if removed > 0 {
            warn!(target: "tessera::store", index = %id, removed, "removed interrupted writes");
        }
        let (writer, recovered) = IndexWriter::open(Arc::clone(&meta), &directory)?;

        let (snapshot, tick) = match recovered {
            Some(out) => {
                info!(
                    target: "tessera::store",
                    index = %id,
                    segments = out.segments.len(),
                    tick = out.tick,
                    "data store recovered"
                );
                let tick = out.tick;
                (DataSnapshot::new(out.segments, out.tick, out.generation), tick)
            }
            None => (DataSnapshot::default(), 0),
        };

        let store = DataStore {
            id,
            meta: RwLock::new(meta),
            parts: RwLock::new(Some(StoreParts { directory, writer })),
            snapshot: ArcSwap::from_pointee(DataSnapshot::default()),
            commit_lock: Mutex::new(()),
            consolidation_lock: Mutex::new(()),
            cleanup_lock: Mutex::new(()),
            loaded: Mutex::new(FxHashMap::default()),
            out_of_sync: AtomicBool::new(false),
            recovery_tick_low: tick,
            recovery_tick_high: AtomicU64::new(tick),
            commits_since_cleanup: AtomicU64::new(0),
            stats: StoreStats::default(),
        };
        store.publish(snapshot);
        Ok(store)
    }

    /// Index id
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Current index definition
    pub fn meta(&self) -> Arc<IndexMeta> {
        Arc::clone(&self.meta.read())
    }

    /// Replace runtime tuning (intervals, consolidation policy, buffers).
    ///
    /// The sort and stored-value layout of existing segments is fixed, so a
    /// definition that changes either is rejected.
    pub fn set_properties(&self, meta: IndexMeta) -> Result<()> {
        let mut cur = self.meta.write();
        if cur.primary_sort != meta.primary_sort || cur.stored_values != meta.stored_values {
            return Err(Error::bad_parameter(
                "primarySort and storedValues cannot be changed on an existing index",
            ));
        }
        *cur = Arc::new(meta);
        Ok(())
    }

    /// Directory and writer are both present
    pub fn is_valid(&self) -> bool {
        self.parts.read().is_some()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<DataSnapshot> {
        self.snapshot.load_full()
    }

    /// Maintenance counters
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Tick recorded by the manifest when the store was opened
    pub fn recovery_tick_low(&self) -> Tick {
        self.recovery_tick_low
    }

    /// Highest tick handed to the writer so far
    pub fn recovery_tick_high(&self) -> Tick {
        self.recovery_tick_high.load(Ordering::Acquire)
    }

    /// Latch the store as missing data. Returns true on the first call.
    pub fn set_out_of_sync(&self) -> bool {
        let first = !self.out_of_sync.swap(true, Ordering::AcqRel);
        if first {
            warn!(target: "tessera::store", index = %self.id, "index marked out of sync");
        }
        first
    }

    /// True once [`DataStore::set_out_of_sync`] has been called
    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync.load(Ordering::Acquire)
    }

    fn publish(&self, snapshot: DataSnapshot) {
        {
            let mut loaded = self.loaded.lock();
            for seg in snapshot.segments() {
                loaded
                    .entry(seg.id())
                    .or_insert_with(|| Arc::downgrade(seg.core()));
            }
        }
        self.snapshot.store(Arc::new(snapshot));
    }

    fn with_parts<R>(&self, f: impl FnOnce(&StoreParts) -> Result<R>) -> Result<R> {
        let parts = self.parts.read();
        match parts.as_ref() {
            Some(p) => f(p),
            None => Err(Error::internal(format!("data store '{}' is closed", self.id))),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Hand a committed transaction's batch to the writer
    pub fn apply(&self, batch: &Batch, tick: Tick) -> Result<()> {
        self.with_parts(|p| {
            p.writer.apply(batch, tick);
            let meta = self.meta();
            if meta.writebuffer_size_max > 0 && p.writer.buffered_bytes() as u64 > meta.writebuffer_size_max {
                p.writer.flush(&p.directory)?;
            }
            Ok(())
        })?;
        self.recovery_tick_high.fetch_max(tick, Ordering::AcqRel);
        Ok(())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Publish everything applied since the last commit.
    ///
    /// With `wait = false` a concurrently running commit makes this return
    /// [`CommitResult::InProgress`] immediately.
    pub fn commit(&self, wait: bool) -> Result<CommitResult> {
        let _guard = if wait {
            self.commit_lock.lock()
        } else {
            match self.commit_lock.try_lock() {
                Some(g) => g,
                None => return Ok(CommitResult::InProgress),
            }
        };
        let start = Instant::now();
        let result = self.commit_locked();
        self.stats.commit.record(start.elapsed(), result.is_ok());
        if let Err(e) = &result {
            warn!(target: "tessera::store", index = %self.id, error = %e, "commit failed");
        }
        result
    }

    fn commit_locked(&self) -> Result<CommitResult> {
        let outcome = self.with_parts(|p| p.writer.commit(&p.directory))?;
        match outcome {
            None => Ok(CommitResult::NoChanges),
            Some(out) => {
                debug!(
                    target: "tessera::store",
                    index = %self.id,
                    generation = out.generation,
                    segments = out.segments.len(),
                    "commit published"
                );
                self.publish(DataSnapshot::new(out.segments, out.tick, out.generation));
                self.commits_since_cleanup.fetch_add(1, Ordering::Relaxed);
                Ok(CommitResult::Done)
            }
        }
    }

    /// Blocking commit; used to resynchronize before reading
    pub fn sync(&self) -> Result<Arc<DataSnapshot>> {
        self.commit(true)?;
        Ok(self.snapshot())
    }

    // ========================================================================
    // Consolidation
    // ========================================================================

    /// Merge segments of the last published snapshot per `policy`
    pub fn consolidate(&self, policy: &ConsolidationPolicy) -> Result<ConsolidationResult> {
        let _guard = match self.consolidation_lock.try_lock() {
            Some(g) => g,
            None => return Ok(ConsolidationResult::InProgress),
        };
        let start = Instant::now();
        let result = self.consolidate_locked(policy);
        self.stats.consolidation.record(start.elapsed(), result.is_ok());
        if let Err(e) = &result {
            warn!(target: "tessera::store", index = %self.id, error = %e, "consolidation failed");
        }
        result
    }

    fn consolidate_locked(&self, policy: &ConsolidationPolicy) -> Result<ConsolidationResult> {
        let snapshot = self.snapshot();
        let candidates: Vec<Segment> = select_candidates(policy, snapshot.segments());
        if candidates.is_empty() {
            return Ok(ConsolidationResult::NoOp);
        }
        let meta = self.meta();
        self.with_parts(|p| {
            let id = p.writer.allocate_segment_id();
            let merged = merge_segments(&meta, &candidates, id)?;
            p.directory.write_segment(&merged)?;
            if p.writer.replace_segments(&candidates, merged)? {
                debug!(
                    target: "tessera::store",
                    index = %self.id,
                    merged = candidates.len(),
                    segment = id,
                    "consolidation registered"
                );
                Ok(ConsolidationResult::Done {
                    merged: candidates.len(),
                })
            } else {
                // Candidates vanished meanwhile; the new file is garbage
                p.directory.remove_segment(id)?;
                Ok(ConsolidationResult::NoOp)
            }
        })
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove segment files that neither the writer, the last manifest nor
    /// any still-alive snapshot references. Returns the number removed.
    pub fn cleanup(&self) -> Result<usize> {
        let _guard = self.cleanup_lock.lock();
        let start = Instant::now();
        let result = self.cleanup_locked();
        self.stats.cleanup.record(start.elapsed(), result.is_ok());
        if let Err(e) = &result {
            warn!(target: "tessera::store", index = %self.id, error = %e, "cleanup failed");
        }
        self.commits_since_cleanup.store(0, Ordering::Relaxed);
        result
    }

    fn cleanup_locked(&self) -> Result<usize> {
        self.with_parts(|p| {
            let mut referenced: BTreeSet<u64> = p.writer.referenced_segment_ids();
            {
                let mut loaded = self.loaded.lock();
                loaded.retain(|_, weak| weak.strong_count() > 0);
                referenced.extend(loaded.keys().copied());
            }
            let mut removed = 0;
            for id in p.directory.segment_files()? {
                if !referenced.contains(&id) {
                    p.directory.remove_segment(id)?;
                    removed += 1;
                }
            }
            if removed > 0 {
                debug!(target: "tessera::store", index = %self.id, removed, "segment files removed");
            }
            Ok(removed)
        })
    }

    /// Commits published since the last cleanup
    pub fn commits_since_cleanup(&self) -> u64 {
        self.commits_since_cleanup.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Commit pending work and release the directory. The store stays
    /// readable through its last snapshot but rejects further writes.
    pub fn close(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let result = self.commit_locked();
        self.parts.write().take();
        info!(target: "tessera::store", index = %self.id, "data store closed");
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::LocalDocumentId;

    fn open(dir: &Path) -> DataStore {
        DataStore::open(IndexId(1), dir, IndexMeta::default()).unwrap()
    }

    fn batch(range: std::ops::Range<u64>) -> Batch {
        let mut b = Batch::new();
        for pk in range {
            b.insert(LocalDocumentId(pk), json!({"n": pk}));
        }
        b
    }

    #[test]
    fn test_commit_twice_without_writes_is_no_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        assert_eq!(store.commit(true).unwrap(), CommitResult::NoChanges);
        assert_eq!(store.commit(true).unwrap(), CommitResult::NoChanges);
        assert_eq!(store.snapshot().live_docs_count(), 0);
    }

    #[test]
    fn test_commit_publishes_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let before = store.snapshot();
        store.apply(&batch(0..3), 5).unwrap();
        assert_eq!(store.commit(true).unwrap(), CommitResult::Done);
        assert_eq!(before.live_docs_count(), 0);
        let after = store.snapshot();
        assert_eq!(after.live_docs_count(), 3);
        assert_eq!(after.tick(), 5);
        assert_eq!(store.recovery_tick_high(), 5);
        assert_eq!(store.commit(true).unwrap(), CommitResult::NoChanges);
        assert_eq!(store.snapshot().live_docs_count(), 3);
    }

    #[test]
    fn test_commit_no_wait_reports_in_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let _held = store.commit_lock.lock();
        assert_eq!(store.commit(false).unwrap(), CommitResult::InProgress);
    }

    #[test]
    fn test_consolidate_then_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        for i in 0..4 {
            store.apply(&batch(i * 10..i * 10 + 5), i + 1).unwrap();
            store.commit(true).unwrap();
        }
        assert_eq!(store.snapshot().segments().len(), 4);

        let policy = store.meta().consolidation_policy.clone();
        let res = store.consolidate(&policy).unwrap();
        assert_eq!(res, ConsolidationResult::Done { merged: 4 });
        // Not visible before the next commit
        assert_eq!(store.snapshot().segments().len(), 4);
        assert_eq!(store.commit(true).unwrap(), CommitResult::Done);
        let snap = store.snapshot();
        assert_eq!(snap.segments().len(), 1);
        assert_eq!(snap.live_docs_count(), 20);

        assert_eq!(store.consolidate(&policy).unwrap(), ConsolidationResult::NoOp);
        assert_eq!(store.stats().consolidation.snapshot().runs, 2);
    }

    #[test]
    fn test_cleanup_keeps_files_of_live_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store.apply(&batch(0..2), 1).unwrap();
        store.commit(true).unwrap();
        store.apply(&batch(2..4), 2).unwrap();
        store.commit(true).unwrap();

        let reader = store.snapshot();
        let policy = store.meta().consolidation_policy.clone();
        store.consolidate(&policy).unwrap();
        store.commit(true).unwrap();

        // The old snapshot still pins the replaced segments
        assert_eq!(store.cleanup().unwrap(), 0);
        drop(reader);
        assert_eq!(store.cleanup().unwrap(), 2);
        assert_eq!(store.snapshot().live_docs_count(), 4);
    }

    #[test]
    fn test_reopen_recovers_committed_state() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path());
            store.apply(&batch(0..3), 9).unwrap();
            store.commit(true).unwrap();
            store.apply(&batch(3..4), 10).unwrap();
            // never committed
        }
        let store = open(tmp.path());
        assert_eq!(store.snapshot().live_docs_count(), 3);
        assert_eq!(store.recovery_tick_low(), 9);
    }

    #[test]
    fn test_out_of_sync_latch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        assert!(!store.is_out_of_sync());
        assert!(store.set_out_of_sync());
        assert!(!store.set_out_of_sync());
        assert!(store.is_out_of_sync());
    }

    #[test]
    fn test_close_invalidates_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store.apply(&batch(0..2), 1).unwrap();
        store.close().unwrap();
        assert!(!store.is_valid());
        assert_eq!(store.snapshot().live_docs_count(), 2);
        assert!(store.apply(&batch(2..3), 2).unwrap_err().is_internal());
        assert!(store.commit(true).unwrap_err().is_internal());
    }

    #[test]
    fn test_set_properties_rejects_layout_change() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let mut tuned = IndexMeta::default();
        tuned.commit_interval_msec = 5;
        store.set_properties(tuned).unwrap();
        assert_eq!(store.meta().commit_interval_msec, 5);

        let resorted = IndexMeta::from_json(&json!({"primarySort": [{"field": "n"}]})).unwrap();
        assert!(store.set_properties(resorted).unwrap_err().is_bad_parameter());
    }
}
