//! Per-transaction index write state
//!
//! Created on the first write a transaction makes to an index. It pins the
//! data store through a [`StrongLock`] so an index drop cannot free it while
//! the transaction is running, and buffers the transaction's operations in a
//! [`Batch`] that is handed to the writer only on commit.

use crate::handle::{AsyncHandle, StrongLock};
use crate::store::DataStore;
use crate::writer::Batch;
use serde_json::Value;
use std::collections::BTreeSet;
use tessera_core::{Error, IndexId, LocalDocumentId, Result, Tick};
use tracing::debug;

/// Uncommitted writes of one transaction against one data store
pub struct IndexTrxState {
    lock: StrongLock<DataStore>,
    batch: Batch,
    committed: bool,
}

impl std::fmt::Debug for IndexTrxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTrxState")
            .field("index", &self.lock.id())
            .field("ops", &self.batch.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl IndexTrxState {
    /// Pin the store behind `handle`; fails when the index was dropped
    pub fn begin(handle: &AsyncHandle<DataStore>) -> Result<Self> {
        let lock = handle
            .lock()
            .ok_or_else(|| Error::not_found("index was dropped"))?;
        Ok(IndexTrxState {
            lock,
            batch: Batch::new(),
            committed: false,
        })
    }

    /// Pinned store
    pub fn store(&self) -> &DataStore {
        &self.lock
    }

    /// Index the state belongs to
    pub fn index_id(&self) -> IndexId {
        self.lock.id()
    }

    /// Buffer a document insert
    pub fn insert(&mut self, pk: LocalDocumentId, doc: Value) {
        self.batch.insert(pk, doc);
    }

    /// Buffer a removal of every earlier version of `pk`
    pub fn remove(&mut self, pk: LocalDocumentId) {
        self.batch.remove(pk);
    }

    /// Primary keys removed by this transaction so far
    pub fn pending_removals(&self) -> &BTreeSet<LocalDocumentId> {
        self.batch.removals()
    }

    /// Number of buffered operations
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Hand the batch to the writer. Visible to readers after the store's
    /// next commit.
    pub fn commit(mut self, tick: Tick) -> Result<()> {
        self.lock.apply(&self.batch, tick)?;
        self.committed = true;
        Ok(())
    }

    /// Discard the batch
    pub fn abort(self) {}
}

impl Drop for IndexTrxState {
    fn drop(&mut self) {
        if !self.committed && !self.batch.is_empty() {
            debug!(
                target: "tessera::store",
                index = %self.lock.id(),
                ops = self.batch.len(),
                "uncommitted index batch discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::IndexMeta;

    fn handle(dir: &std::path::Path) -> AsyncHandle<DataStore> {
        AsyncHandle::new(DataStore::open(IndexId(7), dir, IndexMeta::default()).unwrap())
    }

    #[test]
    fn test_commit_reaches_store() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handle(tmp.path());
        let mut st = IndexTrxState::begin(&h).unwrap();
        st.insert(LocalDocumentId(1), json!({"a": 1}));
        st.insert(LocalDocumentId(2), json!({"a": 2}));
        st.remove(LocalDocumentId(2));
        assert_eq!(st.pending_removals().len(), 1);
        st.commit(3).unwrap();

        let store = h.lock().unwrap();
        store.commit(true).unwrap();
        assert_eq!(store.snapshot().live_docs_count(), 1);
    }

    #[test]
    fn test_abort_leaves_store_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handle(tmp.path());
        let mut st = IndexTrxState::begin(&h).unwrap();
        st.insert(LocalDocumentId(1), json!({}));
        assert_eq!(h.holders(), 1);
        st.abort();
        assert_eq!(h.holders(), 0);

        let store = h.lock().unwrap();
        assert_eq!(store.commit(true).unwrap(), crate::store::CommitResult::NoChanges);
    }

    #[test]
    fn test_begin_after_drop_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handle(tmp.path());
        drop(h.reset());
        assert!(IndexTrxState::begin(&h).unwrap_err().is_not_found());
    }
}
