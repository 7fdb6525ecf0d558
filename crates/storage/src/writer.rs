//! Index writer
//!
//! The single writer of a data store. Transactions hand it [`Batch`]es of
//! inserts and removals; `commit` turns everything buffered since the last
//! commit into new segments and deletion masks and persists the manifest.
//!
//! Removal semantics: a removal deletes every document with that primary key
//! that was inserted before it, whether still buffered or already flushed.
//! Buffered documents are filtered immediately; flushed segments get the
//! removal applied to their masks at the next flush, before the new segment
//! of that flush is added.

use crate::directory::{Directory, ManifestData, SegmentManifestEntry};
use crate::segment::{Segment, SegmentBuilder, SegmentCore};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tessera_core::{Error, IndexMeta, LocalDocumentId, Result, Tick};
use tracing::debug;

// ============================================================================
// Batch
// ============================================================================

/// One buffered write operation
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Index a document
    Insert(LocalDocumentId, Value),
    /// Remove every document with this primary key
    Remove(LocalDocumentId),
}

/// Ordered write operations of one transaction
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<BatchOp>,
    removals: BTreeSet<LocalDocumentId>,
    estimated_bytes: usize,
}

impl Batch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a document
    pub fn insert(&mut self, pk: LocalDocumentId, doc: Value) {
        self.estimated_bytes += estimate_size(&doc);
        self.ops.push(BatchOp::Insert(pk, doc));
    }

    /// Queue a removal
    pub fn remove(&mut self, pk: LocalDocumentId) {
        self.removals.insert(pk);
        self.ops.push(BatchOp::Remove(pk));
    }

    /// Primary keys removed by this batch
    pub fn removals(&self) -> &BTreeSet<LocalDocumentId> {
        &self.removals
    }

    /// Operations in submission order
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when no operation is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Rough memory footprint of the queued documents
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }
}

fn estimate_size(doc: &Value) -> usize {
    match doc {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 1,
        Value::Array(items) => items.iter().map(estimate_size).sum::<usize>() + 1,
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + estimate_size(v)).sum::<usize>() + 1,
    }
}

// ============================================================================
// IndexWriter
// ============================================================================

/// What a successful flush produced
#[derive(Debug)]
pub struct CommitOutcome {
    /// Full committed segment list
    pub segments: Vec<Segment>,
    /// Highest tick contained
    pub tick: Tick,
    /// New commit generation
    pub generation: u64,
}

struct WriterState {
    segments: Vec<Segment>,
    pending_docs: Vec<(LocalDocumentId, Value)>,
    pending_removals: Vec<LocalDocumentId>,
    buffered_bytes: usize,
    dirty: bool,
    next_segment_id: u64,
    generation: u64,
    committed_tick: Tick,
    pending_tick: Tick,
    committed_ids: BTreeSet<u64>,
}

/// The single writer of one data store
pub struct IndexWriter {
    meta: Arc<IndexMeta>,
    state: Mutex<WriterState>,
}

impl IndexWriter {
    /// Fresh writer for an empty directory
    pub fn new(meta: Arc<IndexMeta>) -> Self {
        IndexWriter {
            meta,
            state: Mutex::new(WriterState {
                segments: Vec::new(),
                pending_docs: Vec::new(),
                pending_removals: Vec::new(),
                buffered_bytes: 0,
                dirty: false,
                next_segment_id: 1,
                generation: 0,
                committed_tick: 0,
                pending_tick: 0,
                committed_ids: BTreeSet::new(),
            }),
        }
    }

    /// Reopen the committed state recorded in `dir`
    pub fn open(meta: Arc<IndexMeta>, dir: &Directory) -> Result<(Self, Option<CommitOutcome>)> {
        let writer = IndexWriter::new(meta);
        let manifest = match dir.load_manifest()? {
            Some(m) => m,
            None => return Ok((writer, None)),
        };
        let mut segments = Vec::with_capacity(manifest.segments.len());
        for entry in &manifest.segments {
            let core = dir.read_segment(entry.segment_id)?;
            if core.doc_count() != entry.doc_count {
                return Err(Error::corruption(format!(
                    "segment {} has {} documents, manifest expects {}",
                    entry.segment_id,
                    core.doc_count(),
                    entry.doc_count
                )));
            }
            segments.push(Segment::new(Arc::new(core)).with_deletions(entry.deletions()?));
        }
        {
            let mut st = writer.state.lock();
            st.segments = segments.clone();
            st.next_segment_id = manifest.next_segment_id;
            st.generation = manifest.generation;
            st.committed_tick = manifest.tick;
            st.pending_tick = manifest.tick;
            st.committed_ids = manifest.segments.iter().map(|e| e.segment_id).collect();
        }
        let outcome = CommitOutcome {
            segments,
            tick: manifest.tick,
            generation: manifest.generation,
        };
        Ok((writer, Some(outcome)))
    }

    /// Index definition the writer builds segments for
    pub fn meta(&self) -> &Arc<IndexMeta> {
        &self.meta
    }

    /// Buffer a transaction's operations, in order
    pub fn apply(&self, batch: &Batch, tick: Tick) {
        if batch.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        for op in batch.ops() {
            match op {
                BatchOp::Insert(pk, doc) => {
                    st.buffered_bytes += estimate_size(doc);
                    st.pending_docs.push((*pk, doc.clone()));
                }
                BatchOp::Remove(pk) => {
                    st.pending_docs.retain(|(p, _)| p != pk);
                    st.pending_removals.push(*pk);
                }
            }
        }
        st.pending_tick = st.pending_tick.max(tick);
        st.dirty = true;
    }

    /// Bytes buffered and not yet flushed
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().buffered_bytes
    }

    /// Flush buffered documents into a segment that stays invisible until
    /// the next commit.
    pub fn flush(&self, dir: &Directory) -> Result<()> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st, dir)
    }

    fn flush_locked(&self, st: &mut WriterState, dir: &Directory) -> Result<()> {
        if !st.pending_removals.is_empty() {
            let removals: Vec<LocalDocumentId> = std::mem::take(&mut st.pending_removals);
            for seg in st.segments.iter_mut() {
                let mut mask: Option<RoaringBitmap> = None;
                for pk in &removals {
                    if let Some(doc) = seg.find_pk(*pk) {
                        if !seg.is_deleted(doc) {
                            mask.get_or_insert_with(|| seg.deleted().clone()).insert(doc);
                        }
                    }
                }
                if let Some(mask) = mask {
                    *seg = seg.with_deletions(mask);
                }
            }
        }
        if !st.pending_docs.is_empty() {
            let mut builder = SegmentBuilder::new(Arc::clone(&self.meta));
            for (pk, doc) in st.pending_docs.drain(..) {
                builder.add(pk, &doc);
            }
            let id = st.next_segment_id;
            st.next_segment_id += 1;
            let core = builder.build(id);
            dir.write_segment(&core)?;
            st.segments.push(Segment::new(Arc::new(core)));
            st.buffered_bytes = 0;
        }
        Ok(())
    }

    /// Flush and persist everything buffered. `None` when there was nothing
    /// to commit.
    pub fn commit(&self, dir: &Directory) -> Result<Option<CommitOutcome>> {
        let mut st = self.state.lock();
        if !st.dirty {
            return Ok(None);
        }
        self.flush_locked(&mut st, dir)?;
        st.segments.retain(|s| s.live_doc_count() > 0);

        let generation = st.generation + 1;
        let mut entries = Vec::with_capacity(st.segments.len());
        for seg in &st.segments {
            entries.push(SegmentManifestEntry {
                segment_id: seg.id(),
                doc_count: seg.doc_count(),
                deleted: SegmentManifestEntry::encode_deletions(seg.deleted())?,
            });
        }
        let manifest = ManifestData {
            generation,
            next_segment_id: st.next_segment_id,
            tick: st.pending_tick,
            segments: entries,
        };
        dir.write_manifest(&manifest)?;

        st.generation = generation;
        st.committed_tick = st.pending_tick;
        st.committed_ids = st.segments.iter().map(Segment::id).collect();
        st.dirty = false;
        debug!(
            target: "tessera::store",
            generation,
            segments = st.segments.len(),
            tick = st.committed_tick,
            "writer committed"
        );
        Ok(Some(CommitOutcome {
            segments: st.segments.clone(),
            tick: st.committed_tick,
            generation,
        }))
    }

    /// Reserve an id for a segment built outside the writer lock
    pub fn allocate_segment_id(&self) -> u64 {
        let mut st = self.state.lock();
        let id = st.next_segment_id;
        st.next_segment_id += 1;
        id
    }

    /// Swap `replaced` for `merged`, which was built from the versions of
    /// those segments found in an older snapshot.
    ///
    /// Deletions applied to the replaced segments since then are carried
    /// over to `merged` by primary key. Returns false (and changes nothing)
    /// when any of the replaced segments is no longer part of the writer's
    /// state.
    pub fn replace_segments(&self, replaced: &[Segment], merged: SegmentCore) -> Result<bool> {
        let mut st = self.state.lock();
        let mut current = Vec::with_capacity(replaced.len());
        for old in replaced {
            match st.segments.iter().find(|s| s.id() == old.id()) {
                Some(seg) => current.push(seg.clone()),
                None => return Ok(false),
            }
        }
        let merged = Segment::new(Arc::new(merged));
        let mut mask = RoaringBitmap::new();
        for (old, now) in replaced.iter().zip(&current) {
            let newly_deleted = now.deleted() - old.deleted();
            for doc in newly_deleted.iter() {
                if let Some(target) = now.pk(doc).and_then(|pk| merged.find_pk(pk)) {
                    mask.insert(target);
                }
            }
        }
        let merged = if mask.is_empty() {
            merged
        } else {
            merged.with_deletions(mask)
        };

        let ids: BTreeSet<u64> = replaced.iter().map(Segment::id).collect();
        let insert_at = st
            .segments
            .iter()
            .position(|s| ids.contains(&s.id()))
            .unwrap_or(st.segments.len());
        st.segments.retain(|s| !ids.contains(&s.id()));
        let insert_at = insert_at.min(st.segments.len());
        st.segments.insert(insert_at, merged);
        st.dirty = true;
        Ok(true)
    }

    /// Ids of segments that must stay on disk: the writer's current view and
    /// the last persisted manifest.
    pub fn referenced_segment_ids(&self) -> BTreeSet<u64> {
        let st = self.state.lock();
        let mut ids = st.committed_ids.clone();
        ids.extend(st.segments.iter().map(Segment::id));
        ids
    }

    /// Highest tick contained in the last commit
    pub fn committed_tick(&self) -> Tick {
        self.state.lock().committed_tick
    }

    /// True when operations are waiting for a commit
    pub fn has_pending_changes(&self) -> bool {
        self.state.lock().dirty
    }
}
