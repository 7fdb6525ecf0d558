//! On-disk layout of one data store
//!
//! ```text
//! <dir>/
//!   LOCK                  exclusive fs2 lock held while the store is open
//!   store.manifest        magic + version + MessagePack(ManifestData)
//!   seg-00000001.tseg     immutable segment files
//! ```
//!
//! The manifest is the single source of truth for which segments (and which
//! deletion masks) make up the committed state. It is written atomically via
//! temp + fsync + rename, so a crash leaves either the old or the new state.

use crate::segment::SegmentCore;
use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use memmap2::Mmap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tessera_core::{Error, Result, Tick};
use tracing::debug;

/// Magic bytes for the store manifest
const MANIFEST_MAGIC: &[u8; 4] = b"TMNF";
/// Current manifest version
const MANIFEST_VERSION: u32 = 1;
/// Manifest file name
pub const MANIFEST_FILE: &str = "store.manifest";
/// Lock file name
pub const LOCK_FILE: &str = "LOCK";

const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".tseg";

// ============================================================================
// Manifest Data (serializable)
// ============================================================================

/// Serializable representation of the committed store state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestData {
    /// Commit generation, incremented on every published commit
    pub generation: u64,
    /// Next segment id to assign
    pub next_segment_id: u64,
    /// Highest transaction tick whose changes are contained
    pub tick: Tick,
    /// Segment entries
    pub segments: Vec<SegmentManifestEntry>,
}

/// Manifest entry for a single segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentManifestEntry {
    /// Segment id
    pub segment_id: u64,
    /// Number of documents in the segment file
    pub doc_count: u32,
    /// Serialized roaring deletion mask
    pub deleted: Vec<u8>,
}

impl SegmentManifestEntry {
    /// Decode the deletion mask
    pub fn deletions(&self) -> Result<RoaringBitmap> {
        RoaringBitmap::deserialize_from(&self.deleted[..])
            .map_err(|e| Error::corruption(format!("bad deletion mask: {}", e)))
    }

    /// Encode a deletion mask
    pub fn encode_deletions(mask: &RoaringBitmap) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(mask.serialized_size());
        mask.serialize_into(&mut buf)?;
        Ok(buf)
    }
}

// ============================================================================
// Directory
// ============================================================================

/// Exclusive handle on a data store directory
#[derive(Debug)]
pub struct Directory {
    path: PathBuf,
    _lock: File,
}

impl Directory {
    /// Create (if needed) and lock a directory.
    ///
    /// Fails when another store already holds the lock.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|e| {
            Error::internal(format!(
                "data store directory '{}' is locked by another store: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Directory {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// Root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of a segment
    pub fn segment_file_name(id: u64) -> String {
        format!("{}{:08}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX)
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.path.join(Self::segment_file_name(id))
    }

    /// Persist a segment (temp + fsync + rename)
    pub fn write_segment(&self, core: &SegmentCore) -> Result<()> {
        let bytes = core.to_bytes()?;
        write_atomic(&self.segment_path(core.id()), &bytes)?;
        debug!(target: "tessera::store", segment = core.id(), bytes = bytes.len(), "segment written");
        Ok(())
    }

    /// Load a segment file through a read-only mapping
    pub fn read_segment(&self, id: u64) -> Result<SegmentCore> {
        let file = File::open(self.segment_path(id))?;
        // SAFETY: segment files are immutable once renamed into place; the
        // mapping is dropped before this function returns.
        let map = unsafe { Mmap::map(&file)? };
        SegmentCore::from_bytes(&map)
    }

    /// Ids of every segment file present on disk
    pub fn segment_files(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Delete a segment file
    pub fn remove_segment(&self, id: u64) -> Result<()> {
        std::fs::remove_file(self.segment_path(id))?;
        Ok(())
    }

    /// Remove stray temp files left by an interrupted write
    pub fn remove_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(".tmp") {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Manifest
    // ========================================================================

    /// Write manifest data atomically
    pub fn write_manifest(&self, data: &ManifestData) -> Result<()> {
        let payload = rmp_serde::to_vec(data)
            .map_err(|e| Error::serialization(format!("manifest encode error: {}", e)))?;

        // Build final buffer: magic + version + payload
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(MANIFEST_MAGIC);
        let mut version = [0u8; 4];
        LittleEndian::write_u32(&mut version, MANIFEST_VERSION);
        buf.extend_from_slice(&version);
        buf.extend_from_slice(&payload);

        write_atomic(&self.path.join(MANIFEST_FILE), &buf)
    }

    /// Load the manifest, `None` for a fresh directory
    pub fn load_manifest(&self) -> Result<Option<ManifestData>> {
        let path = self.path.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let buf = std::fs::read(&path)?;
        if buf.len() < 8 {
            return Err(Error::corruption("manifest too small"));
        }
        if &buf[0..4] != MANIFEST_MAGIC {
            return Err(Error::corruption("bad manifest magic"));
        }
        let version = LittleEndian::read_u32(&buf[4..8]);
        if version != MANIFEST_VERSION {
            return Err(Error::corruption(format!(
                "unsupported manifest version {}",
                version
            )));
        }
        let data = rmp_serde::from_slice(&buf[8..])
            .map_err(|e| Error::corruption(format!("manifest decode error: {}", e)))?;
        Ok(Some(data))
    }
}

/// Atomic write: temp + fsync + rename + parent sync
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBuilder;
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::{IndexMeta, LocalDocumentId};

    #[test]
    fn test_manifest_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let mut mask = RoaringBitmap::new();
        mask.insert(3);
        let data = ManifestData {
            generation: 4,
            next_segment_id: 9,
            tick: 120,
            segments: vec![SegmentManifestEntry {
                segment_id: 8,
                doc_count: 10,
                deleted: SegmentManifestEntry::encode_deletions(&mask).unwrap(),
            }],
        };
        dir.write_manifest(&data).unwrap();

        let loaded = dir.load_manifest().unwrap().unwrap();
        assert_eq!(loaded.generation, 4);
        assert_eq!(loaded.tick, 120);
        assert!(loaded.segments[0].deletions().unwrap().contains(3));
    }

    #[test]
    fn test_bad_manifest_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        std::fs::write(tmp.path().join(MANIFEST_FILE), b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(dir.load_manifest(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_segment_write_list_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let meta = Arc::new(IndexMeta::default());
        let mut b = SegmentBuilder::new(meta);
        b.add(LocalDocumentId(1), &json!({"a": 1}));
        let core = b.build(5);
        dir.write_segment(&core).unwrap();

        assert_eq!(dir.segment_files().unwrap(), vec![5]);
        let loaded = dir.read_segment(5).unwrap();
        assert_eq!(loaded.doc_count(), 1);

        dir.remove_segment(5).unwrap();
        assert!(dir.segment_files().unwrap().is_empty());
    }

    #[test]
    fn test_directory_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let _first = Directory::open(tmp.path()).unwrap();
        let second = Directory::open(tmp.path());
        assert!(second.is_err());
    }
}
