use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use stowage_types::block_key::BlockKey;
use stowage_types::error::{Result, StowageError};

/// What a registered remote volume holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    Blocks,
    Index,
}

/// Lifecycle state of a registered remote volume.
///
/// The processor only ever registers `Temporary`; the uploader upgrades the
/// state once the bytes are durable remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Temporary,
    Uploaded,
    Verified,
}

/// Atomic dedup primitives against the durable block database.
///
/// Shared by all pipeline shards; implementations must serialise
/// `add_block` against concurrent `add_block` and `move_block_to_volume`
/// calls for the same key. All operations may block on I/O.
pub trait BlockIndex: Send + Sync {
    /// Volume id of an existing row for this key, or `None` when absent.
    fn find_block_id(&self, key: &BlockKey) -> Result<Option<i64>>;

    /// Allocate a fresh volume id for a remote file about to be written.
    fn register_remote_volume(
        &self,
        filename: &str,
        kind: VolumeKind,
        state: VolumeState,
    ) -> Result<i64>;

    /// Atomic upsert: insert `key → volume_id` and return `true`, or leave
    /// an existing row untouched and return `false`.
    fn add_block(&self, key: &BlockKey, volume_id: i64) -> Result<bool>;

    /// Re-home a row, succeeding only if it currently maps to `from`.
    fn move_block_to_volume(&self, key: &BlockKey, from: i64, to: i64) -> Result<()>;

    /// Flush pending work to durable storage. The tag is an opaque
    /// diagnostic label.
    fn commit_transaction(&self, tag: &str) -> Result<()>;
}

/// A registered remote volume row.
#[derive(Debug, Clone)]
pub struct VolumeRow {
    pub volume_id: i64,
    pub filename: String,
    pub kind: VolumeKind,
    pub state: VolumeState,
}

#[derive(Debug, Default)]
struct IndexInner {
    rows: HashMap<BlockKey, i64>,
    volumes: Vec<VolumeRow>,
    commits: Vec<String>,
    next_volume_id: i64,
}

/// Thread-safe in-memory `BlockIndex`.
///
/// The reference implementation for tests and embedders that do not need a
/// durable database. A single mutex around all state gives the
/// serialisability the trait demands; contention is irrelevant at the call
/// rates the pipeline produces.
#[derive(Debug)]
pub struct MemoryBlockIndex {
    inner: Mutex<IndexInner>,
}

impl MemoryBlockIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                next_volume_id: 1,
                ..IndexInner::default()
            }),
        }
    }

    /// Snapshot of all registered volume rows, in registration order.
    pub fn volumes(&self) -> Vec<VolumeRow> {
        self.inner.lock().unwrap().volumes.clone()
    }

    /// Commit tags recorded so far, in call order.
    pub fn commit_tags(&self) -> Vec<String> {
        self.inner.lock().unwrap().commits.clone()
    }

    /// Number of block rows currently indexed.
    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    /// Upgrade a volume's state (uploader side). Returns `false` if the id
    /// is unknown.
    pub fn set_volume_state(&self, volume_id: i64, state: VolumeState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.volumes.iter_mut().find(|v| v.volume_id == volume_id) {
            Some(row) => {
                row.state = state;
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryBlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIndex for MemoryBlockIndex {
    fn find_block_id(&self, key: &BlockKey) -> Result<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rows.get(key).copied())
    }

    fn register_remote_volume(
        &self,
        filename: &str,
        kind: VolumeKind,
        state: VolumeState,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let volume_id = inner.next_volume_id;
        inner.next_volume_id += 1;
        inner.volumes.push(VolumeRow {
            volume_id,
            filename: filename.to_string(),
            kind,
            state,
        });
        debug!(volume_id, filename, "registered remote volume");
        Ok(volume_id)
    }

    fn add_block(&self, key: &BlockKey, volume_id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.rows.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(volume_id);
                Ok(true)
            }
        }
    }

    fn move_block_to_volume(&self, key: &BlockKey, from: i64, to: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.rows.get_mut(key) {
            Some(current) if *current == from => {
                *current = to;
                Ok(())
            }
            Some(current) => Err(StowageError::Database(format!(
                "move of block {key}: expected volume {from}, found {current}"
            ))),
            None => Err(StowageError::Database(format!(
                "move of block {key}: no index row"
            ))),
        }
    }

    fn commit_transaction(&self, tag: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commits.push(tag.to_string());
        debug!(tag, "committed block index transaction");
        Ok(())
    }
}
