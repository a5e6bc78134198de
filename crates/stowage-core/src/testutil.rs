use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};

use stowage_types::block_key::BlockKey;
use stowage_types::error::{Result, StowageError};

use crate::block::{BlockCompletion, CompressionHint, DataBlock};
use crate::config::{CompressionConfig, IndexFilePolicy, ProcessorConfig};
use crate::index::{BlockIndex, VolumeKind, VolumeState};
use crate::pipeline::{ProcessorChannels, VolumeUploadRequest};

/// Small deterministic config: 10 kB volumes, raw storage, full index
/// policy, volumes spooled into `spool_dir` so tests can assert cleanup.
pub fn test_config(spool_dir: &Path) -> ProcessorConfig {
    ProcessorConfig {
        volume_size: 10_000,
        index_file_policy: IndexFilePolicy::Full,
        compression: CompressionConfig {
            algorithm: "none".into(),
            zstd_level: 3,
        },
        spool_dir: Some(spool_dir.to_path_buf()),
    }
}

/// Deterministic filler payload derived from the hash string.
pub fn block_payload(hash: &str, size: usize) -> Vec<u8> {
    let seed = hash
        .bytes()
        .fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub fn make_block(hash: &str, size: u64) -> (DataBlock, Receiver<bool>) {
    make_block_with(hash, size, false, CompressionHint::Default)
}

pub fn make_block_with(
    hash: &str,
    size: u64,
    is_blocklist_hashes: bool,
    hint: CompressionHint,
) -> (DataBlock, Receiver<bool>) {
    let (completion, rx) = BlockCompletion::channel();
    let block = DataBlock {
        key: BlockKey::new(hash, size),
        data: block_payload(hash, size as usize),
        offset: 0,
        is_blocklist_hashes,
        hint,
        completion,
    };
    (block, rx)
}

/// Channel fabric for one test run, with the far ends kept for assertions.
pub struct TestFabric {
    pub input_tx: Sender<DataBlock>,
    pub output_rx: Receiver<VolumeUploadRequest>,
    pub spill_rx: Receiver<VolumeUploadRequest>,
}

impl TestFabric {
    pub fn new(cap: usize) -> (Self, ProcessorChannels) {
        let (input_tx, input_rx) = bounded(cap);
        let (output_tx, output_rx) = bounded(cap);
        let (spill_tx, spill_rx) = bounded(cap);
        (
            Self {
                input_tx,
                output_rx,
                spill_rx,
            },
            ProcessorChannels {
                input: input_rx,
                output: output_tx,
                spill_pickup: spill_tx,
            },
        )
    }
}

/// Delegating block index with injectable failures, for exercising the
/// pipeline's unwind paths.
pub struct FailingIndex<I> {
    pub inner: I,
    /// Fail the next (and every) `move_block_to_volume` call.
    pub fail_move: AtomicBool,
    /// Fail every `commit_transaction` call.
    pub fail_commit: AtomicBool,
    /// Pretend the probe never finds a row, simulating the shard race
    /// where another worker inserts between probe and add.
    pub blind_probe: AtomicBool,
}

impl<I> FailingIndex<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            fail_move: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            blind_probe: AtomicBool::new(false),
        }
    }
}

impl<I: BlockIndex> BlockIndex for FailingIndex<I> {
    fn find_block_id(&self, key: &BlockKey) -> Result<Option<i64>> {
        if self.blind_probe.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_block_id(key)
    }

    fn register_remote_volume(
        &self,
        filename: &str,
        kind: VolumeKind,
        state: VolumeState,
    ) -> Result<i64> {
        self.inner.register_remote_volume(filename, kind, state)
    }

    fn add_block(&self, key: &BlockKey, volume_id: i64) -> Result<bool> {
        self.inner.add_block(key, volume_id)
    }

    fn move_block_to_volume(&self, key: &BlockKey, from: i64, to: i64) -> Result<()> {
        if self.fail_move.load(Ordering::SeqCst) {
            return Err(StowageError::Database("injected move failure".into()));
        }
        self.inner.move_block_to_volume(key, from, to)
    }

    fn commit_transaction(&self, tag: &str) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StowageError::Database("injected commit failure".into()));
        }
        self.inner.commit_transaction(tag)
    }
}

/// Names of regular files left in a spool directory.
pub fn spooled_files(spool_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(spool_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
