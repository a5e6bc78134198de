pub mod control;

use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvError, SendError, Sender};
use tracing::{debug, warn};

use stowage_types::block_key::BlockKey;
use stowage_types::error::{Result, StowageError};

use crate::block::DataBlock;
use crate::config::{IndexFilePolicy, ProcessorConfig};
use crate::index::{BlockIndex, VolumeKind, VolumeState};
use crate::planner;
use crate::volume::index_accum::IndexAccumulator;
use crate::volume::BlockVolumeWriter;

use self::control::TaskControl;

/// Commit tag flushed when a full volume rotates to the uploader.
const COMMIT_TAG_OUTPUT: &str = "CommitAddBlockToOutputFlush";
/// Commit tag flushed when a partial volume drains to spill pickup.
const COMMIT_TAG_SPILL: &str = "CommitAddBlockToSpillPickup";

/// A closed block volume handed downstream, with the index accumulator
/// that travelled alongside it (when the index file policy is `Full`).
#[derive(Debug)]
pub struct VolumeUploadRequest {
    pub volume: BlockVolumeWriter,
    pub close: bool,
    pub index: Option<IndexAccumulator>,
}

/// The channel fabric one processor shard plugs into.
///
/// `input` may be shared by many shards (crossbeam channels are MPMC);
/// `output` feeds the uploader and `spill_pickup` collects partial volumes
/// at drain time for a downstream merger.
pub struct ProcessorChannels {
    pub input: Receiver<DataBlock>,
    pub output: Sender<VolumeUploadRequest>,
    pub spill_pickup: Sender<VolumeUploadRequest>,
}

struct OpenVolume {
    writer: BlockVolumeWriter,
    accum: Option<IndexAccumulator>,
}

#[derive(Clone, Copy)]
enum Sink {
    Output,
    Spill,
}

/// One shard of the data block processing pipeline.
///
/// Consumes candidate blocks from `input` in arrival order, deduplicates
/// them against the shared block index, packs accepted blocks into
/// size-bounded compressed volumes and emits full volumes to `output`.
/// When upstream retires the input channel, a non-empty partial volume is
/// emitted to `spill_pickup` instead.
///
/// At most one volume is open at a time; a volume is only created once a
/// genuinely new block arrives, so incremental runs that see nothing new
/// never register empty volumes.
pub struct BlockProcessor {
    config: ProcessorConfig,
    index: Arc<dyn BlockIndex>,
    channels: ProcessorChannels,
    control: Arc<TaskControl>,
    current: Option<OpenVolume>,
}

impl BlockProcessor {
    pub fn new(
        config: ProcessorConfig,
        index: Arc<dyn BlockIndex>,
        channels: ProcessorChannels,
        control: Arc<TaskControl>,
    ) -> Self {
        Self {
            config,
            index,
            channels,
            control,
            current: None,
        }
    }

    /// Run until the input channel retires or a fatal error occurs.
    ///
    /// On any error path the open volume (if any) is disposed before the
    /// error propagates; its temp file never outlives this call.
    pub fn run(mut self) -> Result<()> {
        match self.run_loop() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.dispose_current();
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            let block = match self.channels.input.recv() {
                Ok(block) => block,
                // Disconnected input is graceful retirement, not an error.
                Err(RecvError) => return self.drain(),
            };
            self.process_block(block)?;
            self.control.progress()?;
        }
    }

    fn process_block(&mut self, block: DataBlock) -> Result<()> {
        // Probe before creating a volume: an incremental run that only
        // sees known blocks must never allocate one. Another shard may
        // insert the row between this probe and add_block; the atomic
        // add_block below settles that race.
        if self.current.is_none() {
            if self.index.find_block_id(&block.key)?.is_some() {
                block.completion.resolve(false);
                return Ok(());
            }
            self.current = Some(self.open_volume()?);
        }

        let volume_id = self.current_volume()?.writer.volume_id();
        let was_new = self.index.add_block(&block.key, volume_id)?;

        let DataBlock {
            key,
            data,
            offset,
            is_blocklist_hashes,
            hint,
            completion,
        } = block;
        completion.resolve(was_new);
        if !was_new {
            return Ok(());
        }

        let file_size = self.current_volume()?.writer.file_size();
        if planner::should_rotate(file_size, key.size, self.config.volume_size) {
            self.rotate(&key)?;
        }

        let size = key.size as usize;
        let open = self.current_volume_mut()?;
        open.writer.add_block(&key.hash, &data, offset, size, hint)?;
        if is_blocklist_hashes {
            if let Some(accum) = open.accum.as_mut() {
                accum.append(&key.hash, key.size, &data[offset..offset + size])?;
            }
        }
        Ok(())
    }

    /// Swap in a fresh volume: the triggering block's index row moves to
    /// the new volume (it will be appended there), then the old volume is
    /// sealed and emitted to the uploader.
    fn rotate(&mut self, trigger: &BlockKey) -> Result<()> {
        let fresh = self.open_volume()?;

        let old_id = self.current_volume()?.writer.volume_id();
        debug!(
            from_volume = old_id,
            to_volume = fresh.writer.volume_id(),
            trigger = %trigger,
            "rotating block volume"
        );
        if let Err(e) =
            self.index
                .move_block_to_volume(trigger, old_id, fresh.writer.volume_id())
        {
            dispose_quietly(fresh);
            return Err(e);
        }

        let old = self.current.take().ok_or_else(no_open_volume_bug)?;
        match self.seal_and_emit(old, Sink::Output) {
            Ok(()) => {
                self.current = Some(fresh);
                Ok(())
            }
            Err(e) => {
                dispose_quietly(fresh);
                Err(e)
            }
        }
    }

    /// Retirement path: a non-empty partial volume goes to spill pickup;
    /// an empty one (its only candidates lost the add_block race) is
    /// silently discarded.
    fn drain(&mut self) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        if open.writer.source_size() == 0 {
            debug!(
                volume_id = open.writer.volume_id(),
                "discarding empty volume at drain"
            );
            dispose_quietly(open);
            return Ok(());
        }
        self.seal_and_emit(open, Sink::Spill)
    }

    fn seal_and_emit(&mut self, mut open: OpenVolume, sink: Sink) -> Result<()> {
        open.writer.close()?;
        let (tag, sink_name) = match sink {
            Sink::Output => (COMMIT_TAG_OUTPUT, "output"),
            Sink::Spill => (COMMIT_TAG_SPILL, "spill pickup"),
        };
        self.index.commit_transaction(tag)?;

        debug!(
            volume_id = open.writer.volume_id(),
            file_size = open.writer.file_size(),
            source_size = open.writer.source_size(),
            blocks = open.writer.block_count(),
            sink = sink_name,
            "emitting block volume"
        );

        let request = VolumeUploadRequest {
            volume: open.writer,
            close: true,
            index: open.accum,
        };
        let sender = match sink {
            Sink::Output => &self.channels.output,
            Sink::Spill => &self.channels.spill_pickup,
        };
        sender.send(request).map_err(|SendError(request)| {
            // The sealed volume cannot reach its consumer; remove the temp
            // file and surface the closure as fatal.
            if let Err(e) = request.volume.dispose() {
                warn!("failed to remove temp volume after channel closure: {e}");
            }
            StowageError::ChannelClosed(sink_name)
        })
    }

    fn open_volume(&self) -> Result<OpenVolume> {
        let mut writer = BlockVolumeWriter::new(&self.config)?;
        let volume_id = match self.index.register_remote_volume(
            writer.remote_filename(),
            VolumeKind::Blocks,
            VolumeState::Temporary,
        ) {
            Ok(id) => id,
            Err(e) => {
                dispose_writer_quietly(writer);
                return Err(e);
            }
        };
        if volume_id <= 0 {
            dispose_writer_quietly(writer);
            return Err(StowageError::InvariantViolation(format!(
                "registered volume id {volume_id} is not positive"
            )));
        }
        writer.assign_volume_id(volume_id);

        let accum = match self.config.index_file_policy {
            IndexFilePolicy::Full => Some(IndexAccumulator::new(&self.config)?),
            IndexFilePolicy::None | IndexFilePolicy::Lookup => None,
        };
        Ok(OpenVolume { writer, accum })
    }

    fn current_volume(&self) -> Result<&OpenVolume> {
        self.current.as_ref().ok_or_else(no_open_volume_bug)
    }

    fn current_volume_mut(&mut self) -> Result<&mut OpenVolume> {
        self.current.as_mut().ok_or_else(no_open_volume_bug)
    }

    fn dispose_current(&mut self) {
        if let Some(open) = self.current.take() {
            debug!(
                volume_id = open.writer.volume_id(),
                "disposing partial volume"
            );
            dispose_quietly(open);
        }
    }
}

fn no_open_volume_bug() -> StowageError {
    StowageError::InvariantViolation("BUG: no open volume in pipeline slot".into())
}

fn dispose_quietly(open: OpenVolume) {
    // The accumulator's temp file is removed when it drops.
    dispose_writer_quietly(open.writer);
}

fn dispose_writer_quietly(writer: BlockVolumeWriter) {
    if let Err(e) = writer.dispose() {
        warn!("failed to remove temp volume: {e}");
    }
}
