pub mod index_accum;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use stowage_types::error::{Result, StowageError};

use crate::block::CompressionHint;
use crate::compress::{self, Compression};
use crate::config::ProcessorConfig;
use crate::planner;

/// Magic bytes at the start of every block volume.
pub const VOLUME_MAGIC: &[u8; 8] = b"STOWBVOL";
/// Volume format version.
pub const VOLUME_VERSION: u8 = 1;
/// Size of the volume header (magic + version byte).
pub const VOLUME_HEADER_SIZE: usize = 9;

/// Fixed part of the trailer cost reserved at open time (array header +
/// 4-byte length field, with slack).
const TRAILER_BASE_RESERVE: u64 = 16;

/// Per-entry trailer cost reserved at append time. Must stay an upper
/// bound on the rmp encoding of one [`VolumeEntry`] minus its hash bytes.
const TRAILER_ENTRY_RESERVE: u64 = 32;

/// One entry in the volume's trailing header, describing a single block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub hash: String,
    /// Logical (uncompressed) block length.
    pub size: u64,
    /// Offset of the block payload within the volume file.
    pub offset: u64,
    /// Stored (compressed, tag-prefixed) payload length.
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
}

/// Append-only compressed container for data blocks, backed by a local
/// temp file until the uploader takes over.
///
/// Layout: 9-byte header, then per block
/// `[2B hash-len LE][hash][4B payload-len LE][payload]`, then an
/// rmp-encoded `Vec<VolumeEntry>` trailer followed by its 4-byte LE length.
///
/// While the volume is open, `file_size` includes a reserve for the
/// eventual trailer so capacity planning can treat it as the final size;
/// once closed it is the exact on-disk size. The temp file is removed when
/// the writer is dropped, so an abandoned volume never outlives the
/// process; `dispose` removes it eagerly and surfaces deletion errors.
#[derive(Debug)]
pub struct BlockVolumeWriter {
    remote_filename: String,
    volume_id: i64,
    file: Option<NamedTempFile>,
    state: WriterState,
    compression: Compression,
    /// Cumulative uncompressed bytes accepted.
    source_size: u64,
    /// Bytes physically written so far.
    bytes_written: u64,
    /// Projected cost of the trailer for the entries appended so far.
    trailer_reserve: u64,
    entries: Vec<VolumeEntry>,
}

impl BlockVolumeWriter {
    /// Create a fresh open volume on a new temp file and write its header.
    pub fn new(config: &ProcessorConfig) -> Result<Self> {
        let compression = Compression::from_config(&config.compression)?;
        let mut file = match &config.spool_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        file.write_all(VOLUME_MAGIC)?;
        file.write_all(&[VOLUME_VERSION])?;

        let remote_filename = generate_volume_filename();
        debug!(filename = %remote_filename, path = %file.path().display(), "opened block volume");

        Ok(Self {
            remote_filename,
            volume_id: 0,
            file: Some(file),
            state: WriterState::Open,
            compression,
            source_size: 0,
            bytes_written: VOLUME_HEADER_SIZE as u64,
            trailer_reserve: TRAILER_BASE_RESERVE,
            entries: Vec::new(),
        })
    }

    pub fn remote_filename(&self) -> &str {
        &self.remote_filename
    }

    /// Volume id assigned at registration time; 0 until then.
    pub fn volume_id(&self) -> i64 {
        self.volume_id
    }

    pub fn assign_volume_id(&mut self, volume_id: i64) {
        self.volume_id = volume_id;
    }

    /// Current compressed size: on-disk bytes plus the projected trailer
    /// cost while open, the exact on-disk size once closed.
    pub fn file_size(&self) -> u64 {
        match self.state {
            WriterState::Open => self.bytes_written + self.trailer_reserve,
            WriterState::Closed => self.bytes_written,
        }
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    /// Path of the backing temp file (valid until dispose/drop).
    pub fn path(&self) -> Result<&Path> {
        Ok(self.file_ref()?.path())
    }

    /// Append one block. `data[offset..offset + size]` is the payload.
    pub fn add_block(
        &mut self,
        hash: &str,
        data: &[u8],
        offset: usize,
        size: usize,
        hint: CompressionHint,
    ) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(StowageError::VolumeNotOpen(self.remote_filename.clone()));
        }
        if hash.len() > u16::MAX as usize {
            return Err(StowageError::InvalidFormat(format!(
                "block hash of {} bytes exceeds frame limit",
                hash.len()
            )));
        }
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                StowageError::InvariantViolation(format!(
                    "block region {offset}+{size} out of bounds for {} byte buffer",
                    data.len()
                ))
            })?;

        let payload = compress::compress(self.compression.effective(hint), &data[offset..end])?;
        if payload.len() > u32::MAX as usize {
            return Err(StowageError::InvalidFormat(format!(
                "compressed block of {} bytes exceeds frame limit",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(2 + hash.len() + 4 + payload.len());
        frame.extend_from_slice(&(hash.len() as u16).to_le_bytes());
        frame.extend_from_slice(hash.as_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        // Payload starts after the hash and length prefixes.
        let payload_offset = self.bytes_written + 2 + hash.len() as u64 + 4;

        self.file_mut()?.write_all(&frame)?;

        let entry_reserve = hash.len() as u64 + TRAILER_ENTRY_RESERVE;
        let growth = frame.len() as u64 + entry_reserve;
        let bound = planner::worst_case_growth(size as u64) + planner::BLOCK_COMPRESSION_OVERHEAD;
        if growth > bound {
            warn!(
                filename = %self.remote_filename,
                growth,
                bound,
                "block expanded past the planner's worst-case bound"
            );
        }

        self.bytes_written += frame.len() as u64;
        self.trailer_reserve += entry_reserve;
        self.source_size += size as u64;
        self.entries.push(VolumeEntry {
            hash: hash.to_string(),
            size: size as u64,
            offset: payload_offset,
            length: payload.len() as u32,
        });
        Ok(())
    }

    /// Write the trailer and finalize. Idempotent once closed.
    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }

        let trailer = rmp_serde::to_vec(&self.entries)?;
        let trailer_cost = trailer.len() as u64 + 4;
        if trailer_cost > self.trailer_reserve {
            warn!(
                filename = %self.remote_filename,
                trailer_cost,
                reserved = self.trailer_reserve,
                "volume trailer exceeded its reserve"
            );
        }

        let trailer_len = trailer.len() as u32;
        let file = self.file_mut()?;
        file.write_all(&trailer)?;
        file.write_all(&trailer_len.to_le_bytes())?;
        file.flush()?;

        self.bytes_written += trailer_cost;
        self.state = WriterState::Closed;
        debug!(
            filename = %self.remote_filename,
            blocks = self.entries.len(),
            file_size = self.bytes_written,
            source_size = self.source_size,
            "closed block volume"
        );
        Ok(())
    }

    /// Remove the backing temp file. Consuming the writer makes any further
    /// operation unrepresentable.
    pub fn dispose(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.close()?;
        }
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut NamedTempFile> {
        self.file.as_mut().ok_or_else(|| {
            StowageError::InvariantViolation("volume temp file already released".into())
        })
    }

    fn file_ref(&self) -> Result<&NamedTempFile> {
        self.file.as_ref().ok_or_else(|| {
            StowageError::InvariantViolation("volume temp file already released".into())
        })
    }
}

fn generate_volume_filename() -> String {
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    format!("stowage-b{}.svol", hex::encode(buf))
}

/// Read the trailing entry table of a closed volume file.
pub fn read_volume_entries(path: &Path) -> Result<Vec<VolumeEntry>> {
    let data = std::fs::read(path)?;

    if data.len() < VOLUME_HEADER_SIZE + 4 {
        return Err(StowageError::InvalidFormat("volume too small".into()));
    }
    if &data[..8] != VOLUME_MAGIC {
        return Err(StowageError::InvalidFormat("bad volume magic".into()));
    }
    if data[8] != VOLUME_VERSION {
        return Err(StowageError::InvalidFormat(format!(
            "unsupported volume version: {}",
            data[8]
        )));
    }

    let len_offset = data.len() - 4;
    let trailer_len = u32::from_le_bytes(
        data[len_offset..]
            .try_into()
            .map_err(|_| StowageError::InvalidFormat("bad trailer length field".into()))?,
    ) as usize;
    if trailer_len > len_offset.saturating_sub(VOLUME_HEADER_SIZE) {
        return Err(StowageError::InvalidFormat("bad trailer length".into()));
    }

    let trailer = &data[len_offset - trailer_len..len_offset];
    let entries: Vec<VolumeEntry> = rmp_serde::from_slice(trailer)?;
    Ok(entries)
}

/// Read and decompress one block from a volume file using its entry.
pub fn read_volume_block(path: &Path, entry: &VolumeEntry) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(entry.offset))?;
    let mut payload = vec![0u8; entry.length as usize];
    file.read_exact(&mut payload)?;

    let block = compress::decompress(&payload)?;
    if block.len() as u64 != entry.size {
        return Err(StowageError::InvalidFormat(format!(
            "block {} decoded to {} bytes, entry says {}",
            entry.hash,
            block.len(),
            entry.size
        )));
    }
    Ok(block)
}
