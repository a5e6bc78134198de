use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;
use tracing::debug;

use stowage_types::error::{Result, StowageError};

use crate::config::ProcessorConfig;

/// A blocklist record replayed by the uploader when it synthesises an
/// index volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: String,
    pub size: u64,
    pub payload: Vec<u8>,
}

/// Disk-spilled append-only sequence of blocklist entries, bound to one
/// in-progress block volume.
///
/// Entries are framed as `[2B hash-len LE][hash][8B size LE]
/// [4B payload-len LE][payload]` and replayed in append order. A fresh
/// accumulator is created on every volume rotation; the outgoing one
/// travels with the outgoing volume and is drained by the uploader. The
/// backing temp file is removed on drop.
#[derive(Debug)]
pub struct IndexAccumulator {
    file: NamedTempFile,
    entry_count: usize,
    byte_len: u64,
}

impl IndexAccumulator {
    pub fn new(config: &ProcessorConfig) -> Result<Self> {
        let file = match &config.spool_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        Ok(Self {
            file,
            entry_count: 0,
            byte_len: 0,
        })
    }

    /// Append one blocklist record.
    pub fn append(&mut self, hash: &str, size: u64, payload: &[u8]) -> Result<()> {
        if hash.len() > u16::MAX as usize {
            return Err(StowageError::InvalidFormat(format!(
                "blocklist hash of {} bytes exceeds frame limit",
                hash.len()
            )));
        }
        if payload.len() > u32::MAX as usize {
            return Err(StowageError::InvalidFormat(format!(
                "blocklist payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(2 + hash.len() + 8 + 4 + payload.len());
        frame.extend_from_slice(&(hash.len() as u16).to_le_bytes());
        frame.extend_from_slice(hash.as_bytes());
        frame.extend_from_slice(&size.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        self.file.write_all(&frame)?;
        self.entry_count += 1;
        self.byte_len += frame.len() as u64;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Drain all entries in append order, releasing the temp file.
    pub fn into_entries(mut self) -> Result<Vec<IndexEntry>> {
        let file = self.file.as_file_mut();
        file.flush()?;
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::with_capacity(self.byte_len as usize);
        file.read_to_end(&mut data)?;

        let mut entries = Vec::with_capacity(self.entry_count);
        let mut pos = 0usize;
        while pos < data.len() {
            let (hash, size, payload, next) = decode_entry(&data, pos)?;
            entries.push(IndexEntry {
                hash,
                size,
                payload,
            });
            pos = next;
        }
        if entries.len() != self.entry_count {
            return Err(StowageError::InvalidFormat(format!(
                "index accumulator decoded {} entries, wrote {}",
                entries.len(),
                self.entry_count
            )));
        }
        debug!(entries = entries.len(), "drained index accumulator");
        Ok(entries)
    }
}

fn take(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    data.get(start..start + len)
        .ok_or_else(|| StowageError::InvalidFormat("truncated index accumulator entry".into()))
}

fn decode_entry(data: &[u8], pos: usize) -> Result<(String, u64, Vec<u8>, usize)> {
    let hash_len = u16::from_le_bytes(take(data, pos, 2)?.try_into().unwrap()) as usize;
    let hash = std::str::from_utf8(take(data, pos + 2, hash_len)?)
        .map_err(|_| StowageError::InvalidFormat("non-UTF-8 hash in accumulator".into()))?
        .to_string();
    let mut cursor = pos + 2 + hash_len;

    let size = u64::from_le_bytes(take(data, cursor, 8)?.try_into().unwrap());
    cursor += 8;
    let payload_len = u32::from_le_bytes(take(data, cursor, 4)?.try_into().unwrap()) as usize;
    cursor += 4;
    let payload = take(data, cursor, payload_len)?.to_vec();
    cursor += payload_len;

    Ok((hash, size, payload, cursor))
}
