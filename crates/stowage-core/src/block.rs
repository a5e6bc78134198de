use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use stowage_types::block_key::BlockKey;

/// Per-block compression hint, decided upstream (e.g. from file extension).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionHint {
    #[default]
    Default,
    Compressible,
    Noncompressible,
}

/// A candidate data block travelling from the chunker to the processor.
///
/// `data[offset..offset + key.size]` is the payload; the surrounding buffer
/// may be shared with other candidates cut from the same read.
#[derive(Debug)]
pub struct DataBlock {
    pub key: BlockKey,
    pub data: Vec<u8>,
    pub offset: usize,
    /// True iff the payload is itself a list of child block hashes.
    pub is_blocklist_hashes: bool,
    pub hint: CompressionHint,
    pub completion: BlockCompletion,
}

impl DataBlock {
    /// The payload region described by `offset` and `key.size`.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.key.size as usize]
    }
}

/// One-shot signal resolved with `was_new` once the block's index fate is
/// known.
///
/// `resolve` consumes the completion, so each block is resolved at most
/// once by construction. Dropping an unresolved completion disconnects the
/// paired receiver, which is how abandonment on pipeline failure surfaces
/// to the upstream waiter.
#[derive(Debug)]
pub struct BlockCompletion {
    tx: Sender<bool>,
}

impl BlockCompletion {
    /// Create a completion and the receiver the upstream chunker waits on.
    pub fn channel() -> (BlockCompletion, Receiver<bool>) {
        let (tx, rx) = bounded(1);
        (BlockCompletion { tx }, rx)
    }

    /// Resolve with `true` if this block created a new index row.
    pub fn resolve(self, was_new: bool) {
        // Best-effort: the waiter may already have gone away.
        let _ = self.tx.send(was_new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_delivers_once() {
        let (completion, rx) = BlockCompletion::channel();
        completion.resolve(true);
        assert!(rx.recv().unwrap());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn dropped_completion_disconnects_receiver() {
        let (completion, rx) = BlockCompletion::channel();
        drop(completion);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn payload_respects_offset() {
        let (completion, _rx) = BlockCompletion::channel();
        let block = DataBlock {
            key: BlockKey::new("h", 3),
            data: b"xxabcxx".to_vec(),
            offset: 2,
            is_blocklist_hashes: false,
            hint: CompressionHint::Default,
            completion,
        };
        assert_eq!(block.payload(), b"abc");
    }
}
