use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a data block: content hash string plus logical byte length.
///
/// The hash is opaque to the processor — it is computed upstream and only
/// ever compared for equality. Two blocks are the same block iff both the
/// hash and the size match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub hash: String,
    pub size: u64,
}

impl BlockKey {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_both_fields() {
        let a = BlockKey::new("abc", 100);
        assert_eq!(a, BlockKey::new("abc", 100));
        assert_ne!(a, BlockKey::new("abc", 101));
        assert_ne!(a, BlockKey::new("abd", 100));
    }

    #[test]
    fn display_joins_hash_and_size() {
        let key = BlockKey::new("qZk+NkcGgWq6PiVxeFDCbJzQ2J0=", 4096);
        assert_eq!(key.to_string(), "qZk+NkcGgWq6PiVxeFDCbJzQ2J0=:4096");
    }
}
