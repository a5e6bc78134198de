use thiserror::Error;

pub type Result<T> = std::result::Result<T, StowageError>;

/// Errors surfaced by the block processing pipeline and its collaborators.
///
/// Graceful end-of-stream ("retirement") is deliberately not represented
/// here: a disconnected input channel is a normal control-flow outcome and
/// is handled where the channel is read.
#[derive(Debug, Error)]
pub enum StowageError {
    #[error("block index error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task terminated")]
    Terminated,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("volume '{0}' is not open")]
    VolumeNotOpen(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("invalid volume format: {0}")]
    InvalidFormat(String),

    #[error("{0}")]
    Other(String),
}
