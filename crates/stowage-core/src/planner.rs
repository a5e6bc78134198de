//! Capacity planning for in-progress block volumes.
//!
//! Compression output size is unknown before the append, so rotation is
//! decided against a worst-case expansion bound: a block of `size` bytes
//! never grows the volume by more than `size * 1.02` plus a fixed per-block
//! overhead. The overhead is pre-subtracted from the threshold so the
//! compressed payload may fill the entire budget.

/// Fixed worst-case framing/codec overhead per block, in bytes.
pub const BLOCK_COMPRESSION_OVERHEAD: u64 = 1024;

/// Worst-case expansion for a non-compressible block.
///
/// Advisory: if a configured codec can expand beyond 2%, this factor must
/// be raised with it.
pub const NON_COMPRESSIBLE_EXPANSION_FACTOR: f64 = 1.02;

/// Upper bound for the on-disk growth caused by appending `size` bytes.
pub fn worst_case_growth(size: u64) -> u64 {
    (size as f64 * NON_COMPRESSIBLE_EXPANSION_FACTOR).ceil() as u64
}

/// Usable volume budget once the fixed overhead is reserved.
pub fn max_volume_size(volume_size: u64) -> u64 {
    volume_size.saturating_sub(BLOCK_COMPRESSION_OVERHEAD)
}

/// Whether the current volume must rotate before `next_block_size` bytes
/// can be appended.
pub fn should_rotate(file_size: u64, next_block_size: u64, volume_size: u64) -> bool {
    file_size + worst_case_growth(next_block_size) > max_volume_size(volume_size)
}
