mod picker;
mod store;

pub use picker::{PieceSelector, SessionMode};
pub use store::{BlockOutcome, PieceStore};

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Download state of a piece. Only moves forward, except that a failed
/// hash check or an abandoned claim sends it back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not claimed by any peer
    Pending,
    /// Blocks requested from at least one peer
    Active,
    /// Downloaded and verified
    Complete,
}

/// Number of blocks in a piece of `length` bytes
pub fn block_count(length: u32) -> usize {
    length.div_ceil(BLOCK_SIZE) as usize
}
