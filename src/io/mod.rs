//! Stream copy helpers
//!
//! One direction of a relayed pair: when the source reaches EOF the
//! destination's write side is shut down, so the opposite direction can keep
//! flowing.

mod copy;

pub use copy::{copy_half, CopyResult};
