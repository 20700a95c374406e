//! Error kinds surfaced across the FTL and filesystem layers.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A segment or the device has no room left for the requested allocation.
    #[error("no space left")]
    NoSpace,

    /// A path, inode, or mapping entry does not exist.
    #[error("not found")]
    NotFound,

    /// Unaligned I/O, an oversized name, or another malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device layer reported a failure.
    #[error("device I/O error: {0}")]
    IoError(#[from] io::Error),

    /// A block carried a type tag this implementation does not recognize.
    #[error("corrupted block: unknown type tag {tag:#x}")]
    Corruption { tag: u8 },
}
