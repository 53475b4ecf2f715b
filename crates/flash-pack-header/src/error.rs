//! Error types for pack decoding

use thiserror::Error;

/// Errors that can occur while decoding or unpacking an image pack
#[derive(Error, Debug)]
pub enum PackError {
    /// Input ended before a fixed-size structure was complete
    #[error("Truncated pack data: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the structure being decoded
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Header magic does not identify a fastboot pack
    #[error("Invalid pack magic: {0:#010x}")]
    InvalidMagic(u32),

    /// An entry points outside of the pack file
    #[error("Entry '{name}' is out of bounds: offset {offset}, size {size}, pack size {pack_size}")]
    EntryOutOfBounds {
        /// Entry partition name
        name: String,
        /// Payload offset
        offset: u64,
        /// Payload size
        size: u64,
        /// Total size of the pack file
        pack_size: u64,
    },

    /// A name does not fit its fixed-length field
    #[error("'{value}' does not fit in a {capacity}-byte field")]
    FieldTooLong {
        /// The rejected value
        value: String,
        /// Field capacity in bytes
        capacity: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for pack operations.
pub type PackResult<T> = std::result::Result<T, PackError>;
