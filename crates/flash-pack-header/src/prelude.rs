//! Convenience re-exports for pack decoding

pub use crate::entry::{PACK_ENTRY_SIZE, PackEntry};
pub use crate::error::{PackError, PackResult};
pub use crate::header::{PACK_HEADER_SIZE, PACK_MAGIC, PackHeader};
pub use crate::pack::{FastbootPack, write_pack};
