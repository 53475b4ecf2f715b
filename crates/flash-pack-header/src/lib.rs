//! Fastboot image-pack decoding.
//!
//! Vendor bootloader images are shipped as a single "pack" file: a fixed
//! 112-byte [`PackHeader`], a table of [`PackEntry`] headers, and the raw
//! partition payloads. This crate decodes those structures and can unpack the
//! payloads into individual `<partition>.img` files.
//!
//! - [`header`]: the fixed-layout pack header
//! - [`entry`]: per-partition entry headers
//! - [`pack`]: reading and writing whole pack files
//! - [`error`]: error types
//!
//! # Example
//!
//! ```
//! use flash_pack_header::prelude::*;
//!
//! let header = PackHeader::new("gs201", "slider-1.2-9876543");
//! let bytes = header.encode();
//! let decoded = PackHeader::decode(&bytes)?;
//! assert_eq!(decoded.platform_str(), "gs201");
//! assert!(decoded.has_valid_magic());
//! # Ok::<(), PackError>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod entry;
pub mod error;
pub mod header;
pub mod pack;
pub mod prelude;

mod bytes;

pub use entry::{PACK_ENTRY_SIZE, PackEntry};
pub use error::{PackError, PackResult};
pub use header::{PACK_HEADER_SIZE, PACK_MAGIC, PackHeader};
pub use pack::{FastbootPack, write_pack};
