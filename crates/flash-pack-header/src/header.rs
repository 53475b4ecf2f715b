//! Fixed-layout pack header.
//!
//! # Memory Layout
//!
//! All integers are little-endian.
//!
//! | Offset | Size | Field               |
//! |--------|------|---------------------|
//! | 0      | 4    | magic               |
//! | 4      | 4    | version             |
//! | 8      | 4    | header_size         |
//! | 12     | 4    | entry_header_size   |
//! | 16     | 16   | platform            |
//! | 32     | 64   | pack_version        |
//! | 96     | 4    | slot_type           |
//! | 100    | 4    | data_align          |
//! | 104    | 4    | total_entries       |
//! | 108    | 4    | total_size          |

use crate::bytes::{ByteReader, c_str, padded};
use crate::entry::PACK_ENTRY_SIZE;
use crate::error::{PackError, PackResult};

/// Size of the encoded header in bytes.
pub const PACK_HEADER_SIZE: usize = 112;

/// `FBPK` read as a little-endian integer.
pub const PACK_MAGIC: u32 = u32::from_le_bytes(*b"FBPK");

/// Current pack format version written by [`PackHeader::new`].
pub const PACK_VERSION: u32 = 2;

/// Length of the platform identifier field.
pub const PLATFORM_LEN: usize = 16;

/// Length of the pack-version string field.
pub const PACK_VERSION_LEN: usize = 64;

/// Decoded pack header.
///
/// The decoder does not validate any field; callers check
/// [`PackHeader::has_valid_magic`] before trusting the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    /// Magic number, [`PACK_MAGIC`] for well-formed packs
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Size of this header as written by the producer
    pub header_size: u32,
    /// Size of each entry header
    pub entry_header_size: u32,
    /// NUL-padded platform identifier
    pub platform: [u8; PLATFORM_LEN],
    /// NUL-padded pack version string
    pub pack_version: [u8; PACK_VERSION_LEN],
    /// Slot type of the packed partitions
    pub slot_type: u32,
    /// Payload alignment in bytes
    pub data_align: u32,
    /// Number of entries following the header
    pub total_entries: u32,
    /// Total size of the pack file
    pub total_size: u32,
}

impl PackHeader {
    /// Create a header for an empty pack.
    ///
    /// Strings longer than their fixed fields are truncated.
    pub fn new(platform: &str, pack_version: &str) -> Self {
        Self {
            magic: PACK_MAGIC,
            version: PACK_VERSION,
            header_size: PACK_HEADER_SIZE as u32,
            entry_header_size: PACK_ENTRY_SIZE as u32,
            platform: truncated(platform),
            pack_version: truncated(pack_version),
            slot_type: 0,
            data_align: 16,
            total_entries: 0,
            total_size: PACK_HEADER_SIZE as u32,
        }
    }

    /// Decode a header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Truncated`] if `buf` is shorter than
    /// [`PACK_HEADER_SIZE`].
    pub fn decode(buf: &[u8]) -> PackResult<Self> {
        if buf.len() < PACK_HEADER_SIZE {
            return Err(PackError::Truncated {
                expected: PACK_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut reader = ByteReader::new(buf, PACK_HEADER_SIZE);
        Ok(Self {
            magic: reader.read_u32()?,
            version: reader.read_u32()?,
            header_size: reader.read_u32()?,
            entry_header_size: reader.read_u32()?,
            platform: reader.read_array()?,
            pack_version: reader.read_array()?,
            slot_type: reader.read_u32()?,
            data_align: reader.read_u32()?,
            total_entries: reader.read_u32()?,
            total_size: reader.read_u32()?,
        })
    }

    /// Encode the header into its fixed 112-byte layout.
    pub fn encode(&self) -> [u8; PACK_HEADER_SIZE] {
        let mut out = [0u8; PACK_HEADER_SIZE];
        let fields: [&[u8]; 10] = [
            &self.magic.to_le_bytes(),
            &self.version.to_le_bytes(),
            &self.header_size.to_le_bytes(),
            &self.entry_header_size.to_le_bytes(),
            &self.platform,
            &self.pack_version,
            &self.slot_type.to_le_bytes(),
            &self.data_align.to_le_bytes(),
            &self.total_entries.to_le_bytes(),
            &self.total_size.to_le_bytes(),
        ];
        for (dst, src) in out.iter_mut().zip(fields.iter().flat_map(|f| f.iter())) {
            *dst = *src;
        }
        out
    }

    /// Whether the magic identifies a fastboot pack.
    pub fn has_valid_magic(&self) -> bool {
        self.magic == PACK_MAGIC
    }

    /// Platform identifier with NUL padding removed.
    pub fn platform_str(&self) -> String {
        c_str(&self.platform)
    }

    /// Pack version string with NUL padding removed.
    pub fn pack_version_str(&self) -> String {
        c_str(&self.pack_version)
    }

    /// Validate the magic, returning the header unchanged on success.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::InvalidMagic`] when the magic is not [`PACK_MAGIC`].
    pub fn validated(self) -> PackResult<Self> {
        if self.has_valid_magic() {
            Ok(self)
        } else {
            Err(PackError::InvalidMagic(self.magic))
        }
    }
}

/// Cut `value` to at most `N` bytes without splitting a character.
fn truncated<const N: usize>(value: &str) -> [u8; N] {
    let mut end = value.len().min(N);
    while !value.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    padded::<N>(value.get(..end).unwrap_or_default()).unwrap_or([0u8; N])
}
