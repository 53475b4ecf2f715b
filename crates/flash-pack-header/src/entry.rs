//! Per-partition entry headers.
//!
//! # Memory Layout
//!
//! | Offset | Size | Field    |
//! |--------|------|----------|
//! | 0      | 4    | type     |
//! | 4      | 36   | name     |
//! | 40     | 40   | product  |
//! | 80     | 8    | offset   |
//! | 88     | 8    | size     |
//! | 96     | 4    | slotted  |
//! | 100    | 4    | crc32    |

use crate::bytes::{ByteReader, c_str, padded};
use crate::error::{PackError, PackResult};

/// Size of an encoded entry header in bytes.
pub const PACK_ENTRY_SIZE: usize = 104;

/// Length of the partition name field.
pub const ENTRY_NAME_LEN: usize = 36;

/// Length of the product field.
pub const ENTRY_PRODUCT_LEN: usize = 40;

/// Entry type for a partition image payload.
pub const ENTRY_TYPE_PARTITION: u32 = 1;

/// One partition stored in a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackEntry {
    /// Entry type, [`ENTRY_TYPE_PARTITION`] for images
    pub entry_type: u32,
    /// NUL-padded partition name
    pub name: [u8; ENTRY_NAME_LEN],
    /// NUL-padded product the image targets
    pub product: [u8; ENTRY_PRODUCT_LEN],
    /// Payload offset from the start of the pack
    pub offset: u64,
    /// Payload length in bytes
    pub size: u64,
    /// Non-zero when the partition is slotted (A/B)
    pub slotted: u32,
    /// CRC32 of the payload as recorded by the producer
    pub crc32: u32,
}

impl PackEntry {
    /// Create a partition entry.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::FieldTooLong`] if `name` or `product` do not fit.
    pub fn new(name: &str, product: &str, offset: u64, size: u64) -> PackResult<Self> {
        Ok(Self {
            entry_type: ENTRY_TYPE_PARTITION,
            name: padded(name)?,
            product: padded(product)?,
            offset,
            size,
            slotted: 0,
            crc32: 0,
        })
    }

    /// Decode an entry header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Truncated`] if `buf` is shorter than
    /// [`PACK_ENTRY_SIZE`].
    pub fn decode(buf: &[u8]) -> PackResult<Self> {
        if buf.len() < PACK_ENTRY_SIZE {
            return Err(PackError::Truncated {
                expected: PACK_ENTRY_SIZE,
                actual: buf.len(),
            });
        }
        let mut reader = ByteReader::new(buf, PACK_ENTRY_SIZE);
        Ok(Self {
            entry_type: reader.read_u32()?,
            name: reader.read_array()?,
            product: reader.read_array()?,
            offset: reader.read_u64()?,
            size: reader.read_u64()?,
            slotted: reader.read_u32()?,
            crc32: reader.read_u32()?,
        })
    }

    /// Encode into the fixed 104-byte layout.
    pub fn encode(&self) -> [u8; PACK_ENTRY_SIZE] {
        let mut out = [0u8; PACK_ENTRY_SIZE];
        let fields: [&[u8]; 7] = [
            &self.entry_type.to_le_bytes(),
            &self.name,
            &self.product,
            &self.offset.to_le_bytes(),
            &self.size.to_le_bytes(),
            &self.slotted.to_le_bytes(),
            &self.crc32.to_le_bytes(),
        ];
        for (dst, src) in out.iter_mut().zip(fields.iter().flat_map(|f| f.iter())) {
            *dst = *src;
        }
        out
    }

    /// Partition name.
    pub fn name(&self) -> String {
        c_str(&self.name)
    }

    /// Product name.
    pub fn product(&self) -> String {
        c_str(&self.product)
    }

    /// Whether this entry carries a partition image.
    pub fn is_partition(&self) -> bool {
        self.entry_type == ENTRY_TYPE_PARTITION
    }

    /// One past the last payload byte, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}
