//! Little-endian cursor helpers shared by the header and entry codecs.

use crate::error::{PackError, PackResult};

/// Bounds-checked forward reader over a byte slice.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Size reported in `Truncated` errors.
    expected: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], expected: usize) -> Self {
        Self {
            buf,
            pos: 0,
            expected,
        }
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> PackResult<[u8; N]> {
        let end = self.pos.checked_add(N).ok_or(PackError::Truncated {
            expected: self.expected,
            actual: self.buf.len(),
        })?;
        let slice = self.buf.get(self.pos..end).ok_or(PackError::Truncated {
            expected: self.expected,
            actual: self.buf.len(),
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u32(&mut self) -> PackResult<u32> {
        self.read_array::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn read_u64(&mut self) -> PackResult<u64> {
        self.read_array::<8>().map(u64::from_le_bytes)
    }
}

/// Decode a NUL-padded fixed-length field.
pub(crate) fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or_default()).into_owned()
}

/// Encode `value` into a NUL-padded fixed-length field.
pub(crate) fn padded<const N: usize>(value: &str) -> PackResult<[u8; N]> {
    let bytes = value.as_bytes();
    if bytes.len() > N {
        return Err(PackError::FieldTooLong {
            value: value.to_string(),
            capacity: N,
        });
    }
    let mut out = [0u8; N];
    for (dst, src) in out.iter_mut().zip(bytes) {
        *dst = *src;
    }
    Ok(out)
}
