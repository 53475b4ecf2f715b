//! Reading and writing whole pack files.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::entry::{PACK_ENTRY_SIZE, PackEntry};
use crate::error::{PackError, PackResult};
use crate::header::{PACK_HEADER_SIZE, PackHeader};

/// An opened fastboot image pack.
///
/// Only the header and entry table are held in memory; payloads are
/// streamed from disk on [`FastbootPack::unpack`].
#[derive(Debug)]
pub struct FastbootPack {
    path: PathBuf,
    header: PackHeader,
    entries: Vec<PackEntry>,
    file_size: u64,
}

impl FastbootPack {
    /// Open a pack file and decode its header and entry table.
    ///
    /// # Errors
    ///
    /// - [`PackError::Truncated`] if the file ends inside the header or entry table
    /// - [`PackError::InvalidMagic`] if the header is not a fastboot pack
    /// - [`PackError::Io`] on read failure
    pub fn open(path: impl AsRef<Path>) -> PackResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let mut raw = [0u8; PACK_HEADER_SIZE];
        read_exact_or_truncated(&mut file, &mut raw, PACK_HEADER_SIZE, file_size)?;
        let header = PackHeader::decode(&raw)?.validated()?;

        let entry_stride = u64::from(header.entry_header_size).max(PACK_ENTRY_SIZE as u64);
        let table_len = entry_stride
            .checked_mul(u64::from(header.total_entries))
            .and_then(|len| len.checked_add(u64::from(header.header_size)))
            .ok_or(PackError::Truncated {
                expected: usize::MAX,
                actual: usize::try_from(file_size).unwrap_or(usize::MAX),
            })?;
        if table_len > file_size {
            return Err(PackError::Truncated {
                expected: usize::try_from(table_len).unwrap_or(usize::MAX),
                actual: usize::try_from(file_size).unwrap_or(usize::MAX),
            });
        }

        let mut entries = Vec::with_capacity(header.total_entries as usize);
        let mut offset = u64::from(header.header_size);
        let mut buf = [0u8; PACK_ENTRY_SIZE];
        for _ in 0..header.total_entries {
            file.seek(SeekFrom::Start(offset))?;
            read_exact_or_truncated(&mut file, &mut buf, PACK_ENTRY_SIZE, file_size)?;
            entries.push(PackEntry::decode(&buf)?);
            offset = offset.saturating_add(entry_stride);
        }

        debug!(
            path = %path.display(),
            platform = %header.platform_str(),
            version = %header.pack_version_str(),
            entries = entries.len(),
            "Opened image pack"
        );

        Ok(Self {
            path,
            header,
            entries,
            file_size,
        })
    }

    /// Decoded pack header.
    pub fn header(&self) -> &PackHeader {
        &self.header
    }

    /// Entry table in file order.
    pub fn entries(&self) -> &[PackEntry] {
        &self.entries
    }

    /// Find a partition entry by name.
    pub fn entry(&self, name: &str) -> Option<&PackEntry> {
        self.entries
            .iter()
            .find(|e| e.is_partition() && e.name() == name)
    }

    /// Write every partition entry accepted by `filter` to `out_dir/<name>.img`.
    ///
    /// Returns the written paths in entry order.
    ///
    /// # Errors
    ///
    /// - [`PackError::EntryOutOfBounds`] if an entry's payload lies outside the file
    /// - [`PackError::Io`] on read or write failure
    pub fn unpack(
        &self,
        out_dir: impl AsRef<Path>,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> PackResult<Vec<PathBuf>> {
        let out_dir = out_dir.as_ref();
        std::fs::create_dir_all(out_dir)?;
        let mut file = File::open(&self.path)?;
        let mut written = Vec::new();

        for entry in self.entries.iter().filter(|e| e.is_partition()) {
            let name = entry.name();
            if filter.is_some_and(|accept| !accept(&name)) {
                continue;
            }
            let in_bounds = entry.end().is_some_and(|end| end <= self.file_size);
            if !in_bounds {
                return Err(PackError::EntryOutOfBounds {
                    name,
                    offset: entry.offset,
                    size: entry.size,
                    pack_size: self.file_size,
                });
            }

            let target = out_dir.join(format!("{name}.img"));
            file.seek(SeekFrom::Start(entry.offset))?;
            let mut out = BufWriter::new(File::create(&target)?);
            let copied = io::copy(&mut (&mut file).take(entry.size), &mut out)?;
            out.flush()?;
            debug!(partition = %name, bytes = copied, "Unpacked partition");
            written.push(target);
        }

        info!(
            pack = %self.path.display(),
            count = written.len(),
            "Unpacked image pack"
        );
        Ok(written)
    }
}

/// Build a pack file from `(partition, payload)` pairs.
///
/// Payloads are laid out back to back after the entry table.
///
/// # Errors
///
/// Returns [`PackError::FieldTooLong`] for partition names over 36 bytes and
/// [`PackError::Io`] on write failure.
pub fn write_pack(
    path: impl AsRef<Path>,
    platform: &str,
    pack_version: &str,
    partitions: &[(&str, &[u8])],
) -> PackResult<()> {
    let mut header = PackHeader::new(platform, pack_version);
    let count = u32::try_from(partitions.len()).map_err(|e| io_invalid(format!("too many partitions: {e}")))?;
    header.total_entries = count;

    let table_end = PACK_HEADER_SIZE.saturating_add(PACK_ENTRY_SIZE.saturating_mul(partitions.len()));
    let mut offset = table_end as u64;
    let mut entries = Vec::with_capacity(partitions.len());
    for (name, payload) in partitions {
        let size = payload.len() as u64;
        entries.push(PackEntry::new(name, platform, offset, size)?);
        offset = offset.saturating_add(size);
    }
    header.total_size = u32::try_from(offset).map_err(|e| io_invalid(format!("pack exceeds 4 GiB: {e}")))?;

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&header.encode())?;
    for entry in &entries {
        out.write_all(&entry.encode())?;
    }
    for (_, payload) in partitions {
        out.write_all(payload)?;
    }
    out.flush()?;
    Ok(())
}

fn io_invalid(msg: String) -> PackError {
    PackError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

fn read_exact_or_truncated(
    file: &mut File,
    buf: &mut [u8],
    expected: usize,
    file_size: u64,
) -> PackResult<()> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(PackError::Truncated {
            expected,
            actual: usize::try_from(file_size).unwrap_or(usize::MAX),
        }),
        Err(e) => Err(e.into()),
    }
}
