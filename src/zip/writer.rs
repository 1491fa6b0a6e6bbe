//! BURST archive writer.
//!
//! Produces archives the part processors can decode independently: regular
//! files are cut into 128 KiB chunks, each compressed into its own Zstandard
//! frame, and frames are placed so that none straddles an 8 MiB boundary.
//! Whenever an entry's data crosses a boundary, a start-of-part frame right
//! after the boundary records where the entry's decompressed output resumes.
//!
//! ## Layout rules
//!
//! - A local header never straddles a boundary; a padding local header named
//!   `.burst_padding` fills the rest of the window instead
//! - Between entries at least [`PADDING_LFH_MIN_SIZE`] bytes remain before
//!   the next boundary, so that gap can always be padded
//! - Data descriptors are written only with room for another padding header
//!   behind them, or right after a start-of-part frame
//! - The end record carries the 8-byte `BRST` comment locating the first
//!   central directory header inside the archive's last 8 MiB

use std::io::{Read, Write};

use flate2::Crc;
use tracing::{debug, trace};

use super::alignment::{self, AlignmentAction, FramePlacement, next_boundary};
use super::structures::*;
use crate::error::{BurstError, Result};

/// Unix metadata stored with each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Permission bits. The file type bits are filled in by the writer.
    pub unix_mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// MS-DOS time and date.
    pub mod_time: u16,
    pub mod_date: u16,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            unix_mode: 0o644,
            uid: 0,
            gid: 0,
            mod_time: 0,
            // 1980-01-01
            mod_date: (1 << 5) | 1,
        }
    }
}

impl EntryMetadata {
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.unix_mode = mode;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

/// Counters reported by [`BurstWriter::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub files: u64,
    pub uncompressed_bytes: u64,
    /// Entry data bytes, padding and start-of-part frames inside entries
    /// included.
    pub compressed_bytes: u64,
    /// Padding frames and padding local headers.
    pub padding_bytes: u64,
    pub frames: u64,
    pub start_of_part_frames: u64,
    pub archive_size: u64,
}

/// What the central directory needs to know about a written entry.
struct WrittenEntry {
    name: String,
    mode: u32,
    uid: u32,
    gid: u32,
    mod_time: u16,
    mod_date: u16,
    method: CompressionMethod,
    flags: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
}

/// Streams a BURST archive into any [`Write`] sink.
pub struct BurstWriter<W: Write> {
    out: W,
    offset: u64,
    entries: Vec<WrittenEntry>,
    compressor: zstd::bulk::Compressor<'static>,
    stats: WriterStats,
}

impl<W: Write> BurstWriter<W> {
    /// Create a writer compressing at `level`.
    ///
    /// # Errors
    ///
    /// Returns an error if the Zstandard context cannot be created.
    pub fn new(out: W, level: i32) -> Result<Self> {
        let compressor = zstd::bulk::Compressor::new(level)
            .map_err(|e| BurstError::io("create Zstandard compressor", e))?;
        Ok(Self {
            out,
            offset: 0,
            entries: Vec::new(),
            compressor,
            stats: WriterStats::default(),
        })
    }

    /// Current archive length.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Add a regular file whose content is read from `reader`.
    ///
    /// # Arguments
    ///
    /// * `name` - Entry path, `/`-separated, relative
    /// * `reader` - Content source, read to EOF in 128 KiB chunks
    /// * `meta` - Permission bits, owner and timestamp
    pub fn add_file<R: Read>(&mut self, name: &str, mut reader: R, meta: EntryMetadata) -> Result<()> {
        check_name(name)?;
        let mut current = read_chunk(&mut reader)?;
        let mut next = if current.len() == FRAME_CHUNK_SIZE {
            read_chunk(&mut reader)?
        } else {
            Vec::new()
        };
        let method = if current.is_empty() {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Zstd
        };

        self.ensure_room(local_header_len(name), 0, true)?;
        let local_header_offset = self.offset;
        let flags = FLAG_DATA_DESCRIPTOR;
        self.write_local_header(name, method, flags, &meta)?;
        let data_start = self.offset;

        let mut crc = Crc::new();
        let mut uncompressed_size = 0u64;

        while !current.is_empty() {
            let at_eof = next.is_empty();
            crc.update(&current);
            let frame = self
                .compressor
                .compress(&current)
                .map_err(|e| BurstError::io("compress chunk", e))?;
            self.place_frame(&frame, at_eof, uncompressed_size, current.len() as u64)?;
            uncompressed_size += current.len() as u64;

            current = next;
            next = if current.len() == FRAME_CHUNK_SIZE {
                read_chunk(&mut reader)?
            } else {
                Vec::new()
            };
        }

        let zip64 = uncompressed_size > u32::MAX as u64;
        let descriptor_len = DataDescriptor::encoded_len(zip64) as u64;
        self.prepare_descriptor(descriptor_len, local_header_offset, uncompressed_size)?;

        let compressed_size = self.offset - data_start;
        let zip64 = zip64 || compressed_size > u32::MAX as u64;
        let descriptor = DataDescriptor {
            crc32: crc.sum(),
            compressed_size,
            uncompressed_size,
            zip64,
        };
        self.write(|w| descriptor.write_to(w).map_err(BurstError::from))?;

        trace!(name, uncompressed_size, compressed_size, "file written");
        self.stats.files += 1;
        self.stats.uncompressed_bytes += uncompressed_size;
        self.stats.compressed_bytes += compressed_size;
        self.entries.push(WrittenEntry {
            name: name.to_string(),
            mode: S_IFREG | (meta.unix_mode & 0o7777),
            uid: meta.uid,
            gid: meta.gid,
            mod_time: meta.mod_time,
            mod_date: meta.mod_date,
            method,
            flags,
            crc32: descriptor.crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
        });
        Ok(())
    }

    /// Add a symlink pointing at `target`, stored uncompressed.
    pub fn add_symlink(&mut self, name: &str, target: &str, meta: EntryMetadata) -> Result<()> {
        check_name(name)?;
        if target.is_empty() || target.len() > 4096 {
            return Err(BurstError::InvalidArgument(format!(
                "symlink target of {} bytes",
                target.len()
            )));
        }
        self.add_stored(name, target.as_bytes(), S_IFLNK | (meta.unix_mode & 0o7777), &meta)
    }

    /// Add a directory entry. A trailing `/` is appended when missing.
    pub fn add_directory(&mut self, name: &str, meta: EntryMetadata) -> Result<()> {
        let name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{name}/")
        };
        check_name(&name)?;
        self.add_stored(&name, &[], S_IFDIR | (meta.unix_mode & 0o7777), &meta)
    }

    fn add_stored(&mut self, name: &str, content: &[u8], mode: u32, meta: &EntryMetadata) -> Result<()> {
        self.ensure_room(local_header_len(name), content.len() as u64, false)?;
        let local_header_offset = self.offset;

        let mut crc = Crc::new();
        crc.update(content);
        let header = LocalFileHeader {
            version_needed: CompressionMethod::Stored.version_needed(),
            flags: 0,
            compression_method: CompressionMethod::Stored.as_u16(),
            last_mod_time: meta.mod_time,
            last_mod_date: meta.mod_date,
            crc32: crc.sum(),
            compressed_size: content.len() as u32,
            uncompressed_size: content.len() as u32,
            file_name_length: name.len() as u16,
            extra_field_length: UnixExtraField::SIZE as u16,
        };
        let unix = UnixExtraField { uid: meta.uid, gid: meta.gid };
        self.write(|w| {
            header.write_to(w)?;
            w.write_all(name.as_bytes())?;
            unix.write_to(w)?;
            w.write_all(content)?;
            Ok(())
        })?;

        self.stats.files += 1;
        self.stats.uncompressed_bytes += content.len() as u64;
        self.stats.compressed_bytes += content.len() as u64;
        self.entries.push(WrittenEntry {
            name: name.to_string(),
            mode,
            uid: meta.uid,
            gid: meta.gid,
            mod_time: meta.mod_time,
            mod_date: meta.mod_date,
            method: CompressionMethod::Stored,
            flags: 0,
            crc32: header.crc32,
            compressed_size: content.len() as u64,
            uncompressed_size: content.len() as u64,
            local_header_offset,
        });
        Ok(())
    }

    /// Write the central directory and end records, returning the sink.
    pub fn finish(mut self) -> Result<(W, WriterStats)> {
        let cd_offset = self.offset;
        let entries = std::mem::take(&mut self.entries);
        let mut header_offsets = Vec::with_capacity(entries.len());

        for entry in &entries {
            header_offsets.push(self.offset);
            self.write_central_header(entry)?;
        }
        let cd_size = self.offset - cd_offset;

        let eocd64_offset = self.offset;
        let eocd64 = Zip64EOCD {
            eocd64_size: (Zip64EOCD::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_MADE_BY_UNIX,
            version_needed: 45,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries.len() as u64,
            total_entries: entries.len() as u64,
            cd_size,
            cd_offset,
        };
        let locator = Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        };
        self.write(|w| {
            eocd64.write_to(w)?;
            locator.write_to(w)?;
            Ok(())
        })?;

        let archive_size = self.offset + EndOfCentralDirectory::SIZE as u64 + BurstComment::SIZE as u64;
        let comment = BurstComment {
            first_cdfh_offset_in_tail: first_cdfh_in_tail(&header_offsets, archive_size),
        };
        let entry_count = u16::try_from(entries.len()).unwrap_or(u16::MAX);
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entry_count,
            total_entries: entry_count,
            cd_size: saturate(cd_size),
            cd_offset: saturate(cd_offset),
            comment_len: BurstComment::SIZE as u16,
        };
        self.write(|w| {
            eocd.write_to(w)?;
            w.write_all(&comment.to_bytes())?;
            Ok(())
        })?;
        self.out.flush()?;

        self.stats.archive_size = self.offset;
        debug!(entries = entries.len(), archive_size = self.offset, cd_offset, cd_size, "archive finished");
        Ok((self.out, self.stats))
    }

    fn write<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CountingWriter<&mut W>) -> Result<()>,
    {
        let mut counter = CountingWriter { inner: &mut self.out, written: 0 };
        f(&mut counter)?;
        self.offset += counter.written;
        Ok(())
    }

    fn write_local_header(&mut self, name: &str, method: CompressionMethod, flags: u16, meta: &EntryMetadata) -> Result<()> {
        let header = LocalFileHeader {
            version_needed: method.version_needed(),
            flags,
            compression_method: method.as_u16(),
            last_mod_time: meta.mod_time,
            last_mod_date: meta.mod_date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            file_name_length: name.len() as u16,
            extra_field_length: UnixExtraField::SIZE as u16,
        };
        let unix = UnixExtraField { uid: meta.uid, gid: meta.gid };
        self.write(|w| {
            header.write_to(w)?;
            w.write_all(name.as_bytes())?;
            unix.write_to(w)?;
            Ok(())
        })
    }

    fn write_central_header(&mut self, entry: &WrittenEntry) -> Result<()> {
        let max = u32::MAX as u64;
        let values = [entry.uncompressed_size, entry.compressed_size, entry.local_header_offset];
        // Once a ZIP64 extra exists, readers expect a field for every 0xFFFFFFFF.
        let overflow = values.iter().any(|v| *v > max);
        let [big_uncompressed, big_compressed, big_offset] = values.map(|v| overflow && v >= max);
        let zip64_fields = [big_uncompressed, big_compressed, big_offset]
            .iter()
            .filter(|b| **b)
            .count();
        let zip64_len = if zip64_fields > 0 { 4 + 8 * zip64_fields } else { 0 };

        let mut external_attrs = entry.mode << 16;
        if entry.mode & S_IFMT == S_IFDIR {
            // MS-DOS directory bit
            external_attrs |= 0x10;
        }
        let version_needed = if zip64_fields > 0 {
            entry.method.version_needed().max(45)
        } else {
            entry.method.version_needed()
        };

        let header = CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY_UNIX,
            version_needed,
            flags: entry.flags,
            compression_method: entry.method.as_u16(),
            last_mod_time: entry.mod_time,
            last_mod_date: entry.mod_date,
            crc32: entry.crc32,
            compressed_size: saturate(entry.compressed_size),
            uncompressed_size: saturate(entry.uncompressed_size),
            file_name_length: entry.name.len() as u16,
            extra_field_length: (UnixExtraField::SIZE + zip64_len) as u16,
            file_comment_length: 0,
            disk_number_start: 0,
            internal_attrs: 0,
            external_attrs,
            local_header_offset: saturate(entry.local_header_offset),
        };
        let unix = UnixExtraField { uid: entry.uid, gid: entry.gid };
        self.write(|w| {
            header.write_to(w)?;
            w.write_all(entry.name.as_bytes())?;
            if zip64_fields > 0 {
                Zip64ExtraField::write_to(
                    w,
                    big_uncompressed.then_some(entry.uncompressed_size),
                    big_compressed.then_some(entry.compressed_size),
                    big_offset.then_some(entry.local_header_offset),
                )?;
            }
            unix.write_to(w)?;
            Ok(())
        })
    }

    fn space_to_boundary(&self) -> u64 {
        next_boundary(self.offset) - self.offset
    }

    /// Pad to the next boundary with a padding header unless a header of
    /// `header_len` bytes, `content_len` bytes of stored content and the
    /// slack for whatever comes next fit before it.
    fn ensure_room(&mut self, header_len: u64, content_len: u64, has_descriptor: bool) -> Result<()> {
        let space = self.space_to_boundary();
        let mut needed = header_len + content_len + PADDING_LFH_MIN_SIZE as u64;
        if has_descriptor {
            needed += START_OF_PART_FRAME_SIZE as u64;
        }
        if space >= needed {
            return Ok(());
        }
        trace!(offset = self.offset, space, "padding header to boundary");
        self.write(|w| write_padding_lfh(w, space as usize))?;
        self.stats.padding_bytes += space;
        Ok(())
    }

    /// Write one data frame following the alignment decision.
    ///
    /// `uncompressed_offset` is where the frame's content starts within the
    /// entry and `uncompressed_len` how much it holds.
    fn place_frame(&mut self, frame: &[u8], at_eof: bool, uncompressed_offset: u64, uncompressed_len: u64) -> Result<()> {
        let decision = alignment::decide(&FramePlacement {
            offset: self.offset,
            frame_size: frame.len() as u64,
            at_file_end: at_eof,
            // Reserve room for the larger descriptor; sizes are not final yet.
            zip64_descriptor: true,
            new_file: false,
        });

        match decision.action {
            AlignmentAction::WriteFrame => self.write_frame(frame)?,
            AlignmentAction::WriteFrameThenMetadata => {
                self.write_frame(frame)?;
                self.write_start_of_part(uncompressed_offset + uncompressed_len)?;
            }
            AlignmentAction::PadThenFrame => {
                self.write_padding(decision.padding_size)?;
                self.write_frame(frame)?;
            }
            AlignmentAction::PadThenMetadata => {
                self.write_padding(decision.padding_size)?;
                self.write_start_of_part(uncompressed_offset)?;
                self.write_frame(frame)?;
            }
        }
        Ok(())
    }

    /// Make sure a descriptor of `descriptor_len` bytes can follow.
    fn prepare_descriptor(&mut self, descriptor_len: u64, local_header_offset: u64, total: u64) -> Result<()> {
        if self.offset % BASE_PART_SIZE == 0 && self.offset > local_header_offset {
            // The last frame ended exactly on a boundary.
            return self.write_start_of_part(total);
        }
        let space = self.space_to_boundary();
        if space < descriptor_len + (PADDING_LFH_MIN_SIZE + MIN_SKIPPABLE_FRAME_SIZE) as u64 {
            self.write_padding(space)?;
            self.write_start_of_part(total)?;
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write(|w| w.write_all(frame).map_err(BurstError::from))?;
        self.stats.frames += 1;
        Ok(())
    }

    fn write_padding(&mut self, size: u64) -> Result<()> {
        self.write(|w| write_padding_frame(w, size as usize))?;
        self.stats.padding_bytes += size;
        Ok(())
    }

    fn write_start_of_part(&mut self, uncompressed_offset: u64) -> Result<()> {
        debug_assert_eq!(self.offset % BASE_PART_SIZE, 0);
        self.write(|w| write_start_of_part_frame(w, uncompressed_offset))?;
        self.stats.start_of_part_frames += 1;
        Ok(())
    }
}

/// Offset of the first central directory header inside the archive's last
/// 8 MiB, relative to the start of that window.
fn first_cdfh_in_tail(header_offsets: &[u64], archive_size: u64) -> u32 {
    let tail_start = archive_size.saturating_sub(BASE_PART_SIZE);
    header_offsets
        .iter()
        .find(|off| **off >= tail_start)
        .map(|off| (off - tail_start) as u32)
        .unwrap_or(BurstComment::NO_CDFH_IN_TAIL)
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn local_header_len(name: &str) -> u64 {
    (LocalFileHeader::SIZE + name.len() + UnixExtraField::SIZE) as u64
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > u16::MAX as usize {
        return Err(BurstError::InvalidArgument(format!("entry name of {} bytes", name.len())));
    }
    if name.as_bytes() == PADDING_LFH_NAME {
        return Err(BurstError::InvalidArgument(format!("{name} is reserved")));
    }
    Ok(())
}

/// Fill a chunk of up to [`FRAME_CHUNK_SIZE`] bytes. Shorter only at EOF.
fn read_chunk<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(FRAME_CHUNK_SIZE);
    reader
        .take(FRAME_CHUNK_SIZE as u64)
        .read_to_end(&mut chunk)
        .map_err(|e| BurstError::io("read entry content", e))?;
    Ok(chunk)
}

struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
