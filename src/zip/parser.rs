//! Central directory parsing and the part reverse index.
//!
//! This module works on byte buffers that have already been fetched; it
//! never does I/O itself. The extractor decides what to fetch and hands the
//! bytes over.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. [`parse_eocd_only`] finds the End of Central Directory in the tail
//!    window, follows the ZIP64 locator and decodes the 8-byte BURST comment
//! 2. The central directory is assembled from the tail and any extra ranges
//!    (see [`super::fetch_plan`])
//! 3. [`parse_from_cd_buffer`] decodes every entry and [`build_part_map`]
//!    inverts the table into per-part entry lists
//!
//! When the tail only holds the end of the central directory,
//! [`parse_partial`] decodes whatever complete entries it can find there.
//! Its result is a preview: the file list may be shorter than the real one.

use tracing::{debug, warn};

use super::structures::*;
use crate::error::{BurstError, Result};

/// An entry of one part's file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartFileEntry {
    /// Index into [`ParsedArchive::files`].
    pub file_index: usize,
    /// Local header offset relative to the part start.
    pub offset_in_part: u64,
}

/// Everything one part processor needs to know about the entries it will see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartFiles {
    /// Entries whose local header lies inside the part, by ascending offset.
    pub entries: Vec<PartFileEntry>,
    /// Entry that started in an earlier part and continues into this one.
    pub continuing_file: Option<usize>,
}

/// Decoded central directory plus the per-part reverse index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArchive {
    pub files: Vec<FileEntry>,
    /// One element per part; `ceil(archive_size / part_size)` long, at least 1.
    pub parts: Vec<PartFiles>,
    pub central_dir_offset: u64,
    pub central_dir_size: u64,
    pub zip64: bool,
    pub archive_size: u64,
    pub part_size: u64,
}

impl ParsedArchive {
    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// Byte range `[start, end)` of part `index` within the archive.
    pub fn part_range(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.part_size;
        let end = (start + self.part_size).min(self.archive_size);
        (start, end)
    }
}

/// What the end records say about the central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EocdInfo {
    pub cd_offset: u64,
    pub cd_size: u64,
    /// Entry count from the end record. Informational only.
    pub entry_count: u64,
    pub is_zip64: bool,
    /// From the BURST comment; zero when the comment is absent or unknown.
    pub first_cdfh_offset_in_tail: u32,
    pub archive_size: u64,
}

/// Reject part sizes that are zero or not a multiple of 8 MiB.
pub fn validate_part_size(part_size: u64) -> Result<()> {
    if part_size == 0 || part_size % BASE_PART_SIZE != 0 {
        return Err(BurstError::InvalidArgument(format!(
            "part size {part_size} is not a positive multiple of {BASE_PART_SIZE}"
        )));
    }
    Ok(())
}

/// Locate and decode the end-of-central-directory records.
///
/// `buffer` must be the last `buffer.len()` bytes of an archive of
/// `archive_size` bytes.
///
/// # Returns
///
/// The central directory location, ZIP64 flag and BURST comment offset.
///
/// # Errors
///
/// - [`BurstError::NoEocd`] if no signature is found
/// - [`BurstError::NeedMoreData`] if the ZIP64 end record lies before the
///   buffer; fetch from the reported offset to the end and retry
/// - [`BurstError::Zip64Unsupported`] if the end record is saturated but no
///   locator precedes it
/// - [`BurstError::Truncated`] if the central directory lies outside the
///   archive
pub fn parse_eocd_only(buffer: &[u8], archive_size: u64) -> Result<EocdInfo> {
    if buffer.len() as u64 > archive_size {
        return Err(BurstError::InvalidArgument(format!(
            "tail of {} bytes is longer than the {archive_size}-byte archive",
            buffer.len()
        )));
    }
    let buffer_start = archive_size - buffer.len() as u64;

    let eocd_pos = find_eocd(buffer).ok_or(BurstError::NoEocd)?;
    let eocd = EndOfCentralDirectory::from_bytes(&buffer[eocd_pos..])?;

    let comment_start = eocd_pos + EndOfCentralDirectory::SIZE;
    let comment_end = (comment_start + eocd.comment_len as usize).min(buffer.len());
    let first_cdfh_offset_in_tail = BurstComment::parse(&buffer[comment_start..comment_end])
        .map(|c| c.first_cdfh_offset_in_tail)
        .unwrap_or(0);

    let locator = eocd_pos
        .checked_sub(Zip64EOCDLocator::SIZE)
        .and_then(|pos| Zip64EOCDLocator::from_bytes(&buffer[pos..]).ok());

    let (cd_offset, cd_size, entry_count, is_zip64) = match locator {
        Some(locator) => {
            if locator.eocd64_offset < buffer_start {
                return Err(BurstError::NeedMoreData(locator.eocd64_offset));
            }
            let pos = (locator.eocd64_offset - buffer_start) as usize;
            let eocd64 = Zip64EOCD::from_bytes(buffer.get(pos..).unwrap_or_default())?;
            (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries, true)
        }
        None if eocd.is_zip64() => {
            return Err(BurstError::Zip64Unsupported(
                "end record fields are saturated but no ZIP64 locator precedes it".into(),
            ));
        }
        None => (
            eocd.cd_offset as u64,
            eocd.cd_size as u64,
            eocd.total_entries as u64,
            false,
        ),
    };

    let cd_end = cd_offset.checked_add(cd_size);
    if cd_end.is_none_or(|end| end > archive_size) || (cd_offset >= archive_size && cd_size > 0) {
        return Err(BurstError::Truncated(format!(
            "central directory at {cd_offset}+{cd_size} lies outside the {archive_size}-byte archive"
        )));
    }

    debug!(
        cd_offset,
        cd_size, entry_count, is_zip64, first_cdfh_offset_in_tail, "parsed end of central directory"
    );

    Ok(EocdInfo {
        cd_offset,
        cd_size,
        entry_count,
        is_zip64,
        first_cdfh_offset_in_tail,
        archive_size,
    })
}

/// Scan backwards for the EOCD signature. Returns its position in `buffer`.
fn find_eocd(buffer: &[u8]) -> Option<usize> {
    let last = buffer.len().checked_sub(EndOfCentralDirectory::SIZE)?;
    (0..=last)
        .rev()
        .find(|&i| &buffer[i..i + 4] == EndOfCentralDirectory::SIGNATURE)
}

/// Decode a complete central directory.
///
/// # Arguments
///
/// * `buffer` - Bytes starting exactly at `cd_offset`, at least `cd_size` long
/// * `cd_offset` / `cd_size` - Central directory location from the end records
/// * `is_zip64` - Whether the archive carries ZIP64 end records
/// * `archive_size` - Total archive length, for the part count
/// * `part_size` - Multiple of 8 MiB
///
/// # Errors
///
/// Returns an error if the first record has a bad signature, a record runs
/// past the buffer, or an entry points outside the archive.
pub fn parse_from_cd_buffer(
    buffer: &[u8],
    cd_offset: u64,
    cd_size: u64,
    is_zip64: bool,
    archive_size: u64,
    part_size: u64,
) -> Result<ParsedArchive> {
    validate_part_size(part_size)?;
    let cd_len = usize::try_from(cd_size)
        .map_err(|_| BurstError::OutOfMemory(format!("central directory of {cd_size} bytes")))?;
    if buffer.len() < cd_len {
        return Err(BurstError::Truncated(format!(
            "central directory buffer holds {} of {cd_size} bytes",
            buffer.len()
        )));
    }

    let files = parse_entries(&buffer[..cd_len], archive_size, part_size, true)?;
    let parts = build_part_map(&files, archive_size, part_size);
    debug!(files = files.len(), parts = parts.len(), "parsed central directory");

    Ok(ParsedArchive {
        files,
        parts,
        central_dir_offset: cd_offset,
        central_dir_size: cd_size,
        zip64: is_zip64,
        archive_size,
        part_size,
    })
}

/// Best-effort decode of the central directory entries present in the tail.
///
/// Decoding starts at the BURST comment's offset (or at the central
/// directory itself when it begins inside the tail) and stops at the end of
/// the buffer or the central directory, whichever comes first. A record cut
/// off by the buffer end ends the scan quietly. The file count is a lower
/// bound.
///
/// # Errors
///
/// Only for unusable arguments: an empty buffer, a bad part size, or a start
/// offset beyond the buffer.
pub fn parse_partial(
    tail: &[u8],
    tail_start: u64,
    eocd: &EocdInfo,
    part_size: u64,
) -> Result<ParsedArchive> {
    if tail.is_empty() {
        return Err(BurstError::InvalidArgument("empty tail buffer".into()));
    }
    validate_part_size(part_size)?;

    let mut archive = ParsedArchive {
        files: Vec::new(),
        parts: Vec::new(),
        central_dir_offset: eocd.cd_offset,
        central_dir_size: eocd.cd_size,
        zip64: eocd.is_zip64,
        archive_size: eocd.archive_size,
        part_size,
    };

    if eocd.first_cdfh_offset_in_tail == BurstComment::NO_CDFH_IN_TAIL {
        archive.parts = build_part_map(&archive.files, eocd.archive_size, part_size);
        return Ok(archive);
    }

    let start = if eocd.cd_offset >= tail_start {
        eocd.cd_offset - tail_start
    } else {
        eocd.first_cdfh_offset_in_tail as u64
    };
    if start >= tail.len() as u64 {
        return Err(BurstError::Truncated(format!(
            "first central directory header at {start} lies beyond the {}-byte tail",
            tail.len()
        )));
    }
    let cd_end = (eocd.cd_offset + eocd.cd_size)
        .saturating_sub(tail_start)
        .min(tail.len() as u64);

    if cd_end > start {
        let window = &tail[start as usize..cd_end as usize];
        archive.files = parse_entries(window, eocd.archive_size, part_size, false)?;
    }
    archive.parts = build_part_map(&archive.files, eocd.archive_size, part_size);
    Ok(archive)
}

/// Full tail-only parse for archives whose central directory lies entirely
/// inside `tail`.
pub fn parse_archive(tail: &[u8], archive_size: u64, part_size: u64) -> Result<ParsedArchive> {
    let eocd = parse_eocd_only(tail, archive_size)?;
    let tail_start = archive_size - tail.len() as u64;
    if eocd.cd_offset < tail_start {
        return Err(BurstError::NeedMoreData(eocd.cd_offset));
    }
    let start = (eocd.cd_offset - tail_start) as usize;
    parse_from_cd_buffer(
        &tail[start..],
        eocd.cd_offset,
        eocd.cd_size,
        eocd.is_zip64,
        archive_size,
        part_size,
    )
}

fn parse_entries(
    buf: &[u8],
    archive_size: u64,
    part_size: u64,
    strict: bool,
) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let rest = &buf[pos..];
        if rest.len() < 4 || &rest[..4] != CentralDirectoryHeader::SIGNATURE {
            if strict && files.is_empty() {
                return Err(BurstError::InvalidSignature(format!(
                    "expected central directory header at offset {pos}"
                )));
            }
            break;
        }

        match parse_entry(rest, archive_size, part_size) {
            Ok((entry, consumed)) => {
                files.push(entry);
                pos += consumed;
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                debug!(parsed = files.len(), error = %e, "partial central directory scan stopped");
                break;
            }
        }
    }

    Ok(files)
}

/// Decode one central directory record. Returns the entry and the record
/// length.
fn parse_entry(buf: &[u8], archive_size: u64, part_size: u64) -> Result<(FileEntry, usize)> {
    let header = CentralDirectoryHeader::from_bytes(buf)?;
    let total = header.total_size();
    if buf.len() < total {
        return Err(BurstError::Truncated(format!(
            "central directory record needs {total} bytes, have {}",
            buf.len()
        )));
    }

    let name_end = CentralDirectoryHeader::SIZE + header.file_name_length as usize;
    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let file_name = String::from_utf8_lossy(&buf[CentralDirectoryHeader::SIZE..name_end]).into_owned();
    let extra = &buf[name_end..name_end + header.extra_field_length as usize];

    let mut uncompressed_size = header.uncompressed_size as u64;
    let mut compressed_size = header.compressed_size as u64;
    let mut local_header_offset = header.local_header_offset as u64;

    // Fields are present in the ZIP64 record only if the 32-bit slot is saturated
    let need_uncompressed = header.uncompressed_size == u32::MAX;
    let need_compressed = header.compressed_size == u32::MAX;
    let need_offset = header.local_header_offset == u32::MAX;
    let mut owner = None;

    for (id, body) in extra_field_records(extra) {
        match id {
            Zip64ExtraField::ID => {
                let mut fields = body.chunks_exact(8).map(|c| {
                    u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                });
                let mut next = |what: &str| {
                    fields.next().ok_or_else(|| {
                        BurstError::Truncated(format!("ZIP64 extra of {file_name} lacks {what}"))
                    })
                };
                if need_uncompressed {
                    uncompressed_size = next("uncompressed size")?;
                }
                if need_compressed {
                    compressed_size = next("compressed size")?;
                }
                if need_offset {
                    local_header_offset = next("local header offset")?;
                }
            }
            UnixExtraField::ID => owner = UnixExtraField::from_body(body),
            _ => {}
        }
    }

    if local_header_offset >= archive_size {
        return Err(BurstError::Truncated(format!(
            "{file_name} has local header offset {local_header_offset} past the archive end"
        )));
    }

    // The producer switches descriptors only past 32 bits, never at 0xFFFFFFFF itself.
    let zip64_descriptor = uncompressed_size > u32::MAX as u64 || compressed_size > u32::MAX as u64;

    let unix_mode = if header.version_made_by >> 8 == 3 {
        Some(header.external_attrs >> 16).filter(|mode| *mode != 0)
    } else {
        None
    };

    let entry = FileEntry {
        file_name,
        local_header_offset,
        compressed_size,
        uncompressed_size,
        crc32: header.crc32,
        compression_method: CompressionMethod::from_u16(header.compression_method),
        flags: header.flags,
        last_mod_time: header.last_mod_time,
        last_mod_date: header.last_mod_date,
        extra_field_length: header.extra_field_length,
        part_index: (local_header_offset / part_size) as usize,
        unix_mode,
        uid: owner.map(|o| o.uid),
        gid: owner.map(|o| o.gid),
        uses_zip64_descriptor: zip64_descriptor,
    };
    Ok((entry, total))
}

/// Invert the file table into per-part lists.
///
/// Counts entries per part first so each list is allocated once, then sorts
/// each list by offset. A part's continuing file is the first entry in table
/// order whose estimated span covers the part's start.
pub fn build_part_map(files: &[FileEntry], archive_size: u64, part_size: u64) -> Vec<PartFiles> {
    let num_parts = archive_size.div_ceil(part_size).max(1) as usize;

    let mut counts = vec![0usize; num_parts];
    for file in files {
        if let Some(count) = counts.get_mut(file.part_index) {
            *count += 1;
        }
    }

    let mut parts: Vec<PartFiles> = counts
        .iter()
        .map(|&n| PartFiles {
            entries: Vec::with_capacity(n),
            continuing_file: None,
        })
        .collect();

    for (file_index, file) in files.iter().enumerate() {
        let Some(part) = parts.get_mut(file.part_index) else {
            warn!(file = %file.file_name, part = file.part_index, "entry outside part range");
            continue;
        };
        part.entries.push(PartFileEntry {
            file_index,
            offset_in_part: file.local_header_offset - file.part_index as u64 * part_size,
        });
    }
    for part in &mut parts {
        part.entries.sort_by_key(|e| e.offset_in_part);
    }

    for (file_index, file) in files.iter().enumerate() {
        let end = file.estimated_end();
        if end == 0 {
            continue;
        }
        let first = file.local_header_offset / part_size + 1;
        let last = ((end - 1) / part_size).min(num_parts as u64 - 1);
        for p in first..=last {
            let part = &mut parts[p as usize];
            match part.continuing_file {
                None => part.continuing_file = Some(file_index),
                Some(existing) => warn!(
                    part = p,
                    existing,
                    candidate = file_index,
                    "more than one entry spans into part"
                ),
            }
        }
    }

    parts
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const MIB: u64 = 1024 * 1024;

    /// Minimal central directory record as the writer emits it.
    pub(crate) fn cdfh_bytes(
        name: &str,
        local_header_offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
        mode: u32,
    ) -> Vec<u8> {
        let sat = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
        let overflow = [local_header_offset, compressed_size, uncompressed_size]
            .iter()
            .any(|v| *v > u32::MAX as u64);
        let over = |v: u64| (overflow && v >= u32::MAX as u64).then_some(v);
        let mut extra = Vec::new();
        UnixExtraField { uid: 1000, gid: 1000 }.write_to(&mut extra).unwrap();
        Zip64ExtraField::write_to(
            &mut extra,
            over(uncompressed_size),
            over(compressed_size),
            over(local_header_offset),
        )
        .unwrap();

        let header = CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY_UNIX,
            version_needed: VERSION_ZSTD,
            flags: FLAG_DATA_DESCRIPTOR,
            compression_method: CompressionMethod::Zstd.as_u16(),
            last_mod_time: 0,
            last_mod_date: 0x21,
            crc32: 0xDEADBEEF,
            compressed_size: sat(compressed_size),
            uncompressed_size: sat(uncompressed_size),
            file_name_length: name.len() as u16,
            extra_field_length: extra.len() as u16,
            file_comment_length: 0,
            disk_number_start: 0,
            internal_attrs: 0,
            external_attrs: mode << 16,
            local_header_offset: sat(local_header_offset),
        };
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&extra);
        out
    }

    fn eocd_bytes(cd_offset: u32, cd_size: u32, comment: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 1,
            total_entries: 1,
            cd_size,
            cd_offset,
            comment_len: comment.len() as u16,
        }
        .write_to(&mut out)
        .unwrap();
        out.extend_from_slice(comment);
        out
    }

    #[test]
    fn eocd_without_comment() {
        let mut buf = vec![0u8; 100];
        buf.extend(eocd_bytes(0, 100, &[]));
        let info = parse_eocd_only(&buf, buf.len() as u64).unwrap();
        assert_eq!(info.cd_offset, 0);
        assert_eq!(info.cd_size, 100);
        assert!(!info.is_zip64);
        assert_eq!(info.first_cdfh_offset_in_tail, 0);
    }

    #[test]
    fn eocd_comment_variants() {
        let cases: [(&[u8], u32); 4] = [
            (&[0x42, 0x52, 0x53, 0x54, 0x01, 0x56, 0x34, 0x12], 0x123456),
            (b"XXXXXXXX", 0),
            (&[0x42, 0x52, 0x53, 0x54, 99, 0x56, 0x34, 0x12], 0),
            (&[0x42, 0x52, 0x53, 0x54, 0x01, 0xFF, 0xFF, 0xFF], BurstComment::NO_CDFH_IN_TAIL),
        ];
        for (comment, expected) in cases {
            let mut buf = vec![0u8; 64];
            buf.extend(eocd_bytes(0, 64, comment));
            let info = parse_eocd_only(&buf, buf.len() as u64).unwrap();
            assert_eq!(info.first_cdfh_offset_in_tail, expected);
        }
    }

    #[test]
    fn eocd_missing() {
        let err = parse_eocd_only(&[0u8; 200], 200).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEocd);
        assert_eq!(parse_eocd_only(&[], 0).unwrap_err().kind(), ErrorKind::NoEocd);
    }

    #[test]
    fn eocd_rejects_cd_outside_archive() {
        let mut buf = vec![0u8; 10];
        buf.extend(eocd_bytes(5, 1000, &[]));
        let err = parse_eocd_only(&buf, buf.len() as u64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);
    }

    fn zip64_tail(cd_offset: u64, cd_size: u64, eocd64_offset: u64) -> Vec<u8> {
        let mut out = Vec::new();
        Zip64EOCD {
            eocd64_size: 44,
            version_made_by: VERSION_MADE_BY_UNIX,
            version_needed: 45,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 3,
            total_entries: 3,
            cd_size,
            cd_offset,
        }
        .write_to(&mut out)
        .unwrap();
        Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        }
        .write_to(&mut out)
        .unwrap();
        out.extend(eocd_bytes(u32::MAX, u32::MAX, &BurstComment { first_cdfh_offset_in_tail: 0 }.to_bytes()));
        out
    }

    #[test]
    fn eocd_follows_zip64_locator() {
        let archive_size = 20 * MIB;
        let tail = zip64_tail(10 * MIB, 2 * MIB, archive_size - 106);
        assert_eq!(tail.len(), 106);
        let info = parse_eocd_only(&tail, archive_size).unwrap();
        assert!(info.is_zip64);
        assert_eq!(info.cd_offset, 10 * MIB);
        assert_eq!(info.cd_size, 2 * MIB);
        assert_eq!(info.entry_count, 3);
    }

    #[test]
    fn eocd_zip64_record_outside_buffer() {
        let archive_size = 20 * MIB;
        let tail = zip64_tail(10 * MIB, 2 * MIB, 12 * MIB);
        let err = parse_eocd_only(&tail, archive_size).unwrap_err();
        assert!(matches!(err, BurstError::NeedMoreData(off) if off == 12 * MIB));
    }

    #[test]
    fn eocd_saturated_without_locator() {
        let mut buf = vec![0u8; 30];
        buf.extend(eocd_bytes(u32::MAX, u32::MAX, &[]));
        let err = parse_eocd_only(&buf, buf.len() as u64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Zip64Unsupported);
    }

    #[test]
    fn full_parse_two_files() {
        let mut cd = cdfh_bytes("test1.txt", 0, 40, 14, S_IFREG | 0o644);
        cd.extend(cdfh_bytes("test2.txt", 100, 60, 33, S_IFREG | 0o600));
        let archive_size = 300;
        let parsed = parse_from_cd_buffer(&cd, 200, cd.len() as u64, false, archive_size, BASE_PART_SIZE).unwrap();

        assert_eq!(parsed.files.len(), 2);
        let f1 = &parsed.files[0];
        assert_eq!(f1.file_name, "test1.txt");
        assert_eq!(f1.uncompressed_size, 14);
        assert_eq!(f1.compression_method, CompressionMethod::Zstd);
        assert_eq!(f1.unix_mode, Some(S_IFREG | 0o644));
        assert_eq!(f1.uid, Some(1000));
        assert!(!f1.uses_zip64_descriptor);
        assert!(f1.has_data_descriptor());
        assert_eq!(parsed.files[1].uncompressed_size, 33);
        assert_eq!(parsed.files[1].local_header_offset, 100);

        assert_eq!(parsed.num_parts(), 1);
        let part = &parsed.parts[0];
        assert_eq!(part.continuing_file, None);
        assert_eq!(part.entries.len(), 2);
        assert_eq!(part.entries[1], PartFileEntry { file_index: 1, offset_in_part: 100 });
    }

    #[test]
    fn zip64_extra_overrides_sizes_and_offset() {
        let big = 5 * 1024 * MIB;
        let cd = cdfh_bytes("big.bin", big + 16, big, big + 1, S_IFREG | 0o644);
        let parsed = parse_from_cd_buffer(&cd, 0, cd.len() as u64, true, 3 * big, BASE_PART_SIZE).unwrap();
        let f = &parsed.files[0];
        assert_eq!(f.uncompressed_size, big + 1);
        assert_eq!(f.compressed_size, big);
        assert_eq!(f.local_header_offset, big + 16);
        assert!(f.uses_zip64_descriptor);
        assert_eq!(f.part_index, ((big + 16) / BASE_PART_SIZE) as usize);
    }

    #[test]
    fn all_ones_sizes_without_zip64_extra_are_literal() {
        let edge = u32::MAX as u64;
        let cd = cdfh_bytes("edge.bin", 0, edge, edge, S_IFREG | 0o644);
        let parsed = parse_from_cd_buffer(&cd, 0, cd.len() as u64, false, 2 * edge, BASE_PART_SIZE).unwrap();
        let f = &parsed.files[0];
        assert_eq!(f.uncompressed_size, edge);
        assert_eq!(f.compressed_size, edge);
        assert!(!f.uses_zip64_descriptor);
        assert_eq!(f.data_descriptor_len(), 16);
    }

    #[test]
    fn all_ones_size_next_to_an_overflowing_one() {
        let edge = u32::MAX as u64;
        let big = 5 * 1024 * MIB;
        let cd = cdfh_bytes("mixed.bin", 0, big, edge, S_IFREG | 0o644);
        let parsed = parse_from_cd_buffer(&cd, 0, cd.len() as u64, true, 2 * big, BASE_PART_SIZE).unwrap();
        let f = &parsed.files[0];
        assert_eq!(f.uncompressed_size, edge);
        assert_eq!(f.compressed_size, big);
        assert!(f.uses_zip64_descriptor);
    }

    #[test]
    fn bad_first_signature_is_fatal_later_one_stops() {
        let garbage = vec![0x55u8; 60];
        let err = parse_from_cd_buffer(&garbage, 0, 60, false, 100, BASE_PART_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);

        let mut cd = cdfh_bytes("a", 0, 10, 10, S_IFREG | 0o644);
        cd.extend_from_slice(&[0x55; 50]);
        let parsed = parse_from_cd_buffer(&cd, 0, cd.len() as u64, false, 100, BASE_PART_SIZE).unwrap();
        assert_eq!(parsed.files.len(), 1);
    }

    #[test]
    fn entry_past_archive_end_is_rejected() {
        let cd = cdfh_bytes("a", 500, 10, 10, S_IFREG | 0o644);
        let err = parse_from_cd_buffer(&cd, 0, cd.len() as u64, false, 100, BASE_PART_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);
    }

    #[test]
    fn reverse_index_and_continuing_files() {
        let part = BASE_PART_SIZE;
        let mut cd = cdfh_bytes("big", 0, 10 * MIB, 12 * MIB, S_IFREG | 0o644);
        cd.extend(cdfh_bytes("late", 10 * MIB + 500, 7 * MIB, 7 * MIB, S_IFREG | 0o644));
        cd.extend(cdfh_bytes("early", 10 * MIB + 100, 300, 300, S_IFREG | 0o644));
        let archive_size = 20 * MIB;
        let parsed = parse_from_cd_buffer(&cd, 19 * MIB, cd.len() as u64, false, archive_size, part).unwrap();

        assert_eq!(parsed.num_parts(), 3);
        assert_eq!(parsed.parts[0].continuing_file, None);
        assert_eq!(parsed.parts[1].continuing_file, Some(0));
        // "late" runs from just past 10 MiB to past 17 MiB
        assert_eq!(parsed.parts[2].continuing_file, Some(1));

        let offsets: Vec<u64> = parsed.parts[1].entries.iter().map(|e| e.offset_in_part).collect();
        assert_eq!(offsets, vec![2 * MIB + 100, 2 * MIB + 500]);
        assert_eq!(parsed.parts[1].entries[0].file_index, 2);

        for (p, files) in parsed.parts.iter().enumerate() {
            for e in &files.entries {
                let f = &parsed.files[e.file_index];
                assert_eq!(f.part_index, p);
                assert_eq!(f.local_header_offset, p as u64 * part + e.offset_in_part);
            }
        }
    }

    #[test]
    fn zip64_descriptor_counts_toward_span() {
        let part = BASE_PART_SIZE;
        let name = "z";
        let mut entry = parse_entry(
            &cdfh_bytes(name, 0, 10, 10, S_IFREG | 0o644),
            2 * part,
            part,
        )
        .unwrap()
        .0;
        // Header + name + extra + data ends 20 bytes before the boundary.
        let fixed = LocalFileHeader::SIZE as u64 + 1 + entry.extra_field_length as u64;
        entry.compressed_size = part - 20 - fixed;

        entry.uses_zip64_descriptor = false;
        let parts = build_part_map(std::slice::from_ref(&entry), 2 * part, part);
        assert_eq!(parts[1].continuing_file, None);

        entry.uses_zip64_descriptor = true;
        let parts = build_part_map(std::slice::from_ref(&entry), 2 * part, part);
        assert_eq!(parts[1].continuing_file, Some(0));
    }

    #[test]
    fn part_count_is_never_zero() {
        assert_eq!(build_part_map(&[], 0, BASE_PART_SIZE).len(), 1);
        assert_eq!(build_part_map(&[], BASE_PART_SIZE, BASE_PART_SIZE).len(), 1);
        assert_eq!(build_part_map(&[], BASE_PART_SIZE + 1, BASE_PART_SIZE).len(), 2);
        assert_eq!(build_part_map(&[], 100 * MIB, 16 * MIB).len(), 7);
    }

    fn partial_fixture(first_cdfh: u64, local_offset: u64) -> (Vec<u8>, u64, EocdInfo) {
        let tail_start = 92 * MIB;
        let mut tail = vec![0u8; first_cdfh as usize];
        tail.extend(cdfh_bytes("tail_file.bin", local_offset, 1000, 1000, S_IFREG | 0o644));
        let cd_offset = 70 * MIB;
        let eocd = EocdInfo {
            cd_offset,
            cd_size: tail_start + tail.len() as u64 - cd_offset,
            entry_count: 1000,
            is_zip64: true,
            first_cdfh_offset_in_tail: first_cdfh as u32,
            archive_size: tail_start + tail.len() as u64 + 100,
        };
        (tail, tail_start, eocd)
    }

    #[test]
    fn partial_parse_from_comment_offset() {
        for (first, local) in [(0, 80 * MIB), (1024, 85 * MIB)] {
            let (tail, tail_start, eocd) = partial_fixture(first, local);
            let parsed = parse_partial(&tail, tail_start, &eocd, BASE_PART_SIZE).unwrap();
            assert_eq!(parsed.files.len(), 1);
            assert_eq!(parsed.files[0].file_name, "tail_file.bin");
            assert_eq!(parsed.files[0].local_header_offset, local);
            assert_eq!(parsed.files[0].part_index, 10);
        }
    }

    #[test]
    fn partial_parse_stops_at_cut_record() {
        let (mut tail, tail_start, mut eocd) = partial_fixture(0, 80 * MIB);
        let first_len = tail.len();
        tail.extend(cdfh_bytes("second", 81 * MIB, 10, 10, S_IFREG | 0o644));
        tail.truncate(first_len + 50);
        eocd.cd_size += 50;
        let parsed = parse_partial(&tail, tail_start, &eocd, BASE_PART_SIZE).unwrap();
        assert_eq!(parsed.files.len(), 1);
    }

    #[test]
    fn partial_parse_argument_errors() {
        let (tail, tail_start, eocd) = partial_fixture(0, 80 * MIB);

        let err = parse_partial(&[], tail_start, &eocd, BASE_PART_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut beyond = eocd;
        beyond.first_cdfh_offset_in_tail = tail.len() as u32 + 10;
        let err = parse_partial(&tail, tail_start, &beyond, BASE_PART_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);

        let err = parse_partial(&tail, tail_start, &eocd, 12 * MIB).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut none = eocd;
        none.first_cdfh_offset_in_tail = BurstComment::NO_CDFH_IN_TAIL;
        let parsed = parse_partial(&tail, tail_start, &none, BASE_PART_SIZE).unwrap();
        assert!(parsed.files.is_empty());
    }
}
