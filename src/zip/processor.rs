//! Per-part streaming state machine.
//!
//! A [`PartProcessor`] consumes the bytes of one part in whatever chunks the
//! network delivers and turns them into files on disk. It never needs the
//! whole part in memory: bytes that do not yet form a complete frame are kept
//! in a carry-over buffer until the next [`PartProcessor::feed`] call.
//!
//! ## States
//!
//! ```text
//! Init ──┬─> ContinuingFile ──(start-of-part)──> ProcessingFrames
//!        └─> ExpectLocalHeader <──(descriptor / next header)──┘
//!                 │  ├──(regular file)──> ProcessingFrames
//!                 │  ├──(symlink)──> ReadingSymlink ──> ExpectLocalHeader
//!                 │  └──(directory)──> ExpectLocalHeader
//!                 └──(no entries left)──> Done
//! ```
//!
//! Any failure moves the processor to `Error`; the same error is then
//! returned by every later call.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::frame::{FrameKind, parse_frame};
use super::parser::{ParsedArchive, PartFiles};
use super::structures::{
    BASE_PART_SIZE, CompressionMethod, DataDescriptor, FileEntry, LocalFileHeader, PADDING_LFH_NAME,
};
use crate::error::{BurstError, Result};
use crate::io::FrameWriter;
use crate::metrics::{Metrics, NoopMetrics};

const CARRY_INITIAL_CAPACITY: usize = 256 * 1024;

/// Longest symlink target accepted from an archive.
const MAX_SYMLINK_TARGET: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Init,
    /// Waiting for the start-of-part frame of an entry begun in an earlier part.
    ContinuingFile,
    ExpectLocalHeader,
    ProcessingFrames,
    ReadingSymlink,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Regular,
    Symlink,
}

/// The entry whose data is currently being written.
struct OpenEntry {
    file_index: usize,
    path: PathBuf,
    kind: EntryKind,
    /// Present for regular files.
    file: Option<File>,
    /// Uncompressed offset the next data frame decodes to.
    write_offset: u64,
    symlink_target: Vec<u8>,
}

enum Step {
    Advance(usize),
    NeedMoreData,
}

/// Streams one part of a BURST archive to disk.
pub struct PartProcessor<W: FrameWriter> {
    archive: Arc<ParsedArchive>,
    part_index: usize,
    part_start: u64,
    output_dir: PathBuf,
    writer: W,
    metrics: Arc<dyn Metrics>,
    state: ProcessorState,
    failure: Option<BurstError>,
    carry: Vec<u8>,
    /// Bytes of the part consumed by completed steps.
    consumed: u64,
    next_entry: usize,
    current: Option<OpenEntry>,
    is_root: bool,
}

impl<W: FrameWriter> PartProcessor<W> {
    /// Create a processor for part `part_index` of `archive`.
    ///
    /// # Errors
    ///
    /// Returns [`BurstError::InvalidArgument`] if the part index is out of
    /// range.
    pub fn new(
        archive: Arc<ParsedArchive>,
        part_index: usize,
        output_dir: impl Into<PathBuf>,
        writer: W,
    ) -> Result<Self> {
        if part_index >= archive.num_parts() {
            return Err(BurstError::InvalidArgument(format!(
                "part {part_index} out of range, archive has {}",
                archive.num_parts()
            )));
        }
        let part_start = part_index as u64 * archive.part_size;
        // SAFETY: geteuid has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;

        Ok(Self {
            archive,
            part_index,
            part_start,
            output_dir: output_dir.into(),
            writer,
            metrics: Arc::new(NoopMetrics),
            state: ProcessorState::Init,
            failure: None,
            carry: Vec::new(),
            consumed: 0,
            next_entry: 0,
            current: None,
            is_root,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.carry.len()
    }

    /// Consume the next chunk of the part's bytes.
    ///
    /// Chunks may split frames anywhere. After a failure, every call returns
    /// the original error. Once the processor is done, extra bytes are
    /// ignored.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ProcessorState::Error => return Err(self.stored_error()),
            ProcessorState::Done => return Ok(()),
            _ => {}
        }
        if data.is_empty() {
            return Ok(());
        }

        let result = if self.carry.is_empty() {
            match self.drive(data) {
                Ok(used) => {
                    self.keep(&data[used..]);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            self.carry.extend_from_slice(data);
            let mut pending = std::mem::take(&mut self.carry);
            match self.drive(&pending) {
                Ok(used) => {
                    pending.drain(..used);
                    self.carry = pending;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        result.map_err(|e| self.fail(e))
    }

    /// Signal the end of the part's bytes.
    ///
    /// Closes the entry in progress and checks that nothing was left half
    /// parsed.
    ///
    /// # Errors
    ///
    /// [`BurstError::UnexpectedEof`] if bytes are still buffered, a symlink
    /// target was cut short, or local headers listed for this part never
    /// arrived.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state == ProcessorState::Error {
            return Err(self.stored_error());
        }

        let result = self.finish();
        match result {
            Ok(()) => {
                self.state = ProcessorState::Done;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.state == ProcessorState::ReadingSymlink {
            return Err(BurstError::UnexpectedEof(format!(
                "part {} ended inside a symlink target",
                self.part_index
            )));
        }
        self.close_current()?;

        if self.state != ProcessorState::Done && !self.carry.is_empty() {
            return Err(BurstError::UnexpectedEof(format!(
                "{} unparsed bytes left at the end of part {}",
                self.carry.len(),
                self.part_index
            )));
        }
        let outstanding = self.part().entries.len() - self.next_entry;
        if outstanding > 0 {
            return Err(BurstError::UnexpectedEof(format!(
                "part {} ended with {outstanding} local headers not seen",
                self.part_index
            )));
        }
        debug!(part = self.part_index, bytes = self.consumed, "part complete");
        Ok(())
    }

    fn keep(&mut self, rest: &[u8]) {
        if rest.is_empty() {
            return;
        }
        if self.carry.capacity() == 0 {
            self.carry.reserve(CARRY_INITIAL_CAPACITY.max(rest.len()));
        }
        self.carry.extend_from_slice(rest);
    }

    fn fail(&mut self, err: BurstError) -> BurstError {
        warn!(part = self.part_index, error = %err, "part processing failed");
        self.state = ProcessorState::Error;
        self.current = None;
        self.carry = Vec::new();
        self.failure = Some(err.clone());
        err
    }

    fn stored_error(&self) -> BurstError {
        self.failure
            .clone()
            .unwrap_or_else(|| BurstError::ProtocolViolation("processor failed earlier".into()))
    }

    fn part(&self) -> &PartFiles {
        &self.archive.parts[self.part_index]
    }

    /// Archive offset of the next unconsumed byte.
    fn position(&self) -> u64 {
        self.part_start + self.consumed
    }

    /// Run steps until the buffer is exhausted or a frame is incomplete.
    /// Returns the number of bytes consumed.
    fn drive(&mut self, buf: &[u8]) -> Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.step(&buf[offset..])? {
                Step::Advance(n) => {
                    offset += n;
                    self.consumed += n as u64;
                }
                Step::NeedMoreData => break,
            }
        }
        Ok(offset)
    }

    fn step(&mut self, buf: &[u8]) -> Result<Step> {
        match self.state {
            ProcessorState::Init => {
                self.state = if self.part().continuing_file.is_some() {
                    ProcessorState::ContinuingFile
                } else {
                    ProcessorState::ExpectLocalHeader
                };
                trace!(part = self.part_index, state = ?self.state, "starting part");
                Ok(Step::Advance(0))
            }
            ProcessorState::ContinuingFile => self.step_continuing(buf),
            ProcessorState::ExpectLocalHeader => self.step_expect_header(buf),
            ProcessorState::ProcessingFrames => self.step_frames(buf),
            ProcessorState::ReadingSymlink => self.step_symlink(buf),
            ProcessorState::Done => Ok(Step::Advance(buf.len())),
            ProcessorState::Error => Err(self.stored_error()),
        }
    }

    fn step_continuing(&mut self, buf: &[u8]) -> Result<Step> {
        let Some(frame) = parse_frame(buf)? else {
            return Ok(Step::NeedMoreData);
        };
        let FrameKind::StartOfPart { uncompressed_offset } = frame.kind else {
            return Err(BurstError::ProtocolViolation(format!(
                "part {} continues an entry but starts with {:?} instead of a start-of-part frame",
                self.part_index, frame.kind
            )));
        };
        let Some(file_index) = self.part().continuing_file else {
            return Err(BurstError::ProtocolViolation("no continuing entry recorded".into()));
        };

        let name = self.archive.files[file_index].file_name.clone();
        trace!(part = self.part_index, file = %name, uncompressed_offset, "resuming entry");
        self.open_regular(file_index)?;
        if let Some(current) = self.current.as_mut() {
            current.write_offset = uncompressed_offset;
        }
        self.state = ProcessorState::ProcessingFrames;
        Ok(Step::Advance(frame.size))
    }

    fn step_expect_header(&mut self, buf: &[u8]) -> Result<Step> {
        if self.next_entry >= self.part().entries.len() {
            trace!(part = self.part_index, "no entries left");
            self.state = ProcessorState::Done;
            return Ok(Step::Advance(0));
        }
        let Some(frame) = parse_frame(buf)? else {
            return Ok(Step::NeedMoreData);
        };

        match frame.kind {
            FrameKind::Padding => Ok(Step::Advance(frame.size)),
            FrameKind::LocalHeader if is_padding_header(buf) => Ok(Step::Advance(frame.size)),
            FrameKind::LocalHeader => {
                self.begin_entry()?;
                Ok(Step::Advance(frame.size))
            }
            FrameKind::CentralDirectory => Err(BurstError::ProtocolViolation(format!(
                "central directory reached with {} entries of part {} outstanding",
                self.part().entries.len() - self.next_entry,
                self.part_index
            ))),
            kind => Err(BurstError::ProtocolViolation(format!(
                "{kind:?} at offset {} where a local header was expected",
                self.position()
            ))),
        }
    }

    fn step_frames(&mut self, buf: &[u8]) -> Result<Step> {
        let Some(frame) = parse_frame(buf)? else {
            return Ok(Step::NeedMoreData);
        };

        match frame.kind {
            FrameKind::Zstd { uncompressed_size } => {
                let Some(current) = self.current.as_mut() else {
                    return Err(BurstError::ProtocolViolation(
                        "Zstandard frame outside of any entry".into(),
                    ));
                };
                let Some(file) = current.file.as_ref() else {
                    return Err(BurstError::ProtocolViolation(format!(
                        "Zstandard frame inside non-regular entry {}",
                        current.path.display()
                    )));
                };
                self.writer
                    .write_frame(file, &buf[..frame.size], uncompressed_size, current.write_offset)?;
                current.write_offset += uncompressed_size;
                Ok(Step::Advance(frame.size))
            }
            FrameKind::Padding => Ok(Step::Advance(frame.size)),
            FrameKind::StartOfPart { uncompressed_offset } => {
                let at = self.position();
                if at % BASE_PART_SIZE != 0 {
                    return Err(BurstError::ProtocolViolation(format!(
                        "start-of-part frame at unaligned offset {at}"
                    )));
                }
                let Some(current) = self.current.as_mut() else {
                    return Err(BurstError::ProtocolViolation(format!(
                        "start-of-part frame at {at} outside of any entry"
                    )));
                };
                current.write_offset = uncompressed_offset;
                Ok(Step::Advance(frame.size))
            }
            FrameKind::DataDescriptor => {
                let len = self
                    .current
                    .as_ref()
                    .map(|c| self.archive.files[c.file_index].data_descriptor_len() as usize)
                    .filter(|len| *len > 0)
                    .unwrap_or(DataDescriptor::SIZE);
                if buf.len() < len {
                    return Ok(Step::NeedMoreData);
                }
                self.close_current()?;
                self.state = ProcessorState::ExpectLocalHeader;
                Ok(Step::Advance(len))
            }
            FrameKind::LocalHeader if is_padding_header(buf) => Ok(Step::Advance(frame.size)),
            FrameKind::LocalHeader => {
                // Entry without a descriptor; the header belongs to the next one.
                self.close_current()?;
                self.state = ProcessorState::ExpectLocalHeader;
                Ok(Step::Advance(0))
            }
            FrameKind::CentralDirectory => {
                self.close_current()?;
                self.state = ProcessorState::Done;
                Ok(Step::Advance(0))
            }
        }
    }

    fn step_symlink(&mut self, buf: &[u8]) -> Result<Step> {
        let Some(current) = self.current.as_mut() else {
            return Err(BurstError::ProtocolViolation("symlink state without an entry".into()));
        };
        let expected = self.archive.files[current.file_index].uncompressed_size as usize;
        let take = (expected - current.symlink_target.len()).min(buf.len());
        current.symlink_target.extend_from_slice(&buf[..take]);

        if current.symlink_target.len() == expected {
            self.close_current()?;
            self.state = ProcessorState::ExpectLocalHeader;
        }
        Ok(Step::Advance(take))
    }

    /// Handle the local header of the next listed entry.
    fn begin_entry(&mut self) -> Result<()> {
        let listed = self.part().entries[self.next_entry];
        let expected = self.part_start + listed.offset_in_part;
        let at = self.position();
        if at != expected {
            return Err(BurstError::ProtocolViolation(format!(
                "local header at offset {at}, central directory lists the next one at {expected}"
            )));
        }
        self.next_entry += 1;

        let file_index = listed.file_index;
        let entry = &self.archive.files[file_index];
        trace!(part = self.part_index, file = %entry.file_name, offset = at, "entry");

        if entry.is_directory() {
            return self.create_directory(file_index);
        }

        if entry.is_symlink() {
            if entry.compression_method != CompressionMethod::Stored {
                return Err(BurstError::ProtocolViolation(format!(
                    "symlink {} is not stored",
                    entry.file_name
                )));
            }
            if entry.uncompressed_size > MAX_SYMLINK_TARGET {
                return Err(BurstError::ProtocolViolation(format!(
                    "symlink {} has a {}-byte target",
                    entry.file_name, entry.uncompressed_size
                )));
            }
            let empty = entry.uncompressed_size == 0;
            let path = entry_path(&self.output_dir, &entry.file_name)?;
            self.current = Some(OpenEntry {
                file_index,
                path,
                kind: EntryKind::Symlink,
                file: None,
                write_offset: 0,
                symlink_target: Vec::new(),
            });
            if empty {
                self.close_current()?;
            } else {
                self.state = ProcessorState::ReadingSymlink;
            }
            return Ok(());
        }

        match entry.compression_method {
            CompressionMethod::Zstd => {}
            CompressionMethod::Stored if entry.uncompressed_size == 0 => {}
            method => {
                return Err(BurstError::ProtocolViolation(format!(
                    "{} uses {method:?}, only Zstandard data and empty stored entries are supported",
                    entry.file_name
                )));
            }
        }
        self.open_regular(file_index)?;
        self.state = ProcessorState::ProcessingFrames;
        Ok(())
    }

    /// Open (never truncate) the output file of a regular entry.
    fn open_regular(&mut self, file_index: usize) -> Result<()> {
        let entry = &self.archive.files[file_index];
        let path = entry_path(&self.output_dir, &entry.file_name)?;
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|e| BurstError::io(format!("open {}", path.display()), e))?;
        self.metrics.record_file_opened();

        self.current = Some(OpenEntry {
            file_index,
            path,
            kind: EntryKind::Regular,
            file: Some(file),
            write_offset: 0,
            symlink_target: Vec::new(),
        });
        Ok(())
    }

    fn create_directory(&mut self, file_index: usize) -> Result<()> {
        let entry = &self.archive.files[file_index];
        let path = entry_path(&self.output_dir, &entry.file_name)?;
        ensure_directory(&path)?;
        self.metrics.record_file_opened();

        if let Some(mode) = entry.unix_mode {
            warn_on_err(
                fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777)),
                "chmod",
                &path,
            );
        }
        if self.is_root && entry.uid.is_some() {
            warn_on_err(std::os::unix::fs::chown(&path, entry.uid, entry.gid), "chown", &path);
        }
        Ok(())
    }

    /// Finish the open entry: size, mode and owner for files, the link
    /// itself for symlinks.
    fn close_current(&mut self) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let entry = &self.archive.files[open.file_index];

        match open.kind {
            EntryKind::Regular => {
                if let Some(file) = open.file {
                    finish_regular(&file, &open.path, entry, self.is_root);
                }
            }
            EntryKind::Symlink => {
                finish_symlink(&open.path, &open.symlink_target, entry, self.is_root)?;
                self.metrics.record_file_opened();
            }
        }
        Ok(())
    }
}

fn finish_regular(file: &File, path: &Path, entry: &FileEntry, is_root: bool) {
    // Other parts may still be writing; the final length comes from the
    // central directory, not from what this part wrote.
    warn_on_err(file.set_len(entry.uncompressed_size), "truncate", path);
    if let Some(mode) = entry.unix_mode {
        warn_on_err(file.set_permissions(Permissions::from_mode(mode & 0o7777)), "chmod", path);
    }
    if is_root && entry.uid.is_some() {
        warn_on_err(std::os::unix::fs::fchown(file, entry.uid, entry.gid), "chown", path);
    }
}

fn finish_symlink(path: &Path, target: &[u8], entry: &FileEntry, is_root: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot replace existing entry"),
    }
    if let Err(e) = std::os::unix::fs::symlink(OsStr::from_bytes(target), path) {
        warn!(path = %path.display(), error = %e, "symlink failed");
        return Ok(());
    }
    if is_root && entry.uid.is_some() {
        warn_on_err(std::os::unix::fs::lchown(path, entry.uid, entry.gid), "lchown", path);
    }
    Ok(())
}

fn warn_on_err(result: io::Result<()>, op: &str, path: &Path) {
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "{op} failed");
    }
}

fn is_padding_header(buf: &[u8]) -> bool {
    LocalFileHeader::from_bytes(buf).is_ok_and(|h| {
        let name_end = LocalFileHeader::SIZE + h.file_name_length as usize;
        buf.get(LocalFileHeader::SIZE..name_end) == Some(PADDING_LFH_NAME)
    })
}

/// Map an archive entry name to a path under `output_dir`.
///
/// # Errors
///
/// [`BurstError::InvalidArgument`] for empty or absolute names, `.` or `..`
/// components, empty components, NUL bytes and backslashes.
pub fn entry_path(output_dir: &Path, name: &str) -> Result<PathBuf> {
    let invalid = |why: &str| BurstError::InvalidArgument(format!("unsafe entry name {name:?}: {why}"));

    if name.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(invalid("NUL or backslash"));
    }
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }

    let mut path = output_dir.to_path_buf();
    for component in trimmed.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(invalid("empty, '.' or '..' component"));
        }
        path.push(component);
    }
    Ok(path)
}

/// Create `path` and any missing parents. Succeeds if it already exists as a
/// directory, including when another worker created it concurrently.
pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| BurstError::io(format!("create directory {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::zip::parser::{PartFileEntry, build_part_map};
    use crate::zip::structures::*;
    use std::os::unix::fs::FileExt;
    use tempfile::TempDir;

    const PART: u64 = BASE_PART_SIZE;

    /// Decompresses like the real writer and records every call.
    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<(u64, u64)>,
    }

    impl FrameWriter for RecordingWriter {
        fn write_frame(&mut self, file: &File, frame: &[u8], len: u64, offset: u64) -> Result<()> {
            let data = zstd::bulk::decompress(frame, len as usize).unwrap();
            assert_eq!(data.len() as u64, len);
            file.write_all_at(&data, offset).unwrap();
            self.writes.push((offset, len));
            Ok(())
        }
    }

    fn file_entry(name: &str, offset: u64, method: CompressionMethod, size: u64, mode: u32) -> FileEntry {
        FileEntry {
            file_name: name.to_string(),
            local_header_offset: offset,
            compressed_size: 0,
            uncompressed_size: size,
            crc32: 0,
            compression_method: method,
            flags: if method == CompressionMethod::Zstd { FLAG_DATA_DESCRIPTOR } else { 0 },
            last_mod_time: 0,
            last_mod_date: 0,
            extra_field_length: UnixExtraField::SIZE as u16,
            part_index: (offset / PART) as usize,
            unix_mode: Some(mode),
            uid: Some(0),
            gid: Some(0),
            uses_zip64_descriptor: false,
        }
    }

    fn lfh(out: &mut Vec<u8>, name: &str, method: CompressionMethod) {
        let flags = if method == CompressionMethod::Zstd { FLAG_DATA_DESCRIPTOR } else { 0 };
        LocalFileHeader {
            version_needed: method.version_needed(),
            flags,
            compression_method: method.as_u16(),
            last_mod_time: 0,
            last_mod_date: 0,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            file_name_length: name.len() as u16,
            extra_field_length: UnixExtraField::SIZE as u16,
        }
        .write_to(out)
        .unwrap();
        out.extend_from_slice(name.as_bytes());
        UnixExtraField { uid: 0, gid: 0 }.write_to(out).unwrap();
    }

    fn descriptor(out: &mut Vec<u8>, compressed: u64, uncompressed: u64) {
        DataDescriptor { crc32: 0, compressed_size: compressed, uncompressed_size: uncompressed, zip64: false }
            .write_to(out)
            .unwrap();
    }

    fn archive(files: Vec<FileEntry>, archive_size: u64) -> Arc<ParsedArchive> {
        let parts = build_part_map(&files, archive_size, PART);
        Arc::new(ParsedArchive {
            files,
            parts,
            central_dir_offset: archive_size - 1,
            central_dir_size: 1,
            zip64: true,
            archive_size,
            part_size: PART,
        })
    }

    /// One Zstandard entry made of three 100-byte frames, then the central
    /// directory signature.
    fn three_frame_stream() -> (Vec<u8>, Vec<u8>, Arc<ParsedArchive>) {
        let content: Vec<u8> = (0..300u32).map(|i| (i % 97) as u8).collect();
        let mut stream = Vec::new();
        lfh(&mut stream, "data.bin", CompressionMethod::Zstd);
        let data_start = stream.len();
        for chunk in content.chunks(100) {
            stream.extend(zstd::bulk::compress(chunk, 3).unwrap());
        }
        let compressed = (stream.len() - data_start) as u64;
        descriptor(&mut stream, compressed, 300);
        stream.extend_from_slice(b"PK\x01\x02");

        let entry = file_entry("data.bin", 0, CompressionMethod::Zstd, 300, S_IFREG | 0o640);
        let parsed = archive(vec![entry], stream.len() as u64 + 100);
        (stream, content, parsed)
    }

    #[test]
    fn three_frames_become_three_writes() {
        let dir = TempDir::new().unwrap();
        let (stream, content, parsed) = three_frame_stream();
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        p.feed(&stream).unwrap();
        p.finalize().unwrap();

        assert_eq!(p.writer.writes, vec![(0, 100), (100, 100), (200, 100)]);
        assert_eq!(p.state(), ProcessorState::Done);
        let path = dir.path().join("data.bin");
        assert_eq!(fs::read(&path).unwrap(), content);
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o640);
    }

    #[test]
    fn any_split_gives_the_same_result() {
        let (stream, content, parsed) = three_frame_stream();
        for split in 0..=stream.len() {
            let dir = TempDir::new().unwrap();
            let mut p =
                PartProcessor::new(parsed.clone(), 0, dir.path(), RecordingWriter::default()).unwrap();
            p.feed(&stream[..split]).unwrap();
            p.feed(&stream[split..]).unwrap();
            p.finalize().unwrap();
            assert_eq!(p.writer.writes.len(), 3, "split at {split}");
            assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), content);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let dir = TempDir::new().unwrap();
        let (stream, content, parsed) = three_frame_stream();
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        for b in &stream {
            p.feed(std::slice::from_ref(b)).unwrap();
        }
        p.finalize().unwrap();
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), content);
    }

    #[test]
    fn continuing_file_resumes_at_announced_offset() {
        let dir = TempDir::new().unwrap();
        let tail_part: Vec<u8> = vec![b'z'; 1000];

        // Part 1: start-of-part, one frame, descriptor, then a small file.
        let mut stream = Vec::new();
        write_start_of_part_frame(&mut stream, 5000).unwrap();
        stream.extend(zstd::bulk::compress(&tail_part, 3).unwrap());
        descriptor(&mut stream, PART, 6000);
        let small_offset = PART + stream.len() as u64;
        lfh(&mut stream, "small.txt", CompressionMethod::Zstd);
        stream.extend(zstd::bulk::compress(b"hello", 3).unwrap());
        descriptor(&mut stream, 20, 5);
        stream.extend_from_slice(b"PK\x01\x02");

        let mut big = file_entry("dir/big.bin", 0, CompressionMethod::Zstd, 6000, S_IFREG | 0o644);
        big.compressed_size = PART + 100;
        let small = file_entry("small.txt", small_offset, CompressionMethod::Zstd, 5, S_IFREG | 0o644);
        let parsed = archive(vec![big, small], 2 * PART);
        assert_eq!(parsed.parts[1].continuing_file, Some(0));
        assert_eq!(parsed.parts[1].entries, vec![PartFileEntry { file_index: 1, offset_in_part: small_offset - PART }]);

        let mut p = PartProcessor::new(parsed, 1, dir.path(), RecordingWriter::default()).unwrap();
        p.feed(&stream).unwrap();
        p.finalize().unwrap();

        assert_eq!(p.writer.writes[0], (5000, 1000));
        let big = fs::read(dir.path().join("dir/big.bin")).unwrap();
        assert_eq!(big.len(), 6000);
        assert_eq!(&big[5000..], &tail_part[..]);
        assert_eq!(fs::read(dir.path().join("small.txt")).unwrap(), b"hello");
    }

    #[test]
    fn continuing_part_must_open_with_start_of_part() {
        let dir = TempDir::new().unwrap();
        let mut big = file_entry("big.bin", 0, CompressionMethod::Zstd, 6000, S_IFREG | 0o644);
        big.compressed_size = PART + 100;
        let parsed = archive(vec![big], 2 * PART);

        let mut p = PartProcessor::new(parsed, 1, dir.path(), RecordingWriter::default()).unwrap();
        let frame = zstd::bulk::compress(b"abc", 3).unwrap();
        let err = p.feed(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn misaligned_start_of_part_is_sticky_error() {
        let dir = TempDir::new().unwrap();
        let mut stream = Vec::new();
        lfh(&mut stream, "a.bin", CompressionMethod::Zstd);
        write_start_of_part_frame(&mut stream, 0).unwrap();

        let parsed = archive(
            vec![file_entry("a.bin", 0, CompressionMethod::Zstd, 10, S_IFREG | 0o644)],
            1000,
        );
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        let err = p.feed(&stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(p.state(), ProcessorState::Error);

        let again = p.feed(b"anything").unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
        assert_eq!(p.finalize().unwrap_err().to_string(), err.to_string());
    }

    #[test]
    fn leftover_bytes_fail_finalize() {
        let dir = TempDir::new().unwrap();
        let (stream, _, parsed) = three_frame_stream();
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        // Cut inside the data descriptor.
        p.feed(&stream[..stream.len() - 10]).unwrap();
        assert!(p.buffered() > 0);
        let err = p.finalize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn directories_symlinks_and_padding() {
        let dir = TempDir::new().unwrap();
        let mut stream = Vec::new();

        lfh(&mut stream, "d/", CompressionMethod::Stored);
        write_padding_frame(&mut stream, 40).unwrap();
        write_padding_lfh(&mut stream, 100).unwrap();
        let link_offset = stream.len() as u64;
        lfh(&mut stream, "d/link", CompressionMethod::Stored);
        stream.extend_from_slice(b"target.txt");
        let empty_offset = stream.len() as u64;
        lfh(&mut stream, "d/empty", CompressionMethod::Stored);
        stream.extend_from_slice(b"PK\x01\x02");

        let files = vec![
            file_entry("d/", 0, CompressionMethod::Stored, 0, S_IFDIR | 0o750),
            file_entry("d/link", link_offset, CompressionMethod::Stored, 10, S_IFLNK | 0o777),
            file_entry("d/empty", empty_offset, CompressionMethod::Stored, 0, S_IFREG | 0o600),
        ];
        let parsed = archive(files, 4096);
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        for chunk in stream.chunks(7) {
            p.feed(chunk).unwrap();
        }
        p.finalize().unwrap();

        let d = dir.path().join("d");
        assert!(d.is_dir());
        assert_eq!(fs::metadata(&d).unwrap().permissions().mode() & 0o7777, 0o750);
        assert_eq!(fs::read_link(d.join("link")).unwrap(), PathBuf::from("target.txt"));
        assert_eq!(fs::metadata(d.join("empty")).unwrap().len(), 0);
        assert!(p.writer.writes.is_empty());
    }

    #[test]
    fn central_directory_with_entries_outstanding() {
        let dir = TempDir::new().unwrap();
        let parsed = archive(
            vec![file_entry("a.bin", 0, CompressionMethod::Zstd, 10, S_IFREG | 0o644)],
            1000,
        );
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        let err = p.feed(b"PK\x01\x02rest").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn header_at_unexpected_offset() {
        let dir = TempDir::new().unwrap();
        let mut stream = vec![0u8; 0];
        write_padding_frame(&mut stream, 16).unwrap();
        lfh(&mut stream, "a.bin", CompressionMethod::Zstd);
        let parsed = archive(
            vec![file_entry("a.bin", 0, CompressionMethod::Zstd, 10, S_IFREG | 0o644)],
            1000,
        );
        let mut p = PartProcessor::new(parsed, 0, dir.path(), RecordingWriter::default()).unwrap();
        assert_eq!(p.feed(&stream).unwrap_err().kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn part_without_entries_discards_bytes() {
        let dir = TempDir::new().unwrap();
        let parsed = archive(Vec::new(), 3 * PART);
        let mut p = PartProcessor::new(parsed, 2, dir.path(), RecordingWriter::default()).unwrap();
        p.feed(&[0xAB; 1000]).unwrap();
        p.finalize().unwrap();
        assert_eq!(p.state(), ProcessorState::Done);
    }

    #[test]
    fn part_index_out_of_range() {
        let parsed = archive(Vec::new(), PART);
        let err = PartProcessor::new(parsed, 1, "/tmp", RecordingWriter::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn entry_names_are_confined() {
        let out = Path::new("/out");
        assert_eq!(entry_path(out, "a/b.txt").unwrap(), PathBuf::from("/out/a/b.txt"));
        assert_eq!(entry_path(out, "dir/").unwrap(), PathBuf::from("/out/dir"));
        for bad in ["", "/", "/etc/passwd", "../x", "a/../../x", "a/./b", "a//b", "a\\b", "a\0b"] {
            let err = entry_path(out, bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{bad:?}");
        }
    }

    #[test]
    fn ensure_directory_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_directory(&nested).unwrap();
        ensure_directory(&nested).unwrap();
        assert!(nested.is_dir());

        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert_eq!(ensure_directory(&file).unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(ensure_directory(&file.join("below")).unwrap_err().kind(), ErrorKind::Io);
    }
}
