//! Classifies the next frame in a part's byte stream.
//!
//! Inside a part everything is one of: a Zstandard data frame, a BURST
//! skippable frame (padding or start-of-part), a local file header, a data
//! descriptor, or the first record of the central directory. [`parse_frame`]
//! looks at the leading bytes of a buffer and reports which one it is and how
//! many bytes it spans, or that the buffer does not yet hold the whole thing.

use byteorder::{ByteOrder, LittleEndian};

use super::structures::{
    CentralDirectoryHeader, DataDescriptor, EndOfCentralDirectory, LocalFileHeader,
    MIN_SKIPPABLE_FRAME_SIZE, SKIPPABLE_MAGIC, SKIPPABLE_TYPE_START_OF_PART,
    START_OF_PART_PAYLOAD_SIZE, ZSTD_MAGIC, Zip64EOCD, Zip64EOCDLocator,
};
use crate::error::{BurstError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A Zstandard frame and the size its content decompresses to.
    Zstd { uncompressed_size: u64 },
    Padding,
    /// Decompressed output of the next Zstandard frame begins at this offset
    /// of the current entry.
    StartOfPart { uncompressed_offset: u64 },
    /// Complete local header, name and extra field included.
    LocalHeader,
    /// Fixed 16-byte form; ZIP64 descriptors are 8 bytes longer and the
    /// caller knows which one the current entry uses.
    DataDescriptor,
    /// Start of the central directory or an end record. Reported with size
    /// zero; nothing after it is entry data.
    CentralDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub kind: FrameKind,
    pub size: usize,
}

/// Identify the frame at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed to delimit it; the caller
/// keeps the bytes and retries once more data arrives.
///
/// # Errors
///
/// [`BurstError::ProtocolViolation`] for an unknown magic number, a
/// Zstandard frame without a declared content size, or a malformed frame
/// header.
pub fn parse_frame(buf: &[u8]) -> Result<Option<FrameInfo>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let magic = &buf[0..4];

    if magic == ZSTD_MAGIC {
        return zstd_frame(buf);
    }
    if magic == SKIPPABLE_MAGIC {
        return Ok(skippable_frame(buf));
    }
    if magic == LocalFileHeader::SIGNATURE {
        if buf.len() < LocalFileHeader::SIZE {
            return Ok(None);
        }
        let header = LocalFileHeader::from_bytes(buf)?;
        let size = header.total_size();
        if buf.len() < size {
            return Ok(None);
        }
        return Ok(Some(FrameInfo {
            kind: FrameKind::LocalHeader,
            size,
        }));
    }
    if magic == DataDescriptor::SIGNATURE {
        if buf.len() < DataDescriptor::SIZE {
            return Ok(None);
        }
        return Ok(Some(FrameInfo {
            kind: FrameKind::DataDescriptor,
            size: DataDescriptor::SIZE,
        }));
    }
    if magic == CentralDirectoryHeader::SIGNATURE
        || magic == Zip64EOCD::SIGNATURE
        || magic == Zip64EOCDLocator::SIGNATURE
        || magic == EndOfCentralDirectory::SIGNATURE
    {
        return Ok(Some(FrameInfo {
            kind: FrameKind::CentralDirectory,
            size: 0,
        }));
    }

    Err(BurstError::ProtocolViolation(format!(
        "unrecognised frame magic {:#010x}",
        LittleEndian::read_u32(magic)
    )))
}

fn skippable_frame(buf: &[u8]) -> Option<FrameInfo> {
    if buf.len() < MIN_SKIPPABLE_FRAME_SIZE {
        return None;
    }
    let payload = LittleEndian::read_u32(&buf[4..8]) as usize;
    let size = MIN_SKIPPABLE_FRAME_SIZE + payload;
    if buf.len() < size {
        return None;
    }

    let kind = if payload == START_OF_PART_PAYLOAD_SIZE && buf[8] == SKIPPABLE_TYPE_START_OF_PART {
        FrameKind::StartOfPart {
            uncompressed_offset: LittleEndian::read_u64(&buf[9..17]),
        }
    } else {
        FrameKind::Padding
    };
    Some(FrameInfo { kind, size })
}

/// Walk a Zstandard frame header and its block headers.
fn zstd_frame(buf: &[u8]) -> Result<Option<FrameInfo>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let descriptor = buf[4];
    if descriptor & 0x08 != 0 {
        return Err(BurstError::ProtocolViolation(
            "Zstandard frame header has the reserved bit set".into(),
        ));
    }

    let single_segment = descriptor & 0x20 != 0;
    let has_checksum = descriptor & 0x04 != 0;
    let window_len = if single_segment { 0 } else { 1 };
    let dict_len = [0usize, 1, 2, 4][(descriptor & 0x03) as usize];
    let fcs_len = match descriptor >> 6 {
        0 if single_segment => 1,
        0 => 0,
        1 => 2,
        2 => 4,
        _ => 8,
    };

    if fcs_len == 0 {
        return Err(BurstError::ProtocolViolation(
            "Zstandard frame does not declare its content size".into(),
        ));
    }

    let header_len = 5 + window_len + dict_len + fcs_len;
    if buf.len() < header_len {
        return Ok(None);
    }
    let fcs = &buf[header_len - fcs_len..header_len];
    let uncompressed_size = match fcs_len {
        1 => u64::from(fcs[0]),
        2 => u64::from(LittleEndian::read_u16(fcs)) + 256,
        4 => u64::from(LittleEndian::read_u32(fcs)),
        _ => LittleEndian::read_u64(fcs),
    };

    let mut pos = header_len;
    loop {
        if buf.len() < pos + 3 {
            return Ok(None);
        }
        let block_header = LittleEndian::read_u24(&buf[pos..pos + 3]);
        let last = block_header & 1 != 0;
        let block_size = (block_header >> 3) as usize;
        let content_len = match (block_header >> 1) & 0x03 {
            0 | 2 => block_size,
            1 => 1,
            _ => {
                return Err(BurstError::ProtocolViolation(
                    "Zstandard block uses the reserved block type".into(),
                ));
            }
        };
        pos += 3 + content_len;
        if last {
            break;
        }
    }
    if has_checksum {
        pos += 4;
    }
    if buf.len() < pos {
        return Ok(None);
    }

    // Let libzstd confirm the boundary before anything is decoded from it.
    match zstd::zstd_safe::find_frame_compressed_size(&buf[..pos]) {
        Ok(n) if n == pos => {}
        _ => {
            return Err(BurstError::ProtocolViolation(format!(
                "malformed Zstandard frame of {pos} bytes"
            )));
        }
    }

    Ok(Some(FrameInfo {
        kind: FrameKind::Zstd { uncompressed_size },
        size: pos,
    }))
}
