use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

use crate::error::{BurstError, Result};

/// Alignment unit of a BURST archive. Every multiple of this offset is a
/// part boundary.
pub const BASE_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Uncompressed bytes per Zstandard frame.
pub const FRAME_CHUNK_SIZE: usize = 128 * 1024;

/// Largest extent accepted by the compressed-write ioctl.
pub const MAX_EXTENT_SIZE: usize = 128 * 1024;

/// General-purpose flag: sizes and CRC follow the data in a descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

pub const VERSION_STORE: u16 = 10;
pub const VERSION_DEFLATE: u16 = 20;
pub const VERSION_ZSTD: u16 = 63;

/// Host system "Unix" in the upper byte, ZIP version 6.3 in the lower.
pub const VERSION_MADE_BY_UNIX: u16 = (3 << 8) | 63;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Zstd,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            93 => CompressionMethod::Zstd,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Zstd => 93,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    /// Minimum "version needed to extract" for this method.
    pub fn version_needed(&self) -> u16 {
        match self {
            CompressionMethod::Stored => VERSION_STORE,
            CompressionMethod::Deflate => VERSION_DEFLATE,
            CompressionMethod::Zstd | CompressionMethod::Unknown(_) => VERSION_ZSTD,
        }
    }
}

fn truncated(what: &str, needed: usize, got: usize) -> BurstError {
    BurstError::Truncated(format!("{what}: need {needed} bytes, have {got}"))
}

/// Local File Header (LFH) - 30 bytes plus name and extra field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x03\x04";
    pub const SIZE: usize = 30;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(truncated("local file header", Self::SIZE, data.len()));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Err(BurstError::InvalidSignature("local file header".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            compression_method: cursor.read_u16::<LittleEndian>()?,
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Fixed part plus name and extra field.
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.file_name_length as usize + self.extra_field_length as usize
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.compression_method)?;
        w.write_u16::<LittleEndian>(self.last_mod_time)?;
        w.write_u16::<LittleEndian>(self.last_mod_date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.file_name_length)?;
        w.write_u16::<LittleEndian>(self.extra_field_length)
    }
}

/// Data descriptor trailing streamed entry data - 16 bytes, 24 with ZIP64 sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub zip64: bool,
}

impl DataDescriptor {
    pub const SIGNATURE: &'static [u8] = b"PK\x07\x08";
    pub const SIZE: usize = 16;
    pub const ZIP64_SIZE: usize = 24;

    pub fn encoded_len(zip64: bool) -> usize {
        if zip64 { Self::ZIP64_SIZE } else { Self::SIZE }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        if self.zip64 {
            w.write_u64::<LittleEndian>(self.compressed_size)?;
            w.write_u64::<LittleEndian>(self.uncompressed_size)
        } else {
            w.write_u32::<LittleEndian>(self.compressed_size as u32)?;
            w.write_u32::<LittleEndian>(self.uncompressed_size as u32)
        }
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub local_header_offset: u32,
}

impl CentralDirectoryHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x01\x02";
    pub const SIZE: usize = 46;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(truncated("central directory header", Self::SIZE, data.len()));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Err(BurstError::InvalidSignature(
                "central directory file header".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            compression_method: cursor.read_u16::<LittleEndian>()?,
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
            file_comment_length: cursor.read_u16::<LittleEndian>()?,
            disk_number_start: cursor.read_u16::<LittleEndian>()?,
            internal_attrs: cursor.read_u16::<LittleEndian>()?,
            external_attrs: cursor.read_u32::<LittleEndian>()?,
            local_header_offset: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Fixed part plus name, extra field and comment.
    pub fn total_size(&self) -> usize {
        Self::SIZE
            + self.file_name_length as usize
            + self.extra_field_length as usize
            + self.file_comment_length as usize
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.compression_method)?;
        w.write_u16::<LittleEndian>(self.last_mod_time)?;
        w.write_u16::<LittleEndian>(self.last_mod_date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.file_name_length)?;
        w.write_u16::<LittleEndian>(self.extra_field_length)?;
        w.write_u16::<LittleEndian>(self.file_comment_length)?;
        w.write_u16::<LittleEndian>(self.disk_number_start)?;
        w.write_u16::<LittleEndian>(self.internal_attrs)?;
        w.write_u32::<LittleEndian>(self.external_attrs)?;
        w.write_u32::<LittleEndian>(self.local_header_offset)
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(truncated("end of central directory", Self::SIZE, data.len()));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Err(BurstError::InvalidSignature("end of central directory".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.disk_number)?;
        w.write_u16::<LittleEndian>(self.disk_with_cd)?;
        w.write_u16::<LittleEndian>(self.disk_entries)?;
        w.write_u16::<LittleEndian>(self.total_entries)?;
        w.write_u32::<LittleEndian>(self.cd_size)?;
        w.write_u32::<LittleEndian>(self.cd_offset)?;
        w.write_u16::<LittleEndian>(self.comment_len)
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(truncated("ZIP64 locator", Self::SIZE, data.len()));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Err(BurstError::InvalidSignature("ZIP64 locator".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        w.write_u64::<LittleEndian>(self.eocd64_offset)?;
        w.write_u32::<LittleEndian>(self.total_disks)
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(truncated("ZIP64 end of central directory", Self::MIN_SIZE, data.len()));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Err(BurstError::InvalidSignature(
                "ZIP64 end of central directory".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u64::<LittleEndian>(self.eocd64_size)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u32::<LittleEndian>(self.disk_number)?;
        w.write_u32::<LittleEndian>(self.disk_with_cd)?;
        w.write_u64::<LittleEndian>(self.disk_entries)?;
        w.write_u64::<LittleEndian>(self.total_entries)?;
        w.write_u64::<LittleEndian>(self.cd_size)?;
        w.write_u64::<LittleEndian>(self.cd_offset)
    }
}

/// ZIP64 extended information extra field (header ID 0x0001)
pub struct Zip64ExtraField;

impl Zip64ExtraField {
    pub const ID: u16 = 0x0001;

    /// Append the record holding only the fields whose 32-bit slot overflowed,
    /// in the fixed order uncompressed, compressed, local header offset.
    pub fn write_to<W: Write>(
        w: &mut W,
        uncompressed: Option<u64>,
        compressed: Option<u64>,
        offset: Option<u64>,
    ) -> std::io::Result<()> {
        let fields: Vec<u64> = [uncompressed, compressed, offset].into_iter().flatten().collect();
        if fields.is_empty() {
            return Ok(());
        }
        w.write_u16::<LittleEndian>(Self::ID)?;
        w.write_u16::<LittleEndian>((fields.len() * 8) as u16)?;
        for value in fields {
            w.write_u64::<LittleEndian>(value)?;
        }
        Ok(())
    }
}

/// Info-ZIP "Unix type 3" extra field (header ID 0x7875) - 15 bytes with
/// 32-bit ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixExtraField {
    pub uid: u32,
    pub gid: u32,
}

impl UnixExtraField {
    pub const ID: u16 = 0x7875;
    pub const SIZE: usize = 15;

    /// Parse the record body (after the 4-byte id/size header). Id values
    /// wider than 32 bits are truncated to their low 32 bits.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        // version, uid size, uid..., gid size, gid...
        if body.len() < 3 || body[0] != 1 {
            return None;
        }
        let uid_size = body[1] as usize;
        let uid_end = 2 + uid_size;
        let gid_size = *body.get(uid_end)? as usize;
        let gid_start = uid_end + 1;
        let gid_bytes = body.get(gid_start..gid_start + gid_size)?;
        Some(Self {
            uid: le_truncated(&body[2..uid_end]),
            gid: le_truncated(gid_bytes),
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u16::<LittleEndian>(Self::ID)?;
        w.write_u16::<LittleEndian>(11)?;
        w.write_u8(1)?;
        w.write_u8(4)?;
        w.write_u32::<LittleEndian>(self.uid)?;
        w.write_u8(4)?;
        w.write_u32::<LittleEndian>(self.gid)
    }
}

fn le_truncated(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (8 * i)))
}

/// Iterate `(header_id, body)` records of an extra field. Stops at the first
/// record whose declared size runs past the end.
pub fn extra_field_records(extra: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 4 > extra.len() {
            return None;
        }
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let body = extra.get(pos + 4..pos + 4 + size)?;
        pos += 4 + size;
        Some((id, body))
    })
}

/// Trailing 8-byte EOCD comment carried by BURST archives
///
/// Layout: `"BRST"`, version byte, 24-bit little-endian offset of the first
/// central directory header that starts inside the final 8 MiB of the archive,
/// measured from the start of that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstComment {
    pub first_cdfh_offset_in_tail: u32,
}

impl BurstComment {
    pub const MAGIC: &'static [u8] = b"BRST";
    pub const VERSION: u8 = 1;
    pub const SIZE: usize = 8;
    /// No central directory header starts in the tail window.
    pub const NO_CDFH_IN_TAIL: u32 = 0xFF_FFFF;

    /// Returns `None` unless the comment is exactly a version-1 BURST comment.
    pub fn parse(comment: &[u8]) -> Option<Self> {
        if comment.len() != Self::SIZE || &comment[0..4] != Self::MAGIC {
            return None;
        }
        if comment[4] != Self::VERSION {
            return None;
        }
        Some(Self {
            first_cdfh_offset_in_tail: u32::from_le_bytes([comment[5], comment[6], comment[7], 0]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let o = self.first_cdfh_offset_in_tail.to_le_bytes();
        [b'B', b'R', b'S', b'T', Self::VERSION, o[0], o[1], o[2]]
    }
}

/// Zstandard frame magic as it appears on disk.
pub const ZSTD_MAGIC: [u8; 4] = 0xFD2F_B528u32.to_le_bytes();

/// The one skippable-frame magic BURST writes.
pub const SKIPPABLE_MAGIC: [u8; 4] = 0x184D_2A5Bu32.to_le_bytes();

/// Skippable frame header: magic plus 32-bit payload length.
pub const MIN_SKIPPABLE_FRAME_SIZE: usize = 8;

pub const SKIPPABLE_TYPE_PADDING: u8 = 0x00;
pub const SKIPPABLE_TYPE_START_OF_PART: u8 = 0x01;

/// Start-of-part payload: type byte, u64 uncompressed offset, 7 reserved bytes.
pub const START_OF_PART_PAYLOAD_SIZE: usize = 16;
pub const START_OF_PART_FRAME_SIZE: usize = MIN_SKIPPABLE_FRAME_SIZE + START_OF_PART_PAYLOAD_SIZE;

/// Write a skippable frame of `total_size` bytes (header included) with a
/// zeroed payload.
pub fn write_padding_frame<W: Write>(w: &mut W, total_size: usize) -> Result<()> {
    if total_size < MIN_SKIPPABLE_FRAME_SIZE {
        return Err(BurstError::InvalidArgument(format!(
            "padding frame of {total_size} bytes is below the {MIN_SKIPPABLE_FRAME_SIZE}-byte minimum"
        )));
    }
    let payload = total_size - MIN_SKIPPABLE_FRAME_SIZE;
    let payload_len = u32::try_from(payload)
        .map_err(|_| BurstError::InvalidArgument("padding frame too large".into()))?;
    w.write_all(&SKIPPABLE_MAGIC)?;
    w.write_u32::<LittleEndian>(payload_len)?;
    write_zeros(w, payload)?;
    Ok(())
}

/// Write a start-of-part frame announcing the uncompressed offset at which
/// the next Zstandard frame's output begins.
pub fn write_start_of_part_frame<W: Write>(w: &mut W, uncompressed_offset: u64) -> Result<()> {
    w.write_all(&SKIPPABLE_MAGIC)?;
    w.write_u32::<LittleEndian>(START_OF_PART_PAYLOAD_SIZE as u32)?;
    w.write_u8(SKIPPABLE_TYPE_START_OF_PART)?;
    w.write_u64::<LittleEndian>(uncompressed_offset)?;
    w.write_all(&[0u8; 7])?;
    Ok(())
}

pub(crate) fn write_zeros<W: Write>(w: &mut W, mut count: usize) -> std::io::Result<()> {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    while count > 0 {
        let n = count.min(ZEROS.len());
        w.write_all(&ZEROS[..n])?;
        count -= n;
    }
    Ok(())
}

/// File name of the local-header-only entries used to pad to a boundary.
/// They never appear in the central directory.
pub const PADDING_LFH_NAME: &[u8] = b".burst_padding";

/// Smallest gap a padding local header can fill: fixed header plus name.
pub const PADDING_LFH_MIN_SIZE: usize = LocalFileHeader::SIZE + PADDING_LFH_NAME.len();

/// Emit a STORE local header named [`PADDING_LFH_NAME`] whose zero-filled
/// extra field makes it exactly `total_size` bytes long.
pub fn write_padding_lfh<W: Write>(w: &mut W, total_size: usize) -> Result<()> {
    if total_size < PADDING_LFH_MIN_SIZE {
        return Err(BurstError::InvalidArgument(format!(
            "padding header of {total_size} bytes is below the {PADDING_LFH_MIN_SIZE}-byte minimum"
        )));
    }
    let extra = u16::try_from(total_size - PADDING_LFH_MIN_SIZE).map_err(|_| {
        BurstError::InvalidArgument(format!("padding header of {total_size} bytes is too large"))
    })?;
    let header = LocalFileHeader {
        version_needed: VERSION_STORE,
        flags: 0,
        compression_method: CompressionMethod::Stored.as_u16(),
        last_mod_time: 0,
        last_mod_date: 0,
        crc32: 0,
        compressed_size: 0,
        uncompressed_size: 0,
        file_name_length: PADDING_LFH_NAME.len() as u16,
        extra_field_length: extra,
    };
    header.write_to(w)?;
    w.write_all(PADDING_LFH_NAME)?;
    write_zeros(w, extra as usize)?;
    Ok(())
}

/// One central directory entry, as recovered by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file_name: String,
    pub local_header_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub compression_method: CompressionMethod,
    pub flags: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    /// Length of the central directory extra field, used to estimate the
    /// local header size.
    pub extra_field_length: u16,
    /// Index of the part holding the local header.
    pub part_index: usize,
    /// Full `st_mode` when the entry was made on a Unix host.
    pub unix_mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Sizes came from the ZIP64 extra, so the descriptor is 24 bytes.
    pub uses_zip64_descriptor: bool,
}

impl FileEntry {
    pub fn is_directory(&self) -> bool {
        match self.unix_mode {
            Some(mode) => mode & S_IFMT == S_IFDIR,
            None => self.file_name.ends_with('/'),
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.unix_mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK)
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    pub fn data_descriptor_len(&self) -> u64 {
        if !self.has_data_descriptor() {
            0
        } else {
            DataDescriptor::encoded_len(self.uses_zip64_descriptor) as u64
        }
    }

    /// Upper estimate of the archive offset one past the entry's last byte.
    ///
    /// The local extra field is taken to be as long as the central one,
    /// which can only overestimate for archives this crate writes.
    pub fn estimated_end(&self) -> u64 {
        self.local_header_offset
            + LocalFileHeader::SIZE as u64
            + self.file_name.len() as u64
            + self.extra_field_length as u64
            + self.compressed_size
            + self.data_descriptor_len()
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}
