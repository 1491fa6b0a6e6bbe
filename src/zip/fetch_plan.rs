//! Planning the range requests that complete the central directory.
//!
//! The first request fetches the last 8 MiB of the archive (the tail). When
//! the central directory starts before the tail, the rest is fetched in
//! part-aligned ranges. Those ranges usually also contain entry data that
//! precedes the central directory; the extractor keeps it as
//! [`BodyDataSegment`]s so the matching parts need no second download.

use bytes::Bytes;

use crate::error::{BurstError, Result};

/// One inclusive byte range to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdFetchRange {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    /// The range begins before the central directory.
    pub has_body_data: bool,
    /// Bytes of entry data at the front of the range.
    pub body_data_size: u64,
}

impl CdFetchRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Already-fetched entry data that sits before the central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDataSegment {
    pub data: Bytes,
    pub archive_offset: u64,
}

impl BodyDataSegment {
    pub fn end(&self) -> u64 {
        self.archive_offset + self.data.len() as u64
    }

    /// The bytes `[start, end)` if this segment holds all of them.
    pub fn slice(&self, start: u64, end: u64) -> Option<Bytes> {
        if start < self.archive_offset || end > self.end() || start > end {
            return None;
        }
        let from = (start - self.archive_offset) as usize;
        let to = (end - self.archive_offset) as usize;
        Some(self.data.slice(from..to))
    }
}

/// Part-aligned ranges covering `[floor(cd_offset), tail_start)`.
///
/// Empty when the central directory starts inside the tail.
pub fn calculate_cd_fetch_ranges(cd_offset: u64, tail_start: u64, part_size: u64) -> Vec<CdFetchRange> {
    let mut ranges = Vec::new();
    if cd_offset >= tail_start || part_size == 0 {
        return ranges;
    }

    let mut start = (cd_offset / part_size) * part_size;
    while start < tail_start {
        let end = (start + part_size - 1).min(tail_start - 1);
        let has_body_data = start < cd_offset;
        let body_data_size = if has_body_data {
            cd_offset.min(end + 1) - start
        } else {
            0
        };
        ranges.push(CdFetchRange {
            start,
            end,
            has_body_data,
            body_data_size,
        });
        start += part_size;
    }
    ranges
}

/// Stitch the central directory together from fetched ranges and the tail.
///
/// `fetched[i]` holds the bytes of `ranges[i]`. Returns the contiguous
/// central directory and at most one body segment: the entry data at the
/// front of the first range that has any.
///
/// # Errors
///
/// - [`BurstError::InvalidArgument`] if `ranges` and `fetched` differ in length
/// - [`BurstError::OutOfMemory`] if the buffer cannot be allocated
/// - [`BurstError::Truncated`] if the pieces leave a gap
pub fn assemble_cd_buffer(
    tail: &Bytes,
    tail_start: u64,
    ranges: &[CdFetchRange],
    fetched: &[Bytes],
    cd_offset: u64,
    cd_size: u64,
) -> Result<(Vec<u8>, Vec<BodyDataSegment>)> {
    if ranges.len() != fetched.len() {
        return Err(BurstError::InvalidArgument(format!(
            "{} ranges but {} fetched buffers",
            ranges.len(),
            fetched.len()
        )));
    }
    let cd_len = usize::try_from(cd_size)
        .map_err(|_| BurstError::OutOfMemory(format!("central directory of {cd_size} bytes")))?;

    let mut cd = Vec::new();
    cd.try_reserve_exact(cd_len)
        .map_err(|e| BurstError::OutOfMemory(format!("central directory of {cd_size} bytes: {e}")))?;
    cd.resize(cd_len, 0);

    let cd_end = cd_offset + cd_size;
    let mut copied = 0u64;
    let mut segments = Vec::new();

    let mut copy_piece = |data: &[u8], data_start: u64| {
        let from = data_start.max(cd_offset);
        let to = (data_start + data.len() as u64).min(cd_end);
        if from < to {
            let src = &data[(from - data_start) as usize..(to - data_start) as usize];
            let dst = (from - cd_offset) as usize;
            cd[dst..dst + src.len()].copy_from_slice(src);
            copied += src.len() as u64;
        }
    };

    for (range, data) in ranges.iter().zip(fetched) {
        copy_piece(data, range.start);
        if range.has_body_data && segments.is_empty() {
            let body = (range.body_data_size as usize).min(data.len());
            segments.push(BodyDataSegment {
                data: data.slice(..body),
                archive_offset: range.start,
            });
        }
    }
    copy_piece(tail, tail_start);

    if copied != cd_size {
        return Err(BurstError::Truncated(format!(
            "assembled {copied} of {cd_size} central directory bytes"
        )));
    }

    Ok((cd, segments))
}

/// Register the entry data at the front of the tail as a body segment.
///
/// Does nothing when the tail begins at or after the central directory.
pub fn add_tail_buffer_segment(
    segments: &mut Vec<BodyDataSegment>,
    tail: &Bytes,
    tail_start: u64,
    cd_offset: u64,
) {
    if tail_start >= cd_offset {
        return;
    }
    let tail_end = tail_start + tail.len() as u64;
    let size = (cd_offset.min(tail_end) - tail_start) as usize;
    segments.push(BodyDataSegment {
        data: tail.slice(..size),
        archive_offset: tail_start,
    });
}

/// The fetched segment holding all of `[start, end)`, if any.
pub fn find_covering_segment(segments: &[BodyDataSegment], start: u64, end: u64) -> Option<Bytes> {
    segments.iter().find_map(|s| s.slice(start, end))
}

/// How many parts need a network fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDownloadPlan {
    pub parts_to_download: usize,
    /// The final part lies inside the tail and is processed from memory.
    pub process_final_from_buffer: bool,
}

/// Split parts into fetched ones and a final one served from the tail.
///
/// `tail_start` is the archive offset of the tail buffer.
pub fn calculate_parts_to_download(num_parts: usize, part_size: u64, tail_start: u64) -> PartDownloadPlan {
    if num_parts == 0 {
        return PartDownloadPlan {
            parts_to_download: 0,
            process_final_from_buffer: false,
        };
    }
    let final_part_start = (num_parts as u64 - 1) * part_size;
    if final_part_start >= tail_start {
        PartDownloadPlan {
            parts_to_download: num_parts - 1,
            process_final_from_buffer: true,
        }
    } else {
        PartDownloadPlan {
            parts_to_download: num_parts,
            process_final_from_buffer: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const PART: u64 = 8 * MIB;

    fn pattern(start: u64, len: u64) -> Bytes {
        Bytes::from((start..start + len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn single_range_with_body_data() {
        // 30 MiB archive, CD at 18 MiB, tail from 22 MiB.
        let ranges = calculate_cd_fetch_ranges(18 * MIB, 22 * MIB, PART);
        assert_eq!(
            ranges,
            vec![CdFetchRange {
                start: 16 * MIB,
                end: 22 * MIB - 1,
                has_body_data: true,
                body_data_size: 2 * MIB,
            }]
        );
        assert_eq!(ranges[0].len(), 6 * MIB);
    }

    #[test]
    fn no_ranges_when_cd_in_tail() {
        assert!(calculate_cd_fetch_ranges(25 * MIB, 22 * MIB, PART).is_empty());
        assert!(calculate_cd_fetch_ranges(22 * MIB, 22 * MIB, PART).is_empty());
    }

    #[test]
    fn ranges_cover_exactly_up_to_tail() {
        for cd_offset in [0, 1, PART - 1, PART, 3 * PART + 17, 10 * PART - 5] {
            for tail_start in [cd_offset + 1, cd_offset + PART, cd_offset + 5 * PART + 3] {
                let ranges = calculate_cd_fetch_ranges(cd_offset, tail_start, PART);
                assert_eq!(ranges[0].start, (cd_offset / PART) * PART);
                assert_eq!(ranges.last().unwrap().end, tail_start - 1);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end + 1, pair[1].start);
                }
                for r in &ranges {
                    assert_eq!(r.start % PART, 0);
                    assert!(r.len() <= PART);
                    assert_eq!(r.has_body_data, r.start < cd_offset);
                }
                let body: u64 = ranges.iter().map(|r| r.body_data_size).sum();
                assert_eq!(body, cd_offset - ranges[0].start);
            }
        }
    }

    #[test]
    fn assembly_reproduces_central_directory() {
        let archive_size = 40 * MIB;
        let tail_start = archive_size - PART;
        let cd_offset = 18 * MIB + 12_345;
        let cd_size = archive_size - 100 - cd_offset;

        let ranges = calculate_cd_fetch_ranges(cd_offset, tail_start, PART);
        assert_eq!(ranges.len(), 2);
        let fetched: Vec<Bytes> = ranges.iter().map(|r| pattern(r.start, r.len())).collect();
        let tail = pattern(tail_start, PART);

        let (cd, segments) =
            assemble_cd_buffer(&tail, tail_start, &ranges, &fetched, cd_offset, cd_size).unwrap();
        assert_eq!(cd, pattern(cd_offset, cd_size).to_vec());

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].archive_offset, 16 * MIB);
        assert_eq!(segments[0].data.len() as u64, cd_offset - 16 * MIB);
        assert_eq!(segments[0].data, pattern(16 * MIB, cd_offset - 16 * MIB));
    }

    #[test]
    fn assembly_detects_short_fetch() {
        let tail_start = 24 * MIB;
        let cd_offset = 20 * MIB;
        let ranges = calculate_cd_fetch_ranges(cd_offset, tail_start, PART);
        let short = vec![pattern(16 * MIB, 5 * MIB)];
        let tail = pattern(tail_start, PART);
        let err = assemble_cd_buffer(&tail, tail_start, &ranges, &short, cd_offset, 10 * MIB).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Truncated);

        let err = assemble_cd_buffer(&tail, tail_start, &ranges, &[], cd_offset, 10 * MIB).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn tail_segment_only_when_tail_precedes_cd() {
        let tail = pattern(16 * MIB, PART);
        let mut segments = Vec::new();
        add_tail_buffer_segment(&mut segments, &tail, 16 * MIB, 16 * MIB);
        assert!(segments.is_empty());

        add_tail_buffer_segment(&mut segments, &tail, 16 * MIB, 19 * MIB);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data.len() as u64, 3 * MIB);

        let hit = find_covering_segment(&segments, 17 * MIB, 18 * MIB).unwrap();
        assert_eq!(hit, pattern(17 * MIB, MIB));
        assert!(find_covering_segment(&segments, 15 * MIB, 17 * MIB).is_none());
        assert!(find_covering_segment(&segments, 18 * MIB, 20 * MIB).is_none());
    }

    #[test]
    fn parts_to_download() {
        let plan = calculate_parts_to_download(5, 16 * MIB, 64 * MIB);
        assert_eq!(plan, PartDownloadPlan { parts_to_download: 4, process_final_from_buffer: true });

        let plan = calculate_parts_to_download(5, 16 * MIB, 65 * MIB);
        assert_eq!(plan, PartDownloadPlan { parts_to_download: 5, process_final_from_buffer: false });

        let plan = calculate_parts_to_download(0, 16 * MIB, 0);
        assert_eq!(plan, PartDownloadPlan { parts_to_download: 0, process_final_from_buffer: false });

        // Single-part archive: everything is in the tail.
        let plan = calculate_parts_to_download(1, PART, 0);
        assert_eq!(plan, PartDownloadPlan { parts_to_download: 0, process_final_from_buffer: true });
    }
}
