//! Placement decisions that keep Zstandard frames inside 8 MiB windows.
//!
//! A part processor can only start decoding at a window boundary if no frame
//! straddles it and the first bytes after it tell the reader where the
//! decompressed output resumes. [`decide`] answers, for one frame about to be
//! written at a given offset, whether it can go straight out or whether the
//! writer must first pad to the boundary and emit a start-of-part frame.

use super::structures::{BASE_PART_SIZE, DataDescriptor, MIN_SKIPPABLE_FRAME_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentAction {
    /// The frame fits before the boundary with room to spare.
    WriteFrame,
    /// The frame ends exactly on the boundary; a start-of-part frame must
    /// follow it.
    WriteFrameThenMetadata,
    /// Pad to the boundary, then write the frame. Only used when the frame
    /// opens a new entry, so no start-of-part is needed.
    PadThenFrame,
    /// Pad to the boundary, write a start-of-part frame, then the frame.
    PadThenMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentDecision {
    pub action: AlignmentAction,
    /// First multiple of the part size strictly after the current offset.
    pub next_boundary: u64,
    /// Total size of the padding skippable frame, header included. Zero
    /// unless the action pads.
    pub padding_size: u64,
}

/// One frame about to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlacement {
    pub offset: u64,
    pub frame_size: u64,
    /// The last frame of an entry; its data descriptor must also fit.
    pub at_file_end: bool,
    /// The trailing descriptor uses 64-bit sizes.
    pub zip64_descriptor: bool,
    /// No entry is open at this offset.
    pub new_file: bool,
}

/// First boundary strictly after `offset`. Never equal to `offset`.
pub fn next_boundary(offset: u64) -> u64 {
    (offset / BASE_PART_SIZE + 1) * BASE_PART_SIZE
}

/// Decide how to place a frame.
///
/// Assumes at least [`MIN_SKIPPABLE_FRAME_SIZE`] bytes remain before the
/// next boundary, which the writer maintains between entries and frames.
pub fn decide(placement: &FramePlacement) -> AlignmentDecision {
    let boundary = next_boundary(placement.offset);
    let space = boundary - placement.offset;

    let mut required = placement.frame_size;
    if placement.at_file_end {
        required += DataDescriptor::encoded_len(placement.zip64_descriptor) as u64;
    }

    let min_gap = MIN_SKIPPABLE_FRAME_SIZE as u64;

    let (action, padding_size) = if space == required {
        // At file end the descriptor closes the window; mid-file the next
        // window opens with a start-of-part frame.
        if placement.at_file_end {
            (AlignmentAction::WriteFrame, 0)
        } else {
            (AlignmentAction::WriteFrameThenMetadata, 0)
        }
    } else if space >= required + min_gap {
        (AlignmentAction::WriteFrame, 0)
    } else if placement.new_file {
        (AlignmentAction::PadThenFrame, space)
    } else {
        (AlignmentAction::PadThenMetadata, space)
    };

    AlignmentDecision {
        action,
        next_boundary: boundary,
        padding_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::structures::START_OF_PART_FRAME_SIZE;

    const PART: u64 = BASE_PART_SIZE;

    fn placement(offset: u64, frame_size: u64, at_file_end: bool) -> FramePlacement {
        FramePlacement {
            offset,
            frame_size,
            at_file_end,
            zip64_descriptor: false,
            new_file: false,
        }
    }

    #[test]
    fn boundary_is_strictly_after() {
        assert_eq!(next_boundary(0), PART);
        assert_eq!(next_boundary(PART - 1), PART);
        assert_eq!(next_boundary(PART), 2 * PART);
    }

    #[test]
    fn roomy_frame_is_written() {
        let d = decide(&placement(1000, 4096, false));
        assert_eq!(d.action, AlignmentAction::WriteFrame);
        assert_eq!(d.padding_size, 0);
        assert_eq!(d.next_boundary, PART);
    }

    #[test]
    fn exact_fit_mid_file_needs_metadata() {
        let d = decide(&placement(PART - 4096, 4096, false));
        assert_eq!(d.action, AlignmentAction::WriteFrameThenMetadata);
    }

    #[test]
    fn frame_and_descriptor_filling_the_window_is_plain_write() {
        let d = decide(&placement(PART - 4096 - 16, 4096, true));
        assert_eq!(d.action, AlignmentAction::WriteFrame);
        assert_eq!(d.padding_size, 0);

        let mut zip64 = placement(PART - 4096 - 24, 4096, true);
        zip64.zip64_descriptor = true;
        assert_eq!(decide(&zip64).action, AlignmentAction::WriteFrame);
    }

    #[test]
    fn last_frame_filling_the_window_leaves_no_room_for_descriptor() {
        let offset = PART - 4096;
        let d = decide(&placement(offset, 4096, true));
        assert_eq!(d.action, AlignmentAction::PadThenMetadata);
        assert_eq!(offset + d.padding_size, PART);
    }

    #[test]
    fn tight_fit_pads_to_boundary() {
        // 4 bytes short of the 8-byte gap.
        let offset = PART - 4100;
        let d = decide(&placement(offset, 4096, false));
        assert_eq!(d.action, AlignmentAction::PadThenMetadata);
        assert_eq!(offset + d.padding_size, PART);
    }

    #[test]
    fn descriptor_counts_at_file_end() {
        // Frame plus gap fits, frame plus descriptor plus gap does not.
        let offset = PART - 4096 - 8 - 10;
        assert_eq!(decide(&placement(offset, 4096, false)).action, AlignmentAction::WriteFrame);
        assert_eq!(
            decide(&placement(offset, 4096, true)).action,
            AlignmentAction::PadThenMetadata
        );

        let mut zip64 = placement(PART - 4096 - 8 - 20, 4096, true);
        assert_eq!(decide(&zip64).action, AlignmentAction::WriteFrame);
        zip64.zip64_descriptor = true;
        assert_eq!(decide(&zip64).action, AlignmentAction::PadThenMetadata);
    }

    #[test]
    fn new_file_pads_without_metadata() {
        let mut p = placement(PART - 100, 4096, false);
        p.new_file = true;
        let d = decide(&p);
        assert_eq!(d.action, AlignmentAction::PadThenFrame);
        assert_eq!(p.offset + d.padding_size, PART);
    }

    /// Apply every decision and check that no frame crosses a boundary.
    #[test]
    fn frames_never_straddle_boundaries() {
        let frame_sizes = [1u64, 9, 100, 4096, 65_536, 131_072, 131_587];
        for window in [0u64, 1, 5] {
            let base = window * PART;
            for space in (MIN_SKIPPABLE_FRAME_SIZE as u64..140_000).step_by(97) {
                let offset = base + PART - space;
                for &frame in &frame_sizes {
                    for at_file_end in [false, true] {
                        let d = decide(&placement(offset, frame, at_file_end));
                        let start = match d.action {
                            AlignmentAction::WriteFrame
                            | AlignmentAction::WriteFrameThenMetadata => offset,
                            AlignmentAction::PadThenFrame => offset + d.padding_size,
                            AlignmentAction::PadThenMetadata => {
                                assert_eq!(offset + d.padding_size, d.next_boundary);
                                offset + d.padding_size + START_OF_PART_FRAME_SIZE as u64
                            }
                        };
                        let end = start + frame;
                        assert_eq!(
                            start / PART,
                            (end - 1) / PART,
                            "frame {frame} at {offset} straddles a boundary"
                        );
                        if d.action == AlignmentAction::WriteFrame && end != d.next_boundary {
                            // At least room for a padding frame remains.
                            assert!(d.next_boundary - end >= MIN_SKIPPABLE_FRAME_SIZE as u64);
                        }
                        if at_file_end && d.action == AlignmentAction::WriteFrame {
                            assert!(end + 16 <= d.next_boundary, "descriptor after {frame} at {offset}");
                        }
                        if d.action == AlignmentAction::WriteFrameThenMetadata {
                            assert_eq!(end, d.next_boundary);
                        }
                    }
                }
            }
        }
    }
}
