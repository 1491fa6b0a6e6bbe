//! BURST archive format: parsing, streaming extraction and writing.
//!
//! A BURST archive is a ZIP file whose entry data is a sequence of
//! independent Zstandard frames, laid out so that the archive can be cut at
//! every 8 MiB boundary and each piece decoded on its own.
//!
//! ## Architecture
//!
//! - [`structures`]: ZIP records, BURST skippable frames and constants
//! - [`parser`]: end records, central directory and the part reverse index
//! - [`fetch_plan`]: which byte ranges to fetch for the central directory
//!   and for each part
//! - [`frame`]: classifies the next frame of a part's byte stream
//! - [`processor`]: per-part streaming state machine writing files to disk
//! - [`alignment`]: frame placement around 8 MiB boundaries
//! - [`writer`]: produces BURST archives
//! - [`extractor`]: fetch orchestration and concurrent part processing
//!
//! ## Archive layout
//!
//! ```text
//! | LFH | frame | frame | pad | ‖ SoP | frame | desc | LFH | ... | CD | EOCD64 | LOC | EOCD+BRST |
//!                               ^ 8 MiB boundary
//! ```
//!
//! ## Limitations
//!
//! - Entry data must be Zstandard; STORE is accepted for symlinks,
//!   directories and empty files only
//! - No encryption and no multi-disk archives
//! - No CRC verification on extraction

pub mod alignment;
pub mod extractor;
pub mod fetch_plan;
pub mod frame;
pub mod parser;
pub mod processor;
pub mod structures;
pub mod writer;

pub use extractor::{BurstExtractor, ExtractOptions, ExtractionSummary};
pub use parser::{EocdInfo, ParsedArchive, PartFileEntry, PartFiles};
pub use processor::{PartProcessor, ProcessorState};
pub use structures::*;
pub use writer::{BurstWriter, EntryMetadata, WriterStats};
