//! # burst
//!
//! Reader for BURST archives: ZIP files whose entry data is a sequence of
//! Zstandard frames aligned to 8 MiB boundaries, so that every 8 MiB part
//! can be downloaded and decoded independently.
//!
//! The reader fetches the archive tail with one range request, decodes the
//! central directory (ZIP64 included), and then streams parts in parallel,
//! each through its own state machine that writes files as frames arrive.
//! On btrfs, frames are handed to the kernel still compressed.
//!
//! ## Features
//!
//! - Range fetches from S3, any HTTP(S) server or a local file
//! - ZIP64 end records and extra fields
//! - Central directories larger than the tail window
//! - Regular files, directories and symlinks with Unix mode and ownership
//! - `BTRFS_IOC_ENCODED_WRITE` with a decompressing fallback
//! - An archive writer producing the same layout
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use burst::{BurstExtractor, ExtractOptions, HttpRangeReader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reader = Arc::new(HttpRangeReader::new("https://example.com/archive.zip")?);
//!     let extractor = BurstExtractor::new(reader);
//!
//!     let summary = extractor.extract(&ExtractOptions::new("./out")).await?;
//!     println!("{} files from {} parts", summary.files, summary.parts_processed);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod zip;

pub use cli::Cli;
pub use error::{BurstError, ErrorKind};
pub use io::{EncodedFrameWriter, FrameWriter, HttpRangeReader, LocalFileReader, RangeFetch};
pub use zip::{BurstExtractor, BurstWriter, EntryMetadata, ExtractOptions, ExtractionSummary, FileEntry};
