//! Byte sources and sinks.
//!
//! [`RangeFetch`] abstracts where archive bytes come from (HTTP range
//! requests or a local file); [`FrameWriter`] abstracts how decoded entry
//! data reaches the output files.

mod encoded;
mod http;
mod local;

pub use encoded::{EncodedFrameWriter, FrameWriter};
pub use http::{HttpRangeReader, parse_content_range, s3_object_url};
pub use local::LocalFileReader;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// The last bytes of an archive, as returned by a suffix range request.
#[derive(Debug, Clone)]
pub struct TailWindow {
    pub data: Bytes,
    /// Archive offset of `data[0]`.
    pub start: u64,
    /// Full archive length.
    pub total_size: u64,
}

/// Trait for fetching byte ranges of an archive
#[async_trait]
pub trait RangeFetch: Send + Sync {
    /// Fetch the last `max_len` bytes, or the whole archive if it is shorter.
    async fn fetch_tail(&self, max_len: u64) -> Result<TailWindow>;

    /// Fetch the inclusive range `[start, end]` into memory.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes>;

    /// Stream the inclusive range `[start, end]` into `tx` in arrival order.
    ///
    /// Returns the number of bytes sent. Stops early without error if the
    /// receiver goes away.
    async fn stream_range(&self, start: u64, end: u64, tx: mpsc::Sender<Bytes>) -> Result<u64> {
        let data = self.fetch_range(start, end).await?;
        let len = data.len() as u64;
        let _ = tx.send(data).await;
        Ok(len)
    }
}
