use super::{RangeFetch, TailWindow};
use crate::metrics::{Metrics, NoopMetrics};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Chunk size for [`RangeFetch::stream_range`].
const STREAM_CHUNK_SIZE: u64 = 1024 * 1024;

/// Local file reader with random access support
pub struct LocalFileReader {
    file: Arc<std::fs::File>,
    size: u64,
    metrics: Arc<dyn Metrics>,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Positioned read on the blocking pool.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let file = Arc::clone(&self.file);
        let started = Instant::now();
        let buf = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await?
        .with_context(|| format!("read {len} bytes at offset {offset}"))?;
        self.metrics.record_fetch(len as u64, started.elapsed());
        Ok(Bytes::from(buf))
    }

    fn check_range(&self, start: u64, end: u64) -> Result<()> {
        if end < start || end >= self.size {
            bail!("range {start}-{end} outside a {}-byte file", self.size);
        }
        Ok(())
    }
}

#[async_trait]
impl RangeFetch for LocalFileReader {
    async fn fetch_tail(&self, max_len: u64) -> Result<TailWindow> {
        let len = max_len.min(self.size);
        let start = self.size - len;
        let data = if len == 0 {
            Bytes::new()
        } else {
            self.read_exact_at(start, len as usize).await?
        };
        Ok(TailWindow {
            data,
            start,
            total_size: self.size,
        })
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes> {
        self.check_range(start, end)?;
        self.read_exact_at(start, usize::try_from(end - start + 1)?).await
    }

    async fn stream_range(&self, start: u64, end: u64, tx: mpsc::Sender<Bytes>) -> Result<u64> {
        self.check_range(start, end)?;
        let mut offset = start;
        while offset <= end {
            let len = (end - offset + 1).min(STREAM_CHUNK_SIZE);
            let chunk = self.read_exact_at(offset, len as usize).await?;
            offset += len;
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(offset - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    #[tokio::test]
    async fn tail_shorter_and_longer_than_file() {
        let (file, data) = sample(5000);
        let reader = LocalFileReader::new(file.path()).unwrap();

        let tail = reader.fetch_tail(1000).await.unwrap();
        assert_eq!(tail.start, 4000);
        assert_eq!(tail.total_size, 5000);
        assert_eq!(&tail.data[..], &data[4000..]);

        let whole = reader.fetch_tail(1 << 20).await.unwrap();
        assert_eq!(whole.start, 0);
        assert_eq!(&whole.data[..], &data[..]);
    }

    #[tokio::test]
    async fn ranges_are_inclusive() {
        let (file, data) = sample(5000);
        let reader = LocalFileReader::new(file.path()).unwrap();
        let got = reader.fetch_range(10, 19).await.unwrap();
        assert_eq!(&got[..], &data[10..20]);
        assert!(reader.fetch_range(10, 5000).await.is_err());
    }

    #[tokio::test]
    async fn stream_delivers_everything_in_order() {
        let (file, data) = sample(3 * 1024 * 1024 + 17);
        let reader = LocalFileReader::new(file.path()).unwrap();
        let (tx, mut rx) = mpsc::channel::<Bytes>(2);

        let end = data.len() as u64 - 1;
        let collect = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        });
        let sent = reader.stream_range(5, end, tx).await.unwrap();
        assert_eq!(sent, end - 4);
        assert_eq!(collect.await.unwrap(), &data[5..]);
    }
}
