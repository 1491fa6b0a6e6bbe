use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RangeFetch, TailWindow};
use crate::metrics::{Metrics, NoopMetrics};
use anyhow::{Context, Result, anyhow, bail};

/// HTTP Range reader for remote BURST archives
///
/// Works against any server that honours `Range` requests, S3 included.
/// Requests are unsigned; private objects need a presigned URL.
pub struct HttpRangeReader {
    client: Client,
    url: String,
    transferred_bytes: AtomicU64,
    max_retry: u32,
    metrics: Arc<dyn Metrics>,
}

impl HttpRangeReader {
    /// Create a new HTTP Range reader
    ///
    /// No request is sent until the first fetch; the archive size comes from
    /// the tail request's `Content-Range` header.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            url: url.into(),
            transferred_bytes: AtomicU64::new(0),
            max_retry: 10,
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Reader for `s3://{bucket}/{key}`, optionally through a custom endpoint.
    pub fn for_s3(bucket: &str, region: &str, key: &str, endpoint: Option<&str>) -> Result<Self> {
        Self::new(s3_object_url(bucket, region, key, endpoint)?)
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Send a GET with the given `Range` header, retrying connection
    /// failures and timeouts with linear backoff.
    async fn send_range(&self, range: &str, retry_count: &mut u32) -> Result<reqwest::Response> {
        loop {
            let result = self
                .client
                .get(&self.url)
                .header("Range", range)
                .send()
                .await;

            match result {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_timeout() || e.is_connect() => self.backoff(retry_count, &e).await?,
                Err(e) => return Err(e).with_context(|| format!("GET {} ({range})", self.url)),
            }
        }
    }

    async fn backoff(&self, retry_count: &mut u32, err: &reqwest::Error) -> Result<()> {
        *retry_count += 1;
        if *retry_count >= self.max_retry {
            bail!("Max retries exceeded: {err}");
        }
        warn!(
            retry = *retry_count,
            max_retry = self.max_retry,
            error = %err,
            "connection error, retrying"
        );
        tokio::time::sleep(Duration::from_millis(500 * *retry_count as u64)).await;
        Ok(())
    }

    fn account(&self, bytes: u64, started: Instant) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.metrics.record_fetch(bytes, started.elapsed());
    }
}

#[async_trait]
impl RangeFetch for HttpRangeReader {
    async fn fetch_tail(&self, max_len: u64) -> Result<TailWindow> {
        if max_len == 0 {
            bail!("tail window must not be empty");
        }
        let range = format!("bytes=-{max_len}");
        let started = Instant::now();
        let mut retry_count = 0;

        loop {
            let resp = self.send_range(&range, &mut retry_count).await?;
            let status = resp.status();
            let content_range = resp
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);

            let data = match resp.bytes().await {
                Ok(data) => data,
                Err(e) if e.is_timeout() => {
                    self.backoff(&mut retry_count, &e).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.account(data.len() as u64, started);

            let window = match status {
                StatusCode::PARTIAL_CONTENT => {
                    let header = content_range
                        .ok_or_else(|| anyhow!("206 response without Content-Range"))?;
                    let (start, _end, total_size) = parse_content_range(&header)
                        .ok_or_else(|| anyhow!("malformed Content-Range: {header}"))?;
                    if start + data.len() as u64 != total_size {
                        bail!("tail response {header} carried {} bytes", data.len());
                    }
                    TailWindow { data, start, total_size }
                }
                // The whole object is shorter than the window.
                StatusCode::OK => TailWindow {
                    total_size: data.len() as u64,
                    data,
                    start: 0,
                },
                StatusCode::RANGE_NOT_SATISFIABLE => bail!("{} is empty", self.url),
                status => bail!("HTTP request failed with status: {status}"),
            };
            debug!(
                start = window.start,
                len = window.data.len(),
                total = window.total_size,
                "fetched tail"
            );
            return Ok(window);
        }
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes> {
        if end < start {
            bail!("empty range {start}-{end}");
        }
        let expected_size = usize::try_from(end - start + 1)?;
        let started = Instant::now();

        let mut buf = BytesMut::with_capacity(expected_size);
        let mut retry_count = 0;

        while buf.len() < expected_size {
            let current_start = start + buf.len() as u64;
            let range = format!("bytes={current_start}-{end}");
            let resp = self.send_range(&range, &mut retry_count).await?;
            if resp.status() != StatusCode::PARTIAL_CONTENT {
                bail!("HTTP request failed with status: {}", resp.status());
            }

            match resp.bytes().await {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        bail!("server returned no data for {range}");
                    }
                    let chunk_len = bytes.len().min(expected_size - buf.len());
                    buf.extend_from_slice(&bytes[..chunk_len]);
                    self.transferred_bytes
                        .fetch_add(chunk_len as u64, Ordering::Relaxed);
                }
                Err(e) if e.is_timeout() => self.backoff(&mut retry_count, &e).await?,
                Err(e) => return Err(e.into()),
            }
        }

        self.metrics.record_fetch(buf.len() as u64, started.elapsed());
        Ok(buf.freeze())
    }

    async fn stream_range(&self, start: u64, end: u64, tx: mpsc::Sender<Bytes>) -> Result<u64> {
        if end < start {
            bail!("empty range {start}-{end}");
        }
        let expected_size = end - start + 1;
        let started = Instant::now();
        let mut received = 0u64;
        let mut retry_count = 0;

        'request: while received < expected_size {
            let range = format!("bytes={}-{end}", start + received);
            let received_before = received;
            let mut resp = self.send_range(&range, &mut retry_count).await?;
            if resp.status() != StatusCode::PARTIAL_CONTENT {
                bail!("HTTP request failed with status: {}", resp.status());
            }

            loop {
                match resp.chunk().await {
                    Ok(Some(mut chunk)) => {
                        let room = (expected_size - received) as usize;
                        if chunk.len() > room {
                            chunk.truncate(room);
                        }
                        received += chunk.len() as u64;
                        self.transferred_bytes
                            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        if tx.send(chunk).await.is_err() {
                            // Consumer stopped, usually after a failure.
                            break 'request;
                        }
                        if received == expected_size {
                            break 'request;
                        }
                    }
                    Ok(None) if received == received_before => {
                        bail!("server returned no data for {range}");
                    }
                    Ok(None) if received < expected_size => {
                        // Resume the short response with a new request.
                        continue 'request;
                    }
                    Ok(None) => break 'request,
                    Err(e) if e.is_timeout() => {
                        self.backoff(&mut retry_count, &e).await?;
                        continue 'request;
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("reading {range} of {}", self.url));
                    }
                }
            }
        }

        self.metrics.record_fetch(received, started.elapsed());
        Ok(received)
    }
}

/// Parse `bytes START-END/TOTAL` into its three numbers.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = total.trim().parse().ok()?;
    if end < start || end >= total {
        return None;
    }
    Some((start, end, total))
}

/// URL of an S3 object.
///
/// Virtual-hosted style on AWS; path style (`{endpoint}/{bucket}/{key}`)
/// when a custom endpoint is given. Key segments are percent-encoded.
pub fn s3_object_url(bucket: &str, region: &str, key: &str, endpoint: Option<&str>) -> Result<String> {
    if bucket.is_empty() || key.is_empty() {
        bail!("bucket and key must not be empty");
    }
    let key = key.trim_start_matches('/');

    let (base, mut segments) = match endpoint {
        Some(endpoint) => (endpoint.trim_end_matches('/').to_string(), vec![bucket]),
        None => (format!("https://{bucket}.s3.{region}.amazonaws.com"), Vec::new()),
    };
    segments.extend(key.split('/'));

    let mut url = Url::parse(&base).with_context(|| format!("invalid endpoint {base}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("endpoint {base} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.into())
}
