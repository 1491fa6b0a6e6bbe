//! Fetch orchestration and concurrent part extraction.
//!
//! [`BurstExtractor`] drives a whole download:
//!
//! 1. Fetch the last 8 MiB and decode the end records
//! 2. Complete the central directory with part-aligned range requests when
//!    it starts before the tail, keeping any entry data those ranges carry
//! 3. Run one [`PartProcessor`] per part that has work, bounded by the
//!    concurrency limit. Each part streams from the fetcher through a bounded
//!    channel into a blocking worker that owns the processor and its frame
//!    writer. Parts whose bytes were already fetched are fed from memory.
//!
//! The first failing part aborts the run. Files written so far are left in
//! place.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::fetch_plan::{
    BodyDataSegment, CdFetchRange, add_tail_buffer_segment, assemble_cd_buffer,
    calculate_cd_fetch_ranges, calculate_parts_to_download, find_covering_segment,
};
use super::parser::{ParsedArchive, parse_eocd_only, parse_from_cd_buffer, parse_partial, validate_part_size};
use super::processor::{PartProcessor, ensure_directory};
use super::structures::{BASE_PART_SIZE, BurstComment, FileEntry};
use crate::error::BurstError;
use crate::io::{EncodedFrameWriter, RangeFetch, TailWindow};
use crate::metrics::{Metrics, NoopMetrics};

/// Chunks in flight between a part's fetch and its worker.
const PART_CHANNEL_DEPTH: usize = 16;

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const MAX_CONCURRENCY: usize = 128;

/// Validated extraction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub output_dir: PathBuf,
    /// Download unit; a multiple of 8 MiB.
    pub part_size: u64,
    /// Parts (and central directory ranges) fetched at once.
    pub concurrency: usize,
}

impl ExtractOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            part_size: BASE_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_part_size(self.part_size)?;
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            bail!("concurrency must be between 1 and {MAX_CONCURRENCY}, got {}", self.concurrency);
        }
        Ok(())
    }
}

/// What an extraction run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub files: usize,
    pub parts_total: usize,
    /// Parts that ran a processor.
    pub parts_processed: usize,
    /// Processed parts fed from already-fetched bytes.
    pub parts_from_memory: usize,
    /// Parts with nothing to write.
    pub parts_skipped: usize,
    /// Bytes fetched for the tail, the central directory and the parts.
    pub bytes_fetched: u64,
}

/// How a part task ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartOutcome {
    /// The processor ran; `fetched` bytes came from the fetcher.
    Processed { fetched: u64 },
    /// Another part failed before this one started.
    Cancelled,
}

impl ExtractionSummary {
    fn record(&mut self, outcome: PartOutcome) {
        if let PartOutcome::Processed { fetched } = outcome {
            self.parts_processed += 1;
            self.bytes_fetched += fetched;
        }
    }
}

/// Where a part's bytes come from.
enum PartSource {
    Memory(Bytes),
    /// Inclusive archive range.
    Fetch { start: u64, end: u64 },
}

/// Parsed archive plus the bytes fetched while parsing it.
struct LoadedArchive {
    archive: Arc<ParsedArchive>,
    tail: TailWindow,
    segments: Vec<BodyDataSegment>,
    bytes_fetched: u64,
}

/// BURST archive extractor
pub struct BurstExtractor<F: RangeFetch> {
    fetcher: Arc<F>,
    metrics: Arc<dyn Metrics>,
    tail_window: u64,
}

impl<F: RangeFetch + 'static> BurstExtractor<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            metrics: Arc::new(NoopMetrics),
            tail_window: BASE_PART_SIZE,
        }
    }

    /// Metrics sink handed to every part worker.
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[cfg(test)]
    fn with_tail_window(mut self, tail_window: u64) -> Self {
        self.tail_window = tail_window;
        self
    }

    /// List all entries in the archive
    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let loaded = self.load(BASE_PART_SIZE, DEFAULT_CONCURRENCY).await?;
        Ok(loaded.archive.files.clone())
    }

    /// Extract every entry into `options.output_dir`.
    ///
    /// # Errors
    ///
    /// Returns the first failure: invalid options, an unreadable central
    /// directory, a failed fetch, or a part processor error.
    pub async fn extract(&self, options: &ExtractOptions) -> Result<ExtractionSummary> {
        options.validate()?;
        ensure_directory(&options.output_dir)?;

        let loaded = self.load(options.part_size, options.concurrency).await?;
        let archive = Arc::clone(&loaded.archive);
        let num_parts = archive.num_parts();
        let plan = calculate_parts_to_download(num_parts, options.part_size, loaded.tail.start);
        debug!(
            num_parts,
            parts_to_download = plan.parts_to_download,
            final_from_buffer = plan.process_final_from_buffer,
            "part plan"
        );

        let mut summary = ExtractionSummary {
            files: archive.files.len(),
            parts_total: num_parts,
            bytes_fetched: loaded.bytes_fetched,
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for index in 0..num_parts {
            let part = &archive.parts[index];
            if part.entries.is_empty() && part.continuing_file.is_none() {
                summary.parts_skipped += 1;
                continue;
            }

            let (start, end) = archive.part_range(index);
            let data_end = end.min(archive.central_dir_offset).max(start);
            let source = if index + 1 == num_parts && plan.process_final_from_buffer {
                let from = (start - loaded.tail.start) as usize;
                let to = (data_end - loaded.tail.start) as usize;
                PartSource::Memory(loaded.tail.data.slice(from..to))
            } else if let Some(data) = find_covering_segment(&loaded.segments, start, data_end) {
                PartSource::Memory(data)
            } else if data_end == start {
                PartSource::Memory(Bytes::new())
            } else {
                PartSource::Fetch { start, end: data_end - 1 }
            };
            if matches!(source, PartSource::Memory(_)) {
                summary.parts_from_memory += 1;
            }

            let job = PartJob {
                fetcher: Arc::clone(&self.fetcher),
                archive: Arc::clone(&archive),
                index,
                output_dir: options.output_dir.clone(),
                metrics: Arc::clone(&self.metrics),
            };
            let semaphore = Arc::clone(&semaphore);
            let failed = Arc::clone(&failed);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                if failed.load(Ordering::Relaxed) {
                    return Ok(PartOutcome::Cancelled);
                }
                let result = job.run(source).await;
                if result.is_err() {
                    failed.store(true, Ordering::Relaxed);
                }
                result.map(|fetched| PartOutcome::Processed { fetched })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow!("part task failed: {e}")),
            };
            match outcome {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        info!(
            files = summary.files,
            parts = summary.parts_processed,
            from_memory = summary.parts_from_memory,
            skipped = summary.parts_skipped,
            bytes_fetched = summary.bytes_fetched,
            "extraction complete"
        );
        Ok(summary)
    }

    /// Fetch and parse the end records and the central directory.
    async fn load(&self, part_size: u64, concurrency: usize) -> Result<LoadedArchive> {
        validate_part_size(part_size)?;
        let mut tail = self
            .fetcher
            .fetch_tail(self.tail_window)
            .await
            .context("fetch archive tail")?;
        let mut bytes_fetched = tail.data.len() as u64;
        if tail.total_size == 0 {
            bail!("archive is empty");
        }

        let eocd = match parse_eocd_only(&tail.data, tail.total_size) {
            Ok(eocd) => eocd,
            Err(BurstError::NeedMoreData(offset)) => {
                debug!(offset, "ZIP64 end record precedes the tail");
                let data = self.fetcher.fetch_range(offset, tail.total_size - 1).await?;
                bytes_fetched += data.len() as u64;
                tail = TailWindow {
                    data,
                    start: offset,
                    total_size: tail.total_size,
                };
                parse_eocd_only(&tail.data, tail.total_size)?
            }
            Err(e) => return Err(e).context("parse end of central directory"),
        };

        let cd_in_tail = eocd.cd_offset >= tail.start;
        if !cd_in_tail
            && tail.data.len() as u64 == BASE_PART_SIZE
            && eocd.first_cdfh_offset_in_tail != BurstComment::NO_CDFH_IN_TAIL
        {
            // The comment offset is relative to the standard 8 MiB window.
            match parse_partial(&tail.data, tail.start, &eocd, part_size) {
                Ok(preview) => info!(
                    files_at_least = preview.files.len(),
                    "central directory preview from tail"
                ),
                Err(e) => debug!(error = %e, "no central directory preview"),
            }
        }

        let mut segments = Vec::new();
        let archive = if cd_in_tail {
            let from = (eocd.cd_offset - tail.start) as usize;
            parse_from_cd_buffer(
                &tail.data[from..],
                eocd.cd_offset,
                eocd.cd_size,
                eocd.is_zip64,
                tail.total_size,
                part_size,
            )?
        } else {
            let ranges = calculate_cd_fetch_ranges(eocd.cd_offset, tail.start, part_size);
            debug!(ranges = ranges.len(), cd_offset = eocd.cd_offset, "fetching central directory");
            let fetched = self.fetch_ranges(&ranges, concurrency).await?;
            bytes_fetched += fetched.iter().map(|b| b.len() as u64).sum::<u64>();

            let (cd, body) = assemble_cd_buffer(
                &tail.data,
                tail.start,
                &ranges,
                &fetched,
                eocd.cd_offset,
                eocd.cd_size,
            )?;
            segments = body;
            parse_from_cd_buffer(
                &cd,
                eocd.cd_offset,
                eocd.cd_size,
                eocd.is_zip64,
                tail.total_size,
                part_size,
            )?
        };
        add_tail_buffer_segment(&mut segments, &tail.data, tail.start, eocd.cd_offset);

        Ok(LoadedArchive {
            archive: Arc::new(archive),
            tail,
            segments,
            bytes_fetched,
        })
    }

    /// Fetch the central directory ranges, at most `concurrency` at a time.
    async fn fetch_ranges(&self, ranges: &[CdFetchRange], concurrency: usize) -> Result<Vec<Bytes>> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (i, range) in ranges.iter().copied().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let data = fetcher
                    .fetch_range(range.start, range.end)
                    .await
                    .with_context(|| format!("fetch central directory range {}-{}", range.start, range.end))?;
                anyhow::Ok((i, data))
            });
        }

        let mut fetched = vec![Bytes::new(); ranges.len()];
        while let Some(joined) = tasks.join_next().await {
            let (i, data) = joined??;
            fetched[i] = data;
        }
        Ok(fetched)
    }
}

/// Everything a part task needs, moved into the task.
struct PartJob<F: RangeFetch> {
    fetcher: Arc<F>,
    archive: Arc<ParsedArchive>,
    index: usize,
    output_dir: PathBuf,
    metrics: Arc<dyn Metrics>,
}

impl<F: RangeFetch + 'static> PartJob<F> {
    /// Process one part. Returns the bytes fetched for it.
    async fn run(self, source: PartSource) -> Result<u64> {
        let index = self.index;
        let (tx, mut rx) = mpsc::channel::<Bytes>(PART_CHANNEL_DEPTH);

        let archive = self.archive;
        let output_dir = self.output_dir;
        let metrics = self.metrics;
        let worker = tokio::task::spawn_blocking(move || -> crate::error::Result<()> {
            let writer = EncodedFrameWriter::new()?.with_metrics(Arc::clone(&metrics));
            let mut processor = PartProcessor::new(archive, index, output_dir, writer)?.with_metrics(metrics);
            while let Some(chunk) = rx.blocking_recv() {
                processor.feed(&chunk)?;
            }
            processor.finalize()
        });

        let fetched = match source {
            PartSource::Memory(data) => {
                if !data.is_empty() {
                    // A closed channel means the worker failed; its error is reported below.
                    let _ = tx.send(data).await;
                }
                drop(tx);
                Ok(0)
            }
            PartSource::Fetch { start, end } => self
                .fetcher
                .stream_range(start, end, tx)
                .await
                .with_context(|| format!("fetch part {index} ({start}-{end})")),
        };

        let processed = worker
            .await
            .map_err(|e| anyhow!("part {index} worker failed: {e}"))?;
        let fetched = match (fetched, processed) {
            (Err(fetch_err), Err(worker_err)) => {
                warn!(part = index, error = %worker_err, "worker stopped after fetch failure");
                return Err(fetch_err);
            }
            (Err(fetch_err), Ok(())) => return Err(fetch_err),
            (Ok(_), Err(worker_err)) => {
                return Err(worker_err).with_context(|| format!("process part {index}"));
            }
            (Ok(bytes), Ok(())) => bytes,
        };

        debug!(part = index, bytes = fetched, "part done");
        Ok(fetched)
    }
}
