//! Main entry point for the burst-download CLI application.
//!
//! Downloads a BURST archive from S3, any HTTP(S) URL or a local path and
//! extracts it, fetching parts concurrently.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;

use burst::cli::Source;
use burst::metrics::{ExtractionStats, Metrics, NoopMetrics, StatsSnapshot};
use burst::{BurstExtractor, Cli, FileEntry, HttpRangeReader, LocalFileReader, RangeFetch, logging};

/// Application entry point.
///
/// Parses command-line arguments, sets up logging and dispatches on the
/// archive source.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    let stats = Arc::new(ExtractionStats::default());
    let metrics: Arc<dyn Metrics> = if cli.stats {
        stats.clone()
    } else {
        Arc::new(NoopMetrics)
    };

    match cli.source()? {
        Source::File(path) => {
            let reader = Arc::new(LocalFileReader::new(&path)?.with_metrics(Arc::clone(&metrics)));
            process_archive(reader, &cli, metrics).await?;
        }
        Source::S3 { bucket, key } => {
            let reader = HttpRangeReader::for_s3(&bucket, &cli.region, &key, cli.endpoint.as_deref())?;
            process_remote(reader, &cli, metrics).await?;
        }
        Source::Url(url) => process_remote(HttpRangeReader::new(url)?, &cli, metrics).await?,
    }

    if cli.stats {
        print_stats(&stats.snapshot());
    }
    Ok(())
}

/// Process an HTTP source and report the bytes it transferred.
async fn process_remote(reader: HttpRangeReader, cli: &Cli, metrics: Arc<dyn Metrics>) -> Result<()> {
    let reader = Arc::new(reader.with_metrics(Arc::clone(&metrics)));
    process_archive(reader.clone(), cli, metrics).await?;

    // Display network transfer statistics for HTTP sources
    if !cli.quiet && !cli.list {
        eprintln!("Total bytes transferred: {}", format_size(reader.transferred_bytes()));
    }
    Ok(())
}

/// List or extract the archive behind `fetcher`.
async fn process_archive<F: RangeFetch + 'static>(
    fetcher: Arc<F>,
    cli: &Cli,
    metrics: Arc<dyn Metrics>,
) -> Result<()> {
    let extractor = BurstExtractor::new(fetcher).with_metrics(metrics);

    if cli.list {
        let entries = extractor.list_files().await?;
        list_files(&entries, cli.verbose > 0);
        return Ok(());
    }

    let options = cli.extract_options()?;
    let started = Instant::now();
    let summary = extractor.extract(&options).await?;

    if !cli.quiet {
        eprintln!(
            "Extracted {} entries from {} parts ({} from memory, {} skipped) in {:.2?}",
            summary.files,
            summary.parts_processed,
            summary.parts_from_memory,
            summary.parts_skipped,
            started.elapsed()
        );
    }
    Ok(())
}

/// List archive entries.
///
/// # Arguments
///
/// * `entries` - Central directory entries in archive order
/// * `verbose` - If true, display a table with sizes, ratio and timestamps
fn list_files(entries: &[FileEntry], verbose: bool) {
    if !verbose {
        for entry in entries {
            println!("{}", entry.file_name);
        }
        return;
    }

    println!(
        "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
        "Length", "Size", "Cmpr", "Date", "Time"
    );
    println!("{}", "-".repeat(70));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.file_name
        );

        if !entry.is_directory() {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(70));
    println!(
        "{:>10}  {:>10}  {}  {:>21}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );
}

/// Space saved as a percentage; negative when compression grew the data.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed == 0 {
        return "  0%".to_string();
    }
    let saved = 100 - (compressed as i128 * 100 / uncompressed as i128);
    format!("{saved:>4}%")
}

fn print_stats(snapshot: &StatsSnapshot) {
    eprintln!(
        "Fetch:     {} requests, {} in {:.2?}",
        snapshot.fetch_requests,
        format_size(snapshot.fetch_bytes),
        snapshot.fetch_time
    );
    eprintln!(
        "Encoded:   {} writes, {} in {:.2?}",
        snapshot.encoded_writes,
        format_size(snapshot.encoded_bytes),
        snapshot.encoded_time
    );
    eprintln!(
        "Unencoded: {} writes, {} in {:.2?}",
        snapshot.unencoded_writes,
        format_size(snapshot.unencoded_bytes),
        snapshot.unencoded_time
    );
    eprintln!("Files:     {} opened", snapshot.files_opened);
}

/// Format a byte size into a human-readable string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
