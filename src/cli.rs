use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, ArgGroup, Parser};

use crate::zip::ExtractOptions;

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "burst-download")]
#[command(version)]
#[command(about = "Download and extract BURST archives with parallel range requests", long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["key", "url", "file"])))]
#[command(after_help = "Examples:\n  \
  burst-download -b my-bucket -k data/archive.zip -o ./out      extract from S3\n  \
  burst-download --url https://example.com/a.zip -o ./out -c 32  32 parts at a time\n  \
  burst-download --file archive.zip -l -v                        list entries verbosely")]
pub struct Cli {
    /// S3 bucket name
    #[arg(short = 'b', long, requires = "key")]
    pub bucket: Option<String>,

    /// S3 object key
    #[arg(short = 'k', long, requires = "bucket")]
    pub key: Option<String>,

    /// S3 region
    #[arg(short = 'r', long, default_value = "us-east-1")]
    pub region: String,

    /// Custom S3 endpoint (path-style requests)
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Archive HTTP(S) URL
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Local archive path
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Extract files into this directory
    #[arg(short = 'o', long, value_name = "DIR", required_unless_present = "list")]
    pub output_dir: Option<PathBuf>,

    /// Parts downloaded concurrently
    #[arg(short = 'c', long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..=128))]
    pub concurrency: u16,

    /// Download part size in MiB (8-64, multiple of 8)
    #[arg(short = 's', long, value_name = "MIB", default_value_t = 8, value_parser = parse_part_size)]
    pub part_size: u64,

    /// Print fetch and write statistics at the end
    #[arg(long)]
    pub stats: bool,

    /// List entries instead of extracting
    #[arg(short = 'l', long)]
    pub list: bool,

    /// More logging (-vv => trace); with -l, a detailed table
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Where the archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    S3 { bucket: String, key: String },
    Url(String),
    File(PathBuf),
}

impl Cli {
    pub fn source(&self) -> Result<Source> {
        if let Some(path) = &self.file {
            return Ok(Source::File(path.clone()));
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("--url must be an http:// or https:// URL");
            }
            return Ok(Source::Url(url.clone()));
        }
        match (&self.bucket, &self.key) {
            (Some(bucket), Some(key)) => Ok(Source::S3 {
                bucket: bucket.clone(),
                key: key.clone(),
            }),
            _ => bail!("one of --bucket/--key, --url or --file is required"),
        }
    }

    pub fn extract_options(&self) -> Result<ExtractOptions> {
        let Some(output_dir) = &self.output_dir else {
            bail!("--output-dir is required");
        };
        let options = ExtractOptions {
            output_dir: output_dir.clone(),
            part_size: self.part_size * MIB,
            concurrency: self.concurrency as usize,
        };
        options.validate()?;
        Ok(options)
    }
}

fn parse_part_size(value: &str) -> Result<u64, String> {
    let mib: u64 = value.parse().map_err(|_| format!("{value} is not a number"))?;
    if !(8..=64).contains(&mib) || mib % 8 != 0 {
        return Err(format!("{mib} MiB: part size must be 8-64 MiB and a multiple of 8"));
    }
    Ok(mib)
}
