//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use chapter_core::config::{DEFAULT_PARALLELISM, MAX_SOURCES_IN_PARALLEL, MAX_TASK_IN_PARALLEL, MAX_TRIES};

/// Download manga chapters listed in a manifest.
///
/// Chapters are downloaded in the background, one worker pool per source,
/// into `<data-dir>/downloads2`. Chapters already recorded as downloaded
/// are skipped unless `--force` is given.
#[derive(Parser, Debug)]
#[command(name = "chapter-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Chapter manifest (JSON) to import and download
    pub manifest: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Directory holding the database and downloaded pages
    #[arg(short = 'd', long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Workers per source (1-5)
    #[arg(short = 'p', long, default_value_t = DEFAULT_PARALLELISM as u8, value_parser = clap::value_parser!(u8).range(1..=MAX_TASK_IN_PARALLEL as i64))]
    pub parallelism: u8,

    /// Sources downloaded from at the same time (1-16)
    #[arg(short = 's', long, default_value_t = MAX_SOURCES_IN_PARALLEL as u8, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub sources: u8,

    /// Failed attempts before a chapter is given up on (1-10)
    #[arg(short = 'r', long, default_value_t = MAX_TRIES as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_tries: u8,

    /// Download chapters even if already recorded as downloaded
    #[arg(long)]
    pub force: bool,
}
