//! CLI entry point for the chapter downloader.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chapter_core::{
    ChapterStore, Database, DownloadManager, DownloadState, HttpPageSource, Manifest,
    SchedulerConfig, SqliteChapterStore,
};
use clap::Parser;
use tracing::{debug, info, warn};

mod app;
mod cli;

use app::progress_manager::spawn_progress_ui;
use cli::Args;

/// Database file name under the data directory.
const DATABASE_FILE: &str = "chapters.db";

/// How often the run checks whether the queue has settled.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");
    info!("Chapter downloader starting");

    let Some(manifest_path) = args.manifest.as_deref() else {
        info!("No manifest provided.");
        info!("Example: chapter-downloader library.json");
        return Ok(());
    };

    let manifest = Manifest::load(manifest_path).await?;
    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("cannot create data directory {}", args.data_dir.display()))?;

    let db = Database::new(&args.data_dir.join(DATABASE_FILE)).await?;
    let store = Arc::new(SqliteChapterStore::new(db));
    store.import_manifest(&manifest).await?;

    let mut chapter_ids = Vec::new();
    for chapter_id in manifest.chapter_ids() {
        if args.force || !store.is_downloaded(chapter_id).await? {
            chapter_ids.push(chapter_id);
        } else {
            debug!(chapter_id, "already downloaded, skipped");
        }
    }
    if chapter_ids.is_empty() {
        info!("Nothing to download");
        return Ok(());
    }

    let config = SchedulerConfig {
        parallelism: usize::from(args.parallelism),
        max_sources_in_parallel: usize::from(args.sources),
        max_tries: u32::from(args.max_tries),
        ..SchedulerConfig::new(&args.data_dir)
    };
    let max_tries = config.max_tries;
    let source = Arc::new(HttpPageSource::from_manifest(&manifest)?);
    let manager = DownloadManager::new(config, source, store)?;

    let use_bar = !args.quiet && io::stderr().is_terminal();
    let (progress_handle, progress_stop) = spawn_progress_ui(use_bar, manager.subscribe());

    let queued = manager.enqueue(&chapter_ids).await?;
    info!(queued, "Chapters queued");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, stopping downloads");
                break;
            }
            () = tokio::time::sleep(SETTLE_POLL_INTERVAL) => {
                let queue = manager.queue();
                if queue.eligible_sources(max_tries).is_empty()
                    && !queue.any_in_state(&[DownloadState::Downloading])
                {
                    break;
                }
            }
        }
    }

    manager.shutdown().await;

    if let Some(stop) = progress_stop {
        let _ = stop.send(());
    }
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let status = manager.status();
    let failed: Vec<_> = status
        .items
        .iter()
        .filter(|item| item.state == DownloadState::Error)
        .collect();
    for item in &failed {
        warn!(
            manga_id = item.manga_id,
            chapter_index = item.item_index,
            tries = item.tries,
            error = item.last_error.as_deref().unwrap_or("unknown"),
            "Chapter not downloaded"
        );
    }
    let remaining = status.items.len() - failed.len();
    info!(
        downloaded = status.finished_count,
        failed = failed.len(),
        remaining,
        "Download complete"
    );

    if !failed.is_empty() {
        bail!("{} chapter(s) failed to download", failed.len());
    }
    Ok(())
}
