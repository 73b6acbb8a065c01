//! Per-source worker pool.
//!
//! A [`Downloader`] owns the worker tasks of one source. Each worker claims
//! the first eligible queue entry of its source, downloads it page by page
//! and loops until nothing is left to claim. Between steps the worker passes
//! a checkpoint that notices cancellation, pre-emption (the entry fell out
//! of the source's active window) and removal.
//!
//! # Worker states
//!
//! ```text
//! Queued ──claim──▶ Downloading ──all pages──▶ Finished ──debounce──▶ removed
//!   ▲                 │    │
//!   └──pre-empt/stop──┘    └──failure──▶ Error (tries + 1) ──claim if tries < max──▶ Downloading
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::error::DownloadError;
use super::signal::Signal;
use super::status::Notifier;
use crate::catalog::{CatalogError, PageDescriptor, PageSource};
use crate::config::SchedulerConfig;
use crate::queue::{DownloadItem, DownloadQueue, EntryRef, WindowCheck};
use crate::storage::{ChapterLocation, PageStore, StorageError};
use crate::store::{ChapterStore, StoreError};

/// Everything a worker needs, shared by every downloader of a manager.
pub(crate) struct WorkerContext {
    pub(crate) config: SchedulerConfig,
    pub(crate) queue: DownloadQueue,
    pub(crate) pages: Arc<PageStore>,
    pub(crate) source: Arc<dyn PageSource>,
    pub(crate) store: Arc<dyn ChapterStore>,
    pub(crate) notifier: Notifier,
    pub(crate) rebalance: Signal,
    pub(crate) shutdown: CancellationToken,
}

/// Why a download attempt stopped before finishing.
#[derive(Debug)]
enum Halt {
    /// The worker was cancelled; hand the entry back and exit.
    Cancelled,
    /// The entry left the active window; hand it back and claim again.
    Paused,
    /// The entry was removed from the queue.
    Removed,
    /// The attempt failed.
    Failed(DownloadError),
}

impl From<DownloadError> for Halt {
    fn from(err: DownloadError) -> Self {
        Self::Failed(err)
    }
}

impl From<CatalogError> for Halt {
    fn from(err: CatalogError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<StorageError> for Halt {
    fn from(err: StorageError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Drained,
    Cancelled,
}

#[derive(Debug)]
struct WorkerHandle {
    id: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Workers {
    /// Workers counted in the active window, oldest first.
    registered: Vec<WorkerHandle>,
    /// Cancelled workers that have not exited yet.
    retiring: Vec<WorkerHandle>,
}

#[derive(Debug, Default)]
struct PoolState {
    workers: Mutex<Workers>,
    live: AtomicUsize,
    window: AtomicUsize,
    next_id: AtomicU64,
}

impl PoolState {
    fn lock(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: u64) {
        {
            let mut workers = self.lock();
            workers.registered.retain(|handle| handle.id != id);
            workers.retiring.retain(|handle| handle.id != id);
            self.window.store(workers.registered.len(), Ordering::SeqCst);
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs exit bookkeeping even if the worker future is dropped.
struct ExitGuard {
    pool: Arc<PoolState>,
    rebalance: Signal,
    id: u64,
    cancelled: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.pool.release(self.id);
        if !self.cancelled {
            self.rebalance.raise();
        }
    }
}

/// Worker pool of one source.
pub struct Downloader {
    source_id: i64,
    ctx: Arc<WorkerContext>,
    pool: Arc<PoolState>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("source_id", &self.source_id)
            .field("live", &self.live_workers())
            .field("window", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub(crate) fn new(source_id: i64, ctx: Arc<WorkerContext>) -> Self {
        Self {
            source_id,
            ctx,
            pool: Arc::new(PoolState::default()),
        }
    }

    /// Source this pool downloads from.
    #[must_use]
    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    /// True while any worker, including a cancelled one, has not exited.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.live_workers() > 0
    }

    /// Workers counted in the active window.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.window.load(Ordering::SeqCst)
    }

    /// Workers that have not exited yet.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.pool.live.load(Ordering::SeqCst)
    }

    /// Resizes the pool to `limit` workers.
    ///
    /// Growing spawns new workers; shrinking cancels the newest ones, which
    /// hand their entries back to the queue at their next checkpoint.
    pub(crate) fn start(&self, limit: usize) {
        {
            let mut workers = self.pool.lock();
            let registered = workers.registered.len();
            self.pool.window.store(limit, Ordering::SeqCst);
            if limit > registered {
                for _ in registered..limit {
                    let handle = self.spawn_worker();
                    workers.registered.push(handle);
                }
            } else if limit < registered {
                let retired = workers.registered.split_off(limit);
                for handle in &retired {
                    handle.cancel.cancel();
                }
                workers.retiring.extend(retired);
            }
        }
        info!(source_id = self.source_id, limit, "downloader resized");
        self.ctx.notifier.notify(false);
    }

    /// Cancels every worker and waits for all of them to exit.
    pub(crate) async fn stop(&self) {
        let handles = {
            let mut workers = self.pool.lock();
            self.pool.window.store(0, Ordering::SeqCst);
            let mut all = std::mem::take(&mut workers.registered);
            all.append(&mut workers.retiring);
            all
        };
        if handles.is_empty() {
            return;
        }

        info!(source_id = self.source_id, workers = handles.len(), "stopping downloader");
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.join.await {
                warn!(source_id = self.source_id, worker = handle.id, error = %e, "worker task failed");
            }
        }
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.pool.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.ctx.shutdown.child_token();
        self.pool.live.fetch_add(1, Ordering::SeqCst);

        let worker = Worker {
            ctx: Arc::clone(&self.ctx),
            pool: Arc::clone(&self.pool),
            source_id: self.source_id,
            cancel: cancel.clone(),
        };
        let guard = ExitGuard {
            pool: Arc::clone(&self.pool),
            rebalance: self.ctx.rebalance.clone(),
            id,
            cancelled: false,
        };
        let span = info_span!("worker", source_id = self.source_id, worker = id);
        let join = tokio::spawn(
            async move {
                // Bind the whole guard; a field-only capture drops it under the pool lock.
                let mut guard = guard;
                let exit = worker.run().await;
                guard.cancelled = exit == WorkerExit::Cancelled;
            }
            .instrument(span),
        );

        WorkerHandle { id, cancel, join }
    }
}

/// Throttles in-page progress to changed percentages at a minimum spacing.
#[derive(Debug)]
struct ProgressSampler {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u64>,
}

impl ProgressSampler {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    fn should_emit(&mut self, percent: u64) -> bool {
        if self.last_percent == Some(percent) {
            return false;
        }
        let now = Instant::now();
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.interval
        {
            return false;
        }
        self.last_emit = Some(now);
        self.last_percent = Some(percent);
        true
    }
}

#[allow(clippy::cast_precision_loss)]
fn page_progress(position: usize, percent: u64, page_count: usize) -> f32 {
    (position as f32 + percent as f32 / 100.0) / page_count as f32
}

struct Worker {
    ctx: Arc<WorkerContext>,
    pool: Arc<PoolState>,
    source_id: i64,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self) -> WorkerExit {
        debug!("worker started");
        loop {
            if self.cancel.is_cancelled() {
                return WorkerExit::Cancelled;
            }
            if self.ctx.queue.is_empty() {
                break;
            }
            let Some(item) = self
                .ctx
                .queue
                .claim_next(self.source_id, self.ctx.config.max_tries)
            else {
                break;
            };
            let entry = item.entry();
            info!(
                manga_id = item.manga.id,
                chapter_index = item.chapter.index,
                tries = item.tries,
                "download started"
            );

            let attempt = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(Halt::Cancelled),
                result = self.download(&item) => result,
            };
            let outcome = match attempt {
                Ok(page_count) => self.finish(&item, page_count).await,
                Err(halt) => Err(halt),
            };

            match outcome {
                Ok(()) => {}
                Err(Halt::Cancelled) => {
                    self.ctx.queue.revert_to_queued(entry);
                    self.ctx.notifier.notify(false);
                    debug!(chapter_index = item.chapter.index, "worker cancelled");
                    return WorkerExit::Cancelled;
                }
                Err(Halt::Paused) => {
                    self.ctx.queue.revert_to_queued(entry);
                    self.ctx.notifier.notify(false);
                    debug!(
                        manga_id = item.manga.id,
                        chapter_index = item.chapter.index,
                        "download pre-empted"
                    );
                    self.pause_backoff().await;
                }
                Err(Halt::Removed) => {
                    self.ctx.notifier.notify(false);
                    debug!(
                        manga_id = item.manga.id,
                        chapter_index = item.chapter.index,
                        "entry removed while downloading"
                    );
                }
                Err(Halt::Failed(error)) => {
                    let tries = self.ctx.queue.mark_failed(entry, error.to_string());
                    self.ctx.notifier.notify(true);
                    warn!(
                        manga_id = item.manga.id,
                        chapter_index = item.chapter.index,
                        tries,
                        error = %error,
                        "download failed"
                    );
                }
            }
        }
        debug!("nothing left to claim, worker exiting");
        WorkerExit::Drained
    }

    /// Notifies, then halts on cancellation, pre-emption or removal.
    fn checkpoint(&self, entry: EntryRef, immediate: bool) -> Result<(), Halt> {
        self.ctx.notifier.notify(immediate);
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let window = self.pool.window.load(Ordering::SeqCst);
        match self.ctx.queue.check_window(entry, self.source_id, window) {
            WindowCheck::Inside => Ok(()),
            WindowCheck::Outside => Err(Halt::Paused),
            WindowCheck::Gone => Err(Halt::Removed),
        }
    }

    /// Downloads every missing page; returns the page count.
    async fn download(&self, item: &DownloadItem) -> Result<u32, Halt> {
        let entry = item.entry();
        self.checkpoint(entry, true)?;

        let pages = self
            .ctx
            .source
            .resolve_pages(&item.manga, &item.chapter)
            .await?;
        if pages.is_empty() {
            return Err(CatalogError::EmptyChapter {
                chapter_id: item.chapter.id,
            }
            .into());
        }
        let page_count = u32::try_from(pages.len()).unwrap_or(u32::MAX);
        self.ctx.queue.set_page_count(entry, page_count);
        self.checkpoint(entry, false)?;

        let location = ChapterLocation::for_chapter(&item.manga, &item.chapter);
        for (position, page) in pages.iter().enumerate() {
            if self.ctx.pages.has_page(&location, page.index).await? {
                debug!(page = page.index, "page already stored");
            } else {
                self.fetch_page(entry, &location, page, position, pages.len())
                    .await?;
            }
            self.ctx
                .queue
                .set_progress(entry, page_progress(position + 1, 0, pages.len()));
            self.checkpoint(entry, false)?;
        }
        Ok(page_count)
    }

    async fn fetch_page(
        &self,
        entry: EntryRef,
        location: &ChapterLocation,
        page: &PageDescriptor,
        position: usize,
        page_count: usize,
    ) -> Result<(), Halt> {
        let mut body = self.ctx.source.fetch_page(page).await?;
        let mut writer = self.ctx.pages.begin_page(location, page.index).await?;
        let mut sampler = ProgressSampler::new(self.ctx.config.progress_sample);

        while let Some(chunk) = body.stream.next().await {
            writer.write_chunk(&chunk?).await?;
            if let Some(total) = body.content_length.filter(|total| *total > 0) {
                let percent = writer.written().min(total) * 100 / total;
                if sampler.should_emit(percent)
                    && self.ctx.queue.set_progress(
                        entry,
                        page_progress(position, percent, page_count),
                    )
                {
                    self.ctx.notifier.notify(false);
                }
            }
        }

        writer.commit().await?;
        Ok(())
    }

    /// Records the chapter, shows it as finished, then drops it from the queue.
    ///
    /// Runs to completion even when cancelled so a finished entry never lingers.
    async fn finish(&self, item: &DownloadItem, page_count: u32) -> Result<(), Halt> {
        let entry = item.entry();
        self.ctx
            .store
            .mark_downloaded(item.chapter.id, page_count)
            .await?;
        if !self.ctx.queue.mark_finished(entry) {
            return Err(Halt::Removed);
        }
        info!(
            manga_id = item.manga.id,
            chapter_index = item.chapter.index,
            pages = page_count,
            "chapter downloaded"
        );
        self.ctx.notifier.notify(true);

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(self.ctx.config.finish_debounce) => {}
        }

        self.ctx.queue.remove_entry(entry);
        self.ctx.notifier.record_finished();
        self.ctx.notifier.notify(false);
        Ok(())
    }

    /// Gives a pre-empting worker of the same source time to claim before
    /// this one looks for work again.
    async fn pause_backoff(&self) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(self.ctx.config.progress_sample) => {}
        }
    }
}
