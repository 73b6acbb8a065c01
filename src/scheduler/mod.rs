//! Download scheduler: per-source worker pools under one supervisor.
//!
//! # Overview
//!
//! [`DownloadManager`] owns the shared [`DownloadQueue`], one [`Downloader`]
//! per source it has ever activated, and two background loops:
//!
//! - the rebalancer, which activates sources with eligible items while
//!   fewer than `max_sources_in_parallel` sources have live workers;
//! - the notifier, which broadcasts status snapshots to observers at most
//!   once per `notify_interval`.
//!
//! Both loops are fed by coalescing signals, so a burst of requests costs
//! one pass. Dropping the manager (or calling [`DownloadManager::shutdown`])
//! cancels every worker and ends both loops.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use chapter_core::{DownloadManager, SchedulerConfig};
//!
//! let manager = DownloadManager::new(SchedulerConfig::new("data"), source, store)?;
//! let mut observer = manager.subscribe();
//! manager.enqueue(&[70, 71, 72]).await?;
//! while let Some(message) = observer.receiver.recv().await {
//!     println!("{}", message.to_text()?);
//! }
//! ```

mod downloader;
mod error;
mod signal;
mod status;

pub use downloader::Downloader;
pub use error::{DownloadError, SchedulerError};
pub use status::{
    DownloadStatus, HELP_TEXT, ItemStatus, ManagerState, Observer, ObserverMessage,
    STATUS_COMMAND,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::PageSource;
use crate::config::SchedulerConfig;
use crate::library::{self, DownloadedMangaInfo, LegacyManga, LibraryError};
use crate::queue::{ChapterRecord, DownloadItem, DownloadKey, DownloadQueue, DownloadState, MangaRecord};
use crate::storage::PageStore;
use crate::store::{ChapterStore, DownloadedManga};
use downloader::WorkerContext;
use signal::{Signal, run_throttled};
use status::{Notifier, StatusHub};

/// Summary for a background-task host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundResult {
    /// Not paused and something is queued or downloading.
    pub running: bool,
    /// Entries in the queue.
    pub total_count: usize,
    /// Items finished since startup.
    pub finish_count: usize,
    /// Entries currently in `Error`.
    pub failed_count: usize,
}

struct Shared {
    ctx: Arc<WorkerContext>,
    hub: Arc<StatusHub>,
    downloaders: DashMap<i64, Arc<Downloader>>,
    parallelism: AtomicUsize,
    paused: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

impl Shared {
    fn downloader(&self, source_id: i64) -> Arc<Downloader> {
        Arc::clone(
            &self
                .downloaders
                .entry(source_id)
                .or_insert_with(|| Arc::new(Downloader::new(source_id, Arc::clone(&self.ctx)))),
        )
    }

    fn active_downloaders(&self) -> Vec<Arc<Downloader>> {
        self.downloaders
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn all_downloaders(&self) -> Vec<Arc<Downloader>> {
        self.downloaders
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Activates sources with eligible items up to the source ceiling.
    fn rebalance(&self) {
        if self.paused.load(Ordering::SeqCst) {
            debug!("paused, rebalance skipped");
            return;
        }
        let active: Vec<i64> = self
            .active_downloaders()
            .iter()
            .map(|downloader| downloader.source_id())
            .collect();
        let capacity = self.ctx.config.max_sources_in_parallel;

        if active.len() < capacity {
            let parallelism = self.parallelism.load(Ordering::SeqCst);
            let candidates: Vec<i64> = self
                .ctx
                .queue
                .eligible_sources(self.ctx.config.max_tries)
                .into_iter()
                .filter(|source_id| !active.contains(source_id))
                .take(capacity - active.len())
                .collect();
            for source_id in candidates {
                info!(source_id, parallelism, "activating source");
                self.downloader(source_id).start(parallelism);
            }
        } else {
            debug!(active = active.len(), "source ceiling reached");
        }
        self.ctx.notifier.notify(false);
    }
}

/// Supervisor of the download queue and every source's worker pool.
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("queued", &self.shared.ctx.queue.len())
            .field("parallelism", &self.parallelism())
            .field("paused", &self.shared.paused.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager and spawns its background loops.
    ///
    /// Must be called from within a tokio runtime. The manager starts
    /// unpaused with an empty queue.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if `config` is invalid.
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn PageSource>,
        store: Arc<dyn ChapterStore>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let queue = DownloadQueue::new();
        let hub = Arc::new(StatusHub::default());
        let shutdown = CancellationToken::new();
        let (notify_signal, notify_rx) = Signal::channel();
        let (rebalance_signal, rebalance_rx) = Signal::channel();
        let notifier = Notifier::new(queue.clone(), Arc::clone(&hub), notify_signal);
        let pages = Arc::new(PageStore::new(
            config.downloads_root.clone(),
            config.legacy_root.clone(),
        ));
        let rebalance_interval = config.rebalance_interval;
        let notify_interval = config.notify_interval;
        let parallelism = config.parallelism;

        let ctx = Arc::new(WorkerContext {
            config,
            queue,
            pages,
            source,
            store,
            notifier: notifier.clone(),
            rebalance: rebalance_signal,
            shutdown: shutdown.clone(),
        });
        let shared = Arc::new(Shared {
            ctx,
            hub,
            downloaders: DashMap::new(),
            parallelism: AtomicUsize::new(parallelism),
            paused: AtomicBool::new(false),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        tokio::spawn(run_throttled(
            rebalance_rx,
            rebalance_interval,
            shutdown.clone(),
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.rebalance();
                }
            },
        ));
        tokio::spawn(run_throttled(notify_rx, notify_interval, shutdown, move || {
            notifier.flush();
        }));

        info!(parallelism, "download manager ready");
        Ok(Self { shared })
    }

    fn ctx(&self) -> &WorkerContext {
        &self.shared.ctx
    }

    /// The shared queue.
    #[must_use]
    pub fn queue(&self) -> &DownloadQueue {
        &self.ctx().queue
    }

    /// The page store workers write into.
    #[must_use]
    pub fn pages(&self) -> &PageStore {
        &self.ctx().pages
    }

    /// The scheduler configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.ctx().config
    }

    // ==================== Queue control ====================

    /// Adds the given chapters to the end of the queue.
    ///
    /// Ids the store does not know are skipped, as are chapters already in
    /// the queue. If anything was added the scheduler is started and
    /// observers get a snapshot right away. Returns the number added.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the chapters cannot be loaded.
    #[instrument(skip(self, chapter_ids), fields(requested = chapter_ids.len()))]
    pub async fn enqueue(&self, chapter_ids: &[i64]) -> Result<usize, SchedulerError> {
        if chapter_ids.is_empty() {
            return Ok(0);
        }
        let targets = self.ctx().store.load_download_targets(chapter_ids).await?;
        Ok(self.enqueue_records(targets))
    }

    /// Adds already loaded records; see [`enqueue`](Self::enqueue).
    pub fn enqueue_records<I>(&self, targets: I) -> usize
    where
        I: IntoIterator<Item = (MangaRecord, ChapterRecord)>,
    {
        let mut added = 0;
        for (manga, chapter) in targets {
            let (manga_id, chapter_id) = (manga.id, chapter.id);
            if self
                .queue()
                .enqueue_if_absent(DownloadItem::new(manga, chapter))
            {
                added += 1;
            } else {
                debug!(manga_id, chapter_id, "chapter already queued");
            }
        }
        if added > 0 {
            info!(added, queued = self.queue().len(), "chapters queued");
            self.start();
            self.ctx().notifier.notify(true);
        }
        added
    }

    /// Enqueues the chapter at `chapter_index` of a manga.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ChapterNotFound`] if the manga has no such
    /// chapter and [`SchedulerError::Store`] if the lookup fails.
    pub async fn enqueue_with_chapter_index(
        &self,
        manga_id: i64,
        chapter_index: i64,
    ) -> Result<usize, SchedulerError> {
        let chapter_id = self
            .ctx()
            .store
            .find_chapter_id(manga_id, chapter_index)
            .await?
            .ok_or(SchedulerError::ChapterNotFound {
                manga_id,
                chapter_index,
            })?;
        self.enqueue(&[chapter_id]).await
    }

    /// Removes the given chapters whatever their state.
    ///
    /// A worker downloading a removed chapter notices at its next
    /// checkpoint and moves on. Returns the number removed.
    pub fn unqueue(&self, chapter_ids: &[i64]) -> usize {
        if chapter_ids.is_empty() {
            return 0;
        }
        let removed = self
            .queue()
            .remove_where(|item| chapter_ids.contains(&item.chapter.id));
        info!(removed, "chapters unqueued");
        self.ctx().notifier.notify(true);
        removed
    }

    /// Removes the chapter at `chapter_index` of a manga.
    pub fn unqueue_chapter(&self, manga_id: i64, chapter_index: i64) -> bool {
        let key = DownloadKey::new(manga_id, chapter_index);
        let removed = self.queue().remove_where(|item| item.key() == key) > 0;
        self.ctx().notifier.notify(true);
        removed
    }

    /// Moves an entry to position `to`, clamped to the queue length.
    ///
    /// Returns false if the entry is not queued. Moving a downloading entry
    /// out of its source's window pre-empts it.
    pub fn reorder(&self, manga_id: i64, chapter_index: i64, to: usize) -> bool {
        let moved = self
            .queue()
            .move_to(DownloadKey::new(manga_id, chapter_index), to);
        if moved {
            debug!(manga_id, chapter_index, to, "entry reordered");
            self.ctx().notifier.notify(false);
        }
        moved
    }

    // ==================== Run control ====================

    /// Clears the paused flag and requests a rebalance pass.
    pub fn start(&self) {
        info!("download scheduler starting");
        self.shared.paused.store(false, Ordering::SeqCst);
        self.ctx().rebalance.raise();
    }

    /// Stops every worker and waits for them to exit.
    ///
    /// In-flight entries go back to `Queued`. The scheduler stays paused
    /// until [`start`](Self::start) or a successful enqueue.
    pub async fn stop(&self) {
        info!("download scheduler stopping");
        self.shared.paused.store(true, Ordering::SeqCst);
        let downloaders = self.shared.all_downloaders();
        futures_util::future::join_all(downloaders.iter().map(|downloader| downloader.stop()))
            .await;
        self.ctx().notifier.notify(false);
    }

    /// Stops every worker, then empties the queue.
    pub async fn clear(&self) {
        self.stop().await;
        let removed = self.queue().clear();
        info!(removed, "queue cleared");
        self.ctx().notifier.notify(true);
    }

    /// Changes the per-source worker count.
    ///
    /// Accepted values are `1..=max_tasks_in_parallel`. Active sources are
    /// resized at once unless the scheduler is paused; shrinking pre-empts
    /// the newest workers. Returns
    /// false if the value is invalid or unchanged.
    pub fn set_parallelism(&self, parallelism: usize) -> bool {
        let max = self.config().max_tasks_in_parallel;
        if parallelism == 0 || parallelism > max {
            warn!(parallelism, max, "parallelism out of range, ignored");
            return false;
        }
        let previous = self.shared.parallelism.swap(parallelism, Ordering::SeqCst);
        if previous == parallelism {
            return false;
        }
        info!(previous, parallelism, "parallelism changed");
        if self.is_paused() {
            // Applied by the next rebalance after `start`.
            return true;
        }
        for downloader in self.shared.active_downloaders() {
            downloader.start(parallelism);
        }
        true
    }

    /// Current per-source worker count.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.shared.parallelism.load(Ordering::SeqCst)
    }

    /// True after [`stop`](Self::stop) until the next start.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Sources with at least one live worker.
    #[must_use]
    pub fn active_sources(&self) -> Vec<i64> {
        let mut sources: Vec<i64> = self
            .shared
            .active_downloaders()
            .iter()
            .map(|downloader| downloader.source_id())
            .collect();
        sources.sort_unstable();
        sources
    }

    /// Live workers of one source.
    #[must_use]
    pub fn live_workers(&self, source_id: i64) -> usize {
        self.shared
            .downloaders
            .get(&source_id)
            .map_or(0, |downloader| downloader.live_workers())
    }

    /// Stops every worker and ends the background loops.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.ctx().notifier.flush();
        self.ctx().shutdown.cancel();
        info!("download manager shut down");
    }

    // ==================== Status ====================

    /// Point-in-time snapshot of the queue.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.ctx().notifier.status()
    }

    /// `(done, total)`: finished items plus queued entries that are
    /// `Finished` or `Error`, against queue length plus finished items.
    #[must_use]
    pub fn queue_counts(&self) -> (usize, usize) {
        let finished = self.ctx().notifier.finished_count();
        let queue = self.queue();
        let done = queue.count_by_state(DownloadState::Finished)
            + queue.count_by_state(DownloadState::Error)
            + finished;
        (done, queue.len() + finished)
    }

    /// Summary for a background-task host.
    #[must_use]
    pub fn background_result(&self) -> BackgroundResult {
        let queue = self.queue();
        BackgroundResult {
            running: !self.is_paused()
                && queue.any_in_state(&[DownloadState::Downloading, DownloadState::Queued]),
            total_count: queue.len(),
            finish_count: self.ctx().notifier.finished_count(),
            failed_count: queue.count_by_state(DownloadState::Error),
        }
    }

    /// Registers an observer; it receives a snapshot right away.
    #[must_use]
    pub fn subscribe(&self) -> Observer {
        let observer = self.shared.hub.register();
        self.shared
            .hub
            .send_to(observer.id, ObserverMessage::Status(self.status()));
        observer
    }

    /// Drops an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.hub.remove(id)
    }

    /// Answers a command from an observer: [`STATUS_COMMAND`] gets a
    /// snapshot, anything else the help text.
    ///
    /// Returns false if the observer is unknown or its buffer is full.
    pub fn handle_request(&self, id: u64, command: &str) -> bool {
        let reply = if command == STATUS_COMMAND {
            ObserverMessage::Status(self.status())
        } else {
            ObserverMessage::Help(HELP_TEXT)
        };
        self.shared.hub.send_to(id, reply)
    }

    /// Registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.ctx().notifier.hub().len()
    }

    // ==================== Library ====================

    /// Deletes the stored pages of each manga and clears their downloaded
    /// flags. Returns the number of chapters reset.
    ///
    /// # Errors
    ///
    /// See [`library::remove_downloads`].
    pub async fn remove_downloads(&self, manga_ids: &[i64]) -> Result<u64, LibraryError> {
        library::remove_downloads(self.ctx().store.as_ref(), self.pages(), manga_ids).await
    }

    /// Deletes manga folders in the legacy layout.
    pub async fn remove_legacy_downloads(&self, manga: &[LegacyManga]) -> usize {
        library::remove_legacy_downloads(self.pages(), manga).await
    }

    /// Manga with a recorded download, most recent first.
    ///
    /// # Errors
    ///
    /// See [`library::downloaded_manga`].
    pub async fn downloaded_manga(&self) -> Result<Vec<DownloadedManga>, LibraryError> {
        library::downloaded_manga(self.ctx().store.as_ref()).await
    }

    /// Manga with pages on disk in the current layout.
    ///
    /// # Errors
    ///
    /// See [`library::downloaded_manga_info`].
    pub async fn downloaded_manga_info(&self) -> Result<DownloadedMangaInfo, LibraryError> {
        library::downloaded_manga_info(self.ctx().store.as_ref(), self.pages()).await
    }
}
