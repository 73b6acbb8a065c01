//! In-memory download queue shared by every source's workers.
//!
//! # Overview
//!
//! The queue is an ordered list of [`DownloadItem`]s. Order is the claim
//! priority: for each source, the first eligible entry wins. All mutation
//! happens under one short synchronous lock that is never held across an
//! `.await`, so callers on any task see a consistent view.
//!
//! Workers never hold references into the queue. They address their entry
//! through an [`EntryRef`] (key plus enqueue ticket) and every mutator is a
//! no-op once that entry has been removed or replaced.
//!
//! # Example
//!
//! ```ignore
//! use chapter_core::queue::{DownloadQueue, DownloadItem};
//!
//! let queue = DownloadQueue::new();
//! queue.enqueue_if_absent(DownloadItem::new(manga, chapter));
//!
//! if let Some(item) = queue.claim_next(source_id, 3) {
//!     // ... fetch pages ...
//!     queue.mark_finished(item.entry());
//! }
//! ```

mod item;

pub use item::{ChapterRecord, DownloadItem, DownloadKey, DownloadState, EntryRef, MangaRecord};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Where an entry sits relative to its source's active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    /// Among the first `window` non-errored entries of its source.
    Inside,
    /// Still queued but pushed out of the window by a reorder or a shrink.
    Outside,
    /// Removed from the queue.
    Gone,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: Vec<DownloadItem>,
    next_ticket: u64,
}

impl QueueInner {
    fn position(&self, entry: EntryRef) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.ticket == entry.ticket && item.key() == entry.key)
    }

    fn get_mut(&mut self, entry: EntryRef) -> Option<&mut DownloadItem> {
        self.position(entry).map(|index| &mut self.items[index])
    }
}

/// Ordered, lock-guarded collection of download items.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct DownloadQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl DownloadQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends the item unless an entry with the same key already exists.
    ///
    /// Returns true when the item was added. The stored entry gets a fresh
    /// ticket regardless of the one carried by `item`.
    pub fn enqueue_if_absent(&self, mut item: DownloadItem) -> bool {
        let mut inner = self.lock();
        let key = item.key();
        if inner.items.iter().any(|existing| existing.key() == key) {
            return false;
        }
        inner.next_ticket += 1;
        item.ticket = inner.next_ticket;
        debug!(manga_id = key.manga_id, chapter_index = key.chapter_index, "Enqueued chapter");
        inner.items.push(item);
        true
    }

    /// Removes every entry matching the predicate and returns how many went.
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&DownloadItem) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.retain(|item| !predicate(item));
        before - inner.items.len()
    }

    /// Removes one specific entry. Returns false if it was already gone.
    pub fn remove_entry(&self, entry: EntryRef) -> bool {
        let mut inner = self.lock();
        match inner.position(entry) {
            Some(index) => {
                inner.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Moves the entry with `key` to position `to`, clamped to the last slot.
    ///
    /// The relative order of every other entry is preserved. Returns false
    /// when no entry has that key.
    pub fn move_to(&self, key: DownloadKey, to: usize) -> bool {
        let mut inner = self.lock();
        let Some(from) = inner.items.iter().position(|item| item.key() == key) else {
            return false;
        };
        let item = inner.items.remove(from);
        let to = to.min(inner.items.len());
        inner.items.insert(to, item);
        true
    }

    /// Returns a copy of every entry in queue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DownloadItem> {
        self.lock().items.clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true when the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Returns true when an entry with `key` is queued.
    #[must_use]
    pub fn contains(&self, key: DownloadKey) -> bool {
        self.lock().items.iter().any(|item| item.key() == key)
    }

    /// Drops every entry and returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.items.len();
        inner.items.clear();
        removed
    }

    /// Claims the first eligible entry of `source_id` for a worker.
    ///
    /// The entry transitions to `Downloading` with progress reset inside the
    /// same critical section, so two workers can never claim the same entry.
    /// Returns a copy of the claimed entry.
    pub fn claim_next(&self, source_id: i64, max_tries: u32) -> Option<DownloadItem> {
        let mut inner = self.lock();
        let item = inner
            .items
            .iter_mut()
            .find(|item| item.source_id() == source_id && item.is_eligible(max_tries))?;
        item.state = DownloadState::Downloading;
        item.progress = 0.0;
        Some(item.clone())
    }

    /// Locates the entry relative to the first `window` non-errored entries of
    /// `source_id`.
    #[must_use]
    pub fn check_window(&self, entry: EntryRef, source_id: i64, window: usize) -> WindowCheck {
        let inner = self.lock();
        if inner.position(entry).is_none() {
            return WindowCheck::Gone;
        }
        let inside = inner
            .items
            .iter()
            .filter(|item| item.source_id() == source_id && item.state != DownloadState::Error)
            .take(window)
            .any(|item| item.ticket == entry.ticket);
        if inside {
            WindowCheck::Inside
        } else {
            WindowCheck::Outside
        }
    }

    /// Raises the entry's progress. Lower values are ignored.
    pub fn set_progress(&self, entry: EntryRef, progress: f32) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(entry) {
            Some(item) if progress > item.progress => {
                item.progress = progress.min(1.0);
                true
            }
            _ => false,
        }
    }

    /// Records the resolved page count on the entry's chapter.
    pub fn set_page_count(&self, entry: EntryRef, page_count: u32) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(entry) {
            Some(item) => {
                item.chapter.page_count = Some(page_count);
                true
            }
            None => false,
        }
    }

    /// Hands a `Downloading` entry back to the queue as `Queued`.
    pub fn revert_to_queued(&self, entry: EntryRef) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(entry) {
            Some(item) if item.state == DownloadState::Downloading => {
                item.state = DownloadState::Queued;
                true
            }
            _ => false,
        }
    }

    /// Marks the entry as failed and returns its new retry count.
    pub fn mark_failed(&self, entry: EntryRef, message: impl Into<String>) -> Option<u32> {
        let mut inner = self.lock();
        let item = inner.get_mut(entry)?;
        item.state = DownloadState::Error;
        item.tries += 1;
        item.last_error = Some(message.into());
        Some(item.tries)
    }

    /// Marks the entry as finished with full progress.
    pub fn mark_finished(&self, entry: EntryRef) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(entry) {
            Some(item) => {
                item.state = DownloadState::Finished;
                item.progress = 1.0;
                true
            }
            None => false,
        }
    }

    /// Distinct source ids with at least one eligible entry, in queue order.
    #[must_use]
    pub fn eligible_sources(&self, max_tries: u32) -> Vec<i64> {
        let inner = self.lock();
        let mut sources = Vec::new();
        for item in inner.items.iter().filter(|item| item.is_eligible(max_tries)) {
            if !sources.contains(&item.source_id()) {
                sources.push(item.source_id());
            }
        }
        sources
    }

    /// Number of entries currently in `state`.
    #[must_use]
    pub fn count_by_state(&self, state: DownloadState) -> usize {
        self.lock()
            .items
            .iter()
            .filter(|item| item.state == state)
            .count()
    }

    /// Returns true when any entry is in one of `states`.
    #[must_use]
    pub fn any_in_state(&self, states: &[DownloadState]) -> bool {
        self.lock()
            .items
            .iter()
            .any(|item| states.contains(&item.state))
    }
}
