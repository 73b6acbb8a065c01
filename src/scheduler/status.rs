//! Status snapshots and observer fan-out.
//!
//! Observers are modelled as bounded channels. A transport (websocket,
//! SSE, a CLI progress bar) registers one, forwards what it receives and
//! passes incoming commands to [`DownloadManager::handle_request`].
//!
//! [`DownloadManager::handle_request`]: super::DownloadManager::handle_request

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use super::signal::Signal;
use crate::queue::{DownloadItem, DownloadQueue, DownloadState};

/// Command an observer sends to get a fresh snapshot.
pub const STATUS_COMMAND: &str = "STATUS";

/// Reply to any command other than [`STATUS_COMMAND`].
pub const HELP_TEXT: &str = "Invalid command.\nSupported commands are:\n    - STATUS\n       sends the current download status\n";

/// Buffered messages per observer before snapshots start being dropped.
const OBSERVER_CAPACITY: usize = 16;

/// Coarse scheduler state shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagerState {
    /// No item is downloading.
    Stopped,
    /// At least one item is downloading.
    Started,
}

/// One queue entry as shown to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatus {
    /// Source the item is downloaded from.
    pub partition_key: i64,
    /// Owning manga.
    pub manga_id: i64,
    /// Chapter index within the manga.
    pub item_index: i64,
    /// Chapter id.
    pub chapter_id: i64,
    /// Current state.
    pub state: DownloadState,
    /// Failed attempts so far.
    pub tries: u32,
    /// Completed fraction.
    pub progress: f32,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

impl From<&DownloadItem> for ItemStatus {
    fn from(item: &DownloadItem) -> Self {
        Self {
            partition_key: item.source_id(),
            manga_id: item.manga.id,
            item_index: item.chapter.index,
            chapter_id: item.chapter.id,
            state: item.state,
            tries: item.tries,
            progress: item.progress,
            last_error: item.last_error.clone(),
        }
    }
}

/// Full snapshot sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    /// `Started` while anything is downloading.
    pub state: ManagerState,
    /// Queue entries in order.
    pub items: Vec<ItemStatus>,
    /// Items completed and removed since startup.
    pub finished_count: usize,
}

impl DownloadStatus {
    /// Captures the queue and finished counter.
    #[must_use]
    pub fn capture(queue: &DownloadQueue, finished_count: usize) -> Self {
        let items: Vec<ItemStatus> = queue.snapshot().iter().map(ItemStatus::from).collect();
        let state = if items
            .iter()
            .any(|item| item.state == DownloadState::Downloading)
        {
            ManagerState::Started
        } else {
            ManagerState::Stopped
        };
        Self {
            state,
            items,
            finished_count,
        }
    }

    /// Returns true while at least one item is downloading.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ManagerState::Started
    }
}

/// Message delivered to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMessage {
    /// Status snapshot.
    Status(DownloadStatus),
    /// Reply to an unknown command.
    Help(&'static str),
}

impl ObserverMessage {
    /// Renders the message as a transport frame: JSON for snapshots, plain
    /// text for help.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the snapshot cannot be encoded.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Status(status) => serde_json::to_string(status),
            Self::Help(text) => Ok((*text).to_string()),
        }
    }
}

/// Receiving side of an observer registration.
#[derive(Debug)]
pub struct Observer {
    /// Id to pass to `unsubscribe` and `handle_request`.
    pub id: u64,
    /// Messages for this observer.
    pub receiver: mpsc::Receiver<ObserverMessage>,
}

/// Registry of observers.
#[derive(Debug, Default)]
pub(crate) struct StatusHub {
    observers: DashMap<u64, mpsc::Sender<ObserverMessage>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl StatusHub {
    pub(crate) fn register(&self) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, receiver) = mpsc::channel(OBSERVER_CAPACITY);
        self.observers.insert(id, tx);
        info!(observer = id, "observer connected");
        Observer { id, receiver }
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let removed = self.observers.remove(&id).is_some();
        if removed {
            info!(observer = id, "observer disconnected");
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    /// Sends to one observer; false if it is unknown, gone or saturated.
    pub(crate) fn send_to(&self, id: u64, message: ObserverMessage) -> bool {
        let Some(tx) = self.observers.get(&id).map(|entry| entry.value().clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(observer = id, "observer saturated, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.remove(id);
                false
            }
        }
    }

    /// Sends the snapshot to every observer and tracks the running edge.
    pub(crate) fn broadcast(&self, status: &DownloadStatus) {
        let mut closed = Vec::new();
        for entry in &self.observers {
            match entry.value().try_send(ObserverMessage::Status(status.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(observer = *entry.key(), "observer saturated, snapshot dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.remove(id);
        }

        let running = status.is_running();
        let was_running = self.running.swap(running, Ordering::SeqCst);
        if running && !was_running {
            info!(items = status.items.len(), "download session started");
        }
    }
}

/// Pushes snapshots to the hub, either right away or through the throttle.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    queue: DownloadQueue,
    hub: Arc<StatusHub>,
    finished: Arc<AtomicUsize>,
    throttle: Signal,
}

impl Notifier {
    pub(crate) fn new(queue: DownloadQueue, hub: Arc<StatusHub>, throttle: Signal) -> Self {
        Self {
            queue,
            hub,
            finished: Arc::new(AtomicUsize::new(0)),
            throttle,
        }
    }

    /// Requests a broadcast; `immediate` bypasses the throttle.
    pub(crate) fn notify(&self, immediate: bool) {
        if immediate {
            self.flush();
        } else {
            self.throttle.raise();
        }
    }

    pub(crate) fn flush(&self) {
        self.hub.broadcast(&self.status());
    }

    pub(crate) fn status(&self) -> DownloadStatus {
        DownloadStatus::capture(&self.queue, self.finished_count())
    }

    pub(crate) fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn record_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn hub(&self) -> &StatusHub {
        &self.hub
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::{ChapterRecord, MangaRecord};

    fn queued(manga_id: i64, index: i64) -> DownloadItem {
        DownloadItem::new(
            MangaRecord {
                id: manga_id,
                source_id: 3,
                source_name: "Source".to_string(),
                title: "Title".to_string(),
            },
            ChapterRecord {
                id: manga_id * 10 + index,
                manga_id,
                index,
                name: "Chapter".to_string(),
                scanlator: None,
                original_chapter_id: None,
                page_count: None,
            },
        )
    }

    #[test]
    fn test_snapshot_json_shape() {
        let queue = DownloadQueue::new();
        queue.enqueue_if_absent(queued(7, 2));
        let status = DownloadStatus::capture(&queue, 4);

        let json: serde_json::Value =
            serde_json::from_str(&ObserverMessage::Status(status).to_text().unwrap()).unwrap();
        assert_eq!(json["state"], "Stopped");
        assert_eq!(json["finishedCount"], 4);
        let item = &json["items"][0];
        assert_eq!(item["partitionKey"], 3);
        assert_eq!(item["mangaId"], 7);
        assert_eq!(item["itemIndex"], 2);
        assert_eq!(item["chapterId"], 72);
        assert_eq!(item["state"], "Queued");
        assert_eq!(item["tries"], 0);
        assert!(item["lastError"].is_null());
    }

    #[test]
    fn test_state_started_only_while_downloading() {
        let queue = DownloadQueue::new();
        queue.enqueue_if_absent(queued(7, 1));
        assert!(!DownloadStatus::capture(&queue, 0).is_running());
        queue.claim_next(3, 3);
        assert!(DownloadStatus::capture(&queue, 0).is_running());
    }

    #[test]
    fn test_help_text_lists_status_command() {
        let text = ObserverMessage::Help(HELP_TEXT).to_text().unwrap();
        assert!(text.starts_with("Invalid command."));
        assert!(text.contains("STATUS"));
    }

    #[tokio::test]
    async fn test_broadcast_drops_closed_observers() {
        let hub = StatusHub::default();
        let mut alive = hub.register();
        let gone = hub.register();
        drop(gone.receiver);

        let status = DownloadStatus::capture(&DownloadQueue::new(), 0);
        hub.broadcast(&status);

        assert_eq!(hub.len(), 1);
        assert!(matches!(
            alive.receiver.recv().await.unwrap(),
            ObserverMessage::Status(_)
        ));
    }

    #[tokio::test]
    async fn test_saturated_observer_does_not_block_broadcast() {
        let hub = StatusHub::default();
        let observer = hub.register();
        let status = DownloadStatus::capture(&DownloadQueue::new(), 0);
        for _ in 0..(OBSERVER_CAPACITY * 2) {
            hub.broadcast(&status);
        }
        assert_eq!(hub.len(), 1);
        assert_eq!(observer.receiver.len(), OBSERVER_CAPACITY);
    }

    #[test]
    fn test_send_to_unknown_observer() {
        let hub = StatusHub::default();
        assert!(!hub.send_to(99, ObserverMessage::Help(HELP_TEXT)));
        assert!(!hub.remove(99));
    }
}
