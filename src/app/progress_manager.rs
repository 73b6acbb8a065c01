//! Progress UI (bar) for download runs, fed by scheduler status snapshots.

use std::time::Duration;

use chapter_core::{DownloadState, DownloadStatus, Observer, ObserverMessage};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::oneshot;

/// Spawns the progress bar when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_bar` is false, returns (None, None) and the observer is dropped.
pub(crate) fn spawn_progress_ui(
    use_bar: bool,
    observer: Observer,
) -> (Option<tokio::task::JoinHandle<()>>, Option<oneshot::Sender<()>>) {
    if !use_bar {
        return (None, None);
    }
    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = spawn_bar_inner(observer, stop_rx);
    (Some(handle), Some(stop_tx))
}

/// `(done, total)` as shown by the bar.
pub(crate) fn bar_counts(status: &DownloadStatus) -> (u64, u64) {
    let settled = status
        .items
        .iter()
        .filter(|item| matches!(item.state, DownloadState::Finished | DownloadState::Error))
        .count();
    let done = status.finished_count + settled;
    let total = status.items.len() + status.finished_count;
    (
        u64::try_from(done).unwrap_or(u64::MAX),
        u64::try_from(total).unwrap_or(u64::MAX),
    )
}

fn bar_message(status: &DownloadStatus) -> String {
    let downloading: Vec<String> = status
        .items
        .iter()
        .filter(|item| item.state == DownloadState::Downloading)
        .map(|item| format!("{}#{} {:.0}%", item.manga_id, item.item_index, item.progress * 100.0))
        .collect();
    if downloading.is_empty() {
        "waiting".to_string()
    } else {
        downloading.join(", ")
    }
}

fn spawn_bar_inner(
    mut observer: Observer,
    mut stop: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_bar} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        loop {
            tokio::select! {
                _ = &mut stop => break,
                message = observer.receiver.recv() => match message {
                    Some(ObserverMessage::Status(status)) => {
                        let (done, total) = bar_counts(&status);
                        bar.set_length(total);
                        bar.set_position(done);
                        bar.set_message(bar_message(&status));
                    }
                    Some(ObserverMessage::Help(_)) => {}
                    None => break,
                },
            }
        }

        bar.finish_and_clear();
    })
}
