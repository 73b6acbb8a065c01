//! Coalescing wake-up signal and the throttled loop that consumes it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wake-up signal with room for one pending notification.
///
/// Raising an already-pending signal is a no-op, so any burst of raises
/// collapses into a single wake-up of the consumer.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    tx: mpsc::Sender<()>,
}

impl Signal {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Requests a pass of the consumer.
    pub(crate) fn raise(&self) {
        // Full means a wake-up is already pending; Closed means the consumer is gone.
        let _ = self.tx.try_send(());
    }
}

/// Runs `on_signal` for each wake-up, at most once per `interval`.
///
/// The first signal is handled immediately; signals arriving during the
/// following `interval` are coalesced into one pass after it. Returns when
/// `shutdown` fires or every [`Signal`] has been dropped.
pub(crate) async fn run_throttled<F>(
    mut rx: mpsc::Receiver<()>,
    interval: Duration,
    shutdown: CancellationToken,
    mut on_signal: F,
) where
    F: FnMut(),
{
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            received = rx.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }

        on_signal();

        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
