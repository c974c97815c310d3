//! Per-job progress channel
//!
//! Bridges a blocking worker thread to the async task serving the client
//! connection. The sender side is cheap to clone and never blocks; the
//! receiver side turns queued events into a stream with idle keepalives.
//!
//! Ordering guarantees:
//! - Events arrive in send order
//! - At most one terminal event (`Complete` / `Error`) is accepted
//! - Nothing is accepted after the terminal event
//! - If every sender is dropped without a terminal, the stream synthesizes an
//!   `Error` so clients never wait forever

use futures::Stream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stemsync_common::events::{FailureKind, ProgressEvent, StreamItem};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default idle interval between keepalive items
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(100);

/// Create a connected sender/receiver pair for one job
pub fn progress_channel(job_id: &str, keepalive: Duration) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let job_id: Arc<str> = Arc::from(job_id);

    let sender = ProgressSender {
        tx,
        closed: Arc::new(Mutex::new(false)),
        job_id: Arc::clone(&job_id),
    };
    let receiver = ProgressReceiver {
        rx,
        keepalive,
        job_id,
    };
    (sender, receiver)
}

/// Producer half, usable from any thread
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    /// Set once a terminal event has been queued; held across the send so
    /// nothing can slip in behind the terminal
    closed: Arc<Mutex<bool>>,
    job_id: Arc<str>,
}

impl ProgressSender {
    /// Queue an event
    ///
    /// Returns `false` when the event was refused because a terminal event was
    /// already sent. A disconnected client is not a refusal: the job keeps
    /// running and its events are dropped.
    pub fn send(&self, event: ProgressEvent) -> bool {
        let mut closed = self.closed.lock().unwrap_or_else(|p| p.into_inner());

        if *closed {
            warn!(
                job_id = %self.job_id,
                event_type = event.event_type(),
                "Dropping event sent after terminal event"
            );
            return false;
        }

        if event.is_terminal() {
            *closed = true;
        }

        if self.tx.send(event).is_err() {
            debug!(job_id = %self.job_id, "Progress receiver gone; event discarded");
        }
        true
    }

    pub fn progress(&self, percent: u8, stage: impl Into<String>) -> bool {
        self.send(ProgressEvent::progress(percent, stage))
    }

    pub fn progress_with_detail(
        &self,
        percent: u8,
        stage: impl Into<String>,
        detail: impl Into<String>,
    ) -> bool {
        self.send(ProgressEvent::progress_with_detail(percent, stage, detail))
    }

    /// Whether a terminal event has been sent
    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Consumer half, owned by the task serving the client
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    keepalive: Duration,
    job_id: Arc<str>,
}

impl ProgressReceiver {
    /// Stream of events with a keepalive after each idle interval
    ///
    /// Ends right after the terminal event.
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        let ProgressReceiver {
            mut rx,
            keepalive,
            job_id,
        } = self;

        async_stream::stream! {
            loop {
                match tokio::time::timeout(keepalive, rx.recv()).await {
                    Ok(Some(event)) => {
                        let terminal = event.is_terminal();
                        yield StreamItem::Event(event);
                        if terminal {
                            debug!(job_id = %job_id, "Progress stream reached terminal event");
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!(job_id = %job_id, "Job ended without a terminal event");
                        yield StreamItem::Event(ProgressEvent::error(
                            "Job ended unexpectedly without a result",
                            FailureKind::ProcessingFailure,
                        ));
                        break;
                    }
                    Err(_) => yield StreamItem::Keepalive,
                }
            }
        }
    }

    /// Wait for the terminal event, discarding everything before it
    pub async fn wait_for_terminal(mut self) -> ProgressEvent {
        while let Some(event) = self.rx.recv().await {
            if event.is_terminal() {
                return event;
            }
        }
        warn!(job_id = %self.job_id, "Job ended without a terminal event");
        ProgressEvent::error(
            "Job ended unexpectedly without a result",
            FailureKind::ProcessingFailure,
        )
    }
}
