//! Throttled progress events

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Name of the event stream progress is published on
pub const PROGRESS_EVENT_NAME: &str = "BlobCourierProgress";

/// Sentinel total for bodies of unknown size
pub const UNKNOWN_TOTAL: i64 = -1;

/// A single progress sample as seen by listeners
///
/// Byte counts serialize as decimal strings so they survive bridges that
/// only carry doubles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Task the sample belongs to
    pub task_id: String,
    /// Bytes transferred so far
    #[serde(serialize_with = "decimal")]
    pub written: i64,
    /// Expected total, or `-1` when unknown
    #[serde(serialize_with = "decimal")]
    pub total: i64,
}

fn decimal<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    /// Deliver one event. Must not block and must not fail.
    fn emit(&self, event: ProgressEvent);
}

/// Broadcast fan-out of progress events to any number of listeners
#[derive(Clone, Debug)]
pub struct EventBridge {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBridge {
    /// Create a bridge buffering up to `capacity` events per listener
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attach a listener
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Name of the event stream
    pub fn event_name(&self) -> &'static str {
        PROGRESS_EVENT_NAME
    }
}

impl ProgressSink for EventBridge {
    fn emit(&self, event: ProgressEvent) {
        // No listener attached means nobody is watching; drop the sample.
        if self.sender.send(event).is_err() {
            tracing::trace!("No progress listener attached, dropping event");
        }
    }
}

struct ThrottleState {
    last_emit: Instant,
    last_written: i64,
    finished: bool,
}

/// Per-request throttle in front of a [`ProgressSink`]
///
/// A sample is emitted when it completes the transfer (`written == total`)
/// or when strictly more than `interval` has elapsed since the previous
/// emission (or since the notifier was created). Samples that go backwards
/// and anything after the terminal sample are dropped.
pub struct ProgressNotifier {
    task_id: String,
    interval: Duration,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<ThrottleState>,
}

impl ProgressNotifier {
    /// Create a notifier for one request
    pub fn new(task_id: impl Into<String>, interval: Duration, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id: task_id.into(),
            interval,
            sink,
            state: Mutex::new(ThrottleState {
                last_emit: Instant::now(),
                last_written: 0,
                finished: false,
            }),
        }
    }

    /// Offer a sample; returns whether it was emitted
    pub fn notify(&self, written: u64, total: Option<u64>) -> bool {
        let written = to_i64(written);
        let total = total.map(to_i64).unwrap_or(UNKNOWN_TOTAL);
        self.offer(written, total, false)
    }

    /// Deliver the closing sample if it has not gone out yet
    ///
    /// When the total is unknown the closing sample reports `written` as
    /// the total so listeners always see a 100% sample.
    pub fn complete(&self, written: u64, total: Option<u64>) {
        let written = to_i64(written);
        let total = total.map(to_i64).unwrap_or(written);
        self.offer(written, total, true);
    }

    /// Whether the terminal sample has been delivered
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn offer(&self, written: i64, total: i64, closing: bool) -> bool {
        let mut state = self.state.lock();

        if state.finished || written < state.last_written {
            return false;
        }

        let terminal = closing || written == total;
        let now = Instant::now();
        if !terminal && now.duration_since(state.last_emit) <= self.interval {
            return false;
        }

        state.last_emit = now;
        state.last_written = written;
        state.finished = terminal;

        // Emitting under the lock keeps samples ordered across threads.
        self.sink.emit(ProgressEvent {
            task_id: self.task_id.clone(),
            written,
            total,
        });

        true
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
