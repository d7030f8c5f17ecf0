//! Process-wide task id to cancellation token registry

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

static GLOBAL_BROKER: Lazy<Arc<CancellationBroker>> =
    Lazy::new(|| Arc::new(CancellationBroker::new()));

struct Entry {
    generation: u64,
    token: CancellationToken,
}

/// Routes cancellation requests to in-flight transfers by task id
///
/// A transfer registers before its first suspension point and holds the
/// returned [`Registration`] for as long as it runs. Dropping the
/// registration removes the entry, so finished tasks never linger.
#[derive(Default)]
pub struct CancellationBroker {
    entries: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl CancellationBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker shared by every courier in the process that doesn't bring its own
    pub fn global() -> Arc<Self> {
        GLOBAL_BROKER.clone()
    }

    /// Register a transfer under `task_id`
    ///
    /// Reusing the id of a live transfer replaces its entry; the earlier
    /// transfer can then no longer be cancelled by id.
    pub fn register(self: &Arc<Self>, task_id: &str) -> Registration {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let previous = self.entries.lock().insert(
            task_id.to_string(),
            Entry {
                generation,
                token: token.clone(),
            },
        );
        if previous.is_some() {
            tracing::warn!("Task id {} was already in flight, replacing its registration", task_id);
        }

        Registration {
            broker: Arc::clone(self),
            task_id: task_id.to_string(),
            generation,
            token,
        }
    }

    /// Signal the transfer registered under `task_id`
    ///
    /// Returns whether a live transfer was signalled. Unknown or finished
    /// ids are a no-op.
    pub fn cancel(&self, task_id: &str) -> bool {
        let entries = self.entries.lock();
        match entries.get(task_id) {
            Some(entry) => {
                tracing::debug!("Cancelling task {}", task_id);
                entry.token.cancel();
                true
            }
            None => {
                tracing::debug!("Cancel for unknown or finished task {}", task_id);
                false
            }
        }
    }

    /// Whether a transfer is currently registered under `task_id`
    pub fn is_registered(&self, task_id: &str) -> bool {
        self.entries.lock().contains_key(task_id)
    }

    /// Number of registered transfers
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no transfer is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn deregister(&self, task_id: &str, generation: u64) {
        let mut entries = self.entries.lock();
        if entries
            .get(task_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(task_id);
        }
    }
}

/// Live registration of one transfer; deregisters on drop
pub struct Registration {
    broker: Arc<CancellationBroker>,
    task_id: String,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    /// Token signalled when the task is cancelled
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Task id this registration belongs to
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.broker.deregister(&self.task_id, self.generation);
    }
}
