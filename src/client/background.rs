//! Managed fetch: delegate to a download manager and wait for its verdict
//!
//! Three parties may decide how a managed fetch ends: the poller, which
//! queries the manager on the progress interval; the completion listener,
//! which reacts to the manager's completion broadcast; and a cancellation.
//! They all write into one [`OutcomeCell`]. The first write wins and the
//! rest are ignored, so each request settles exactly once.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::{CourierInner, header_map};
use crate::backend::{DownloadId, DownloadManager, DownloadProgress, DownloadStatus, ManagedRequest};
use crate::params::FetchRequest;
use crate::progress::ProgressNotifier;
use crate::response::{FetchResult, MANAGED_DOWNLOAD_FAILURE, MANAGED_DOWNLOAD_SUCCESS};
use crate::{Error, Result};

#[derive(Debug)]
enum Settlement {
    Completed(DownloadProgress),
    Failed(String),
    Cancelled,
}

impl Settlement {
    fn from_terminal(progress: DownloadProgress) -> Self {
        if progress.status == DownloadStatus::Successful {
            Settlement::Completed(progress)
        } else {
            Settlement::Failed(format!(
                "download manager reported failure after {} bytes",
                progress.bytes_so_far
            ))
        }
    }
}

/// Single-assignment slot for the final outcome
struct OutcomeCell {
    sender: Mutex<Option<oneshot::Sender<Settlement>>>,
}

impl OutcomeCell {
    fn new(sender: oneshot::Sender<Settlement>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns whether this call decided the outcome
    fn settle(&self, settlement: Settlement) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                let _ = sender.send(settlement);
                true
            }
            None => false,
        }
    }
}

/// An enqueued download and the tasks watching it
///
/// Dropping it stops the watchers and releases the manager's record, which
/// also covers the request future being dropped before it settles.
struct ManagedDownload {
    manager: Arc<dyn DownloadManager>,
    id: DownloadId,
    watchers: Vec<JoinHandle<()>>,
}

impl ManagedDownload {
    fn stop_watching(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}

impl Drop for ManagedDownload {
    fn drop(&mut self) {
        self.stop_watching();
        release(self.manager.as_ref(), self.id);
    }
}

pub(crate) async fn fetch_managed(
    inner: &CourierInner,
    request: FetchRequest,
) -> Result<FetchResult> {
    // The manager would only fail on these after the download was queued
    header_map(&request.common.headers)?;

    let task_id = request.common.task_id.clone();
    let registration = inner.broker.register(&task_id);
    let manager = inner.manager.clone();
    let destination = inner.target_dir(request.target).join(&request.filename);
    let notifier = Arc::new(ProgressNotifier::new(
        task_id.as_str(),
        request.common.progress_interval,
        inner.sink.clone(),
    ));

    // Subscribe before enqueueing so a fast completion is not missed
    let completions = manager.completions();
    let id = manager.enqueue(ManagedRequest {
        task_id: task_id.clone(),
        url: request.common.url.clone(),
        headers: request.common.headers.clone(),
        mime_type: request.mime_type.clone(),
        filename: request.filename.clone(),
        title: request.manager.title.clone(),
        description: request.manager.description.clone(),
        notifications_enabled: request.manager.notifications_enabled,
    })?;
    tracing::debug!("Task {} enqueued as managed download {}", task_id, id);

    let mut download = ManagedDownload {
        manager: manager.clone(),
        id,
        watchers: Vec::with_capacity(2),
    };

    let (sender, mut receiver) = oneshot::channel();
    let cell = Arc::new(OutcomeCell::new(sender));

    download.watchers.push(tokio::spawn(poll(
        manager.clone(),
        id,
        request.common.progress_interval,
        notifier.clone(),
        cell.clone(),
    )));
    download
        .watchers
        .push(tokio::spawn(listen(manager.clone(), id, completions, cell.clone())));

    let settled = tokio::select! {
        biased;
        settled = &mut receiver => Some(settled),
        _ = registration.token().cancelled() => None,
    };
    let settlement = match settled {
        Some(settled) => settled,
        None => {
            if cell.settle(Settlement::Cancelled) {
                tracing::debug!("Managed download {} cancelled", id);
            }
            receiver.await
        }
    }
    .unwrap_or_else(|_| Settlement::Failed("completion signal lost".to_string()));

    download.stop_watching();
    drop(registration);

    match settlement {
        Settlement::Completed(progress) => {
            let relocated = match progress.local_path {
                Some(source) => relocate(&source, &destination).await,
                None => export(manager, id, destination.clone()).await,
            };

            drop(download);
            relocated?;

            notifier.complete(progress.bytes_so_far, progress.bytes_total);
            Ok(FetchResult::Managed {
                absolute_file_path: destination,
                result: MANAGED_DOWNLOAD_SUCCESS.to_string(),
            })
        }
        Settlement::Failed(reason) => Err(Error::exception(format!(
            "Managed download failed ({}): {}",
            MANAGED_DOWNLOAD_FAILURE, reason
        ))),
        Settlement::Cancelled => Err(Error::Cancelled),
    }
}

async fn poll(
    manager: Arc<dyn DownloadManager>,
    id: DownloadId,
    interval: Duration,
    notifier: Arc<ProgressNotifier>,
    cell: Arc<OutcomeCell>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));

    loop {
        ticker.tick().await;

        match manager.query(id) {
            Ok(Some(progress)) => {
                notifier.notify(progress.bytes_so_far, progress.bytes_total);
                if progress.status.is_terminal() {
                    cell.settle(Settlement::from_terminal(progress));
                    return;
                }
            }
            Ok(None) => {
                cell.settle(Settlement::Failed(format!(
                    "download {} disappeared from the manager",
                    id
                )));
                return;
            }
            // Transient query errors are retried on the next tick
            Err(e) => tracing::warn!("Failed to query managed download {}: {}", id, e),
        }
    }
}

async fn listen(
    manager: Arc<dyn DownloadManager>,
    id: DownloadId,
    mut completions: broadcast::Receiver<DownloadId>,
    cell: Arc<OutcomeCell>,
) {
    loop {
        match completions.recv().await {
            Ok(finished) if finished == id => break,
            Ok(_) => continue,
            // The poller still covers anything missed while lagging
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Completion listener for {} skipped {} signals", id, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }

    let settlement = match manager.query(id) {
        Ok(Some(progress)) if progress.status.is_terminal() => Settlement::from_terminal(progress),
        // Signalled before the table caught up; leave it to the poller
        Ok(Some(_)) => return,
        Ok(None) => Settlement::Failed(format!("download {} disappeared from the manager", id)),
        Err(e) => Settlement::Failed(e.to_string()),
    };
    cell.settle(settlement);
}

/// Move the finished file into the sandbox, copying across filesystems
async fn relocate(source: &Path, destination: &PathBuf) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::exception(format!("Failed to create parent directory: {}", e))
        })?;
    }

    if tokio::fs::rename(source, destination).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(source, destination).await.map_err(|e| {
        Error::exception(format!(
            "Failed to move {} to {}: {}",
            source.display(),
            destination.display(),
            e
        ))
    })?;
    if let Err(e) = tokio::fs::remove_file(source).await {
        tracing::warn!("Failed to remove {} after copying: {}", source.display(), e);
    }

    Ok(())
}

/// Let the manager copy out a file it only exposes through its own storage
async fn export(
    manager: Arc<dyn DownloadManager>,
    id: DownloadId,
    destination: PathBuf,
) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::exception(format!("Failed to create parent directory: {}", e))
        })?;
    }

    tokio::task::spawn_blocking(move || manager.export(id, &destination))
        .await
        .map_err(Error::from_join)?
}

/// Drop the manager's record and whatever file it still holds
fn release(manager: &dyn DownloadManager, id: DownloadId) {
    if let Err(e) = manager.remove(id) {
        tracing::warn!("Failed to release managed download {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationBroker;
    use crate::config::CourierConfig;
    use crate::progress::tests::RecordingSink;
    use crate::progress::{EventBridge, ProgressSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Manager that reports success both through polling and the broadcast at once
    struct EagerManager {
        staged: PathBuf,
        completions: broadcast::Sender<DownloadId>,
        removed: AtomicUsize,
    }

    impl DownloadManager for EagerManager {
        fn enqueue(&self, _request: ManagedRequest) -> Result<DownloadId> {
            std::fs::write(&self.staged, b"managed bytes")?;
            let _ = self.completions.send(7);
            Ok(7)
        }

        fn query(&self, _id: DownloadId) -> Result<Option<DownloadProgress>> {
            Ok(Some(DownloadProgress {
                status: DownloadStatus::Successful,
                bytes_so_far: 13,
                bytes_total: Some(13),
                local_path: Some(self.staged.clone()),
            }))
        }

        fn remove(&self, _id: DownloadId) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn completions(&self) -> broadcast::Receiver<DownloadId> {
            self.completions.subscribe()
        }
    }

    /// Manager whose download never finishes
    struct StalledManager {
        enqueued: AtomicUsize,
        removed: AtomicUsize,
        completions: broadcast::Sender<DownloadId>,
    }

    impl StalledManager {
        fn new() -> Self {
            let (completions, _) = broadcast::channel(4);
            Self {
                enqueued: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
                completions,
            }
        }
    }

    impl DownloadManager for StalledManager {
        fn enqueue(&self, _request: ManagedRequest) -> Result<DownloadId> {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }

        fn query(&self, _id: DownloadId) -> Result<Option<DownloadProgress>> {
            Ok(Some(DownloadProgress {
                status: DownloadStatus::Running,
                bytes_so_far: 5,
                bytes_total: Some(100),
                local_path: None,
            }))
        }

        fn remove(&self, _id: DownloadId) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn completions(&self) -> broadcast::Receiver<DownloadId> {
            self.completions.subscribe()
        }
    }

    /// Manager whose finished file is only reachable through `export`
    struct ContentManager {
        removed: AtomicUsize,
        completions: broadcast::Sender<DownloadId>,
    }

    impl DownloadManager for ContentManager {
        fn enqueue(&self, _request: ManagedRequest) -> Result<DownloadId> {
            Ok(3)
        }

        fn query(&self, _id: DownloadId) -> Result<Option<DownloadProgress>> {
            Ok(Some(DownloadProgress {
                status: DownloadStatus::Successful,
                bytes_so_far: 7,
                bytes_total: Some(7),
                local_path: None,
            }))
        }

        fn remove(&self, _id: DownloadId) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn completions(&self) -> broadcast::Receiver<DownloadId> {
            self.completions.subscribe()
        }

        fn export(&self, _id: DownloadId, destination: &Path) -> Result<()> {
            std::fs::write(destination, b"content")?;
            Ok(())
        }
    }

    fn inner(
        root: &Path,
        manager: Arc<dyn DownloadManager>,
        sink: Arc<dyn ProgressSink>,
    ) -> CourierInner {
        CourierInner {
            config: CourierConfig::rooted_at(root),
            client: reqwest::Client::new(),
            bridge: EventBridge::new(8),
            sink,
            broker: Arc::new(CancellationBroker::new()),
            manager,
        }
    }

    fn request(task_id: &str) -> FetchRequest {
        FetchRequest::from_value(
            &json!({
                "taskId": task_id,
                "url": "https://example.com/blob",
                "filename": "blob.bin",
                "useDownloadManager": true,
                "progressIntervalMilliseconds": 5,
            }),
            500,
        )
        .unwrap()
    }

    #[test]
    fn test_outcome_cell_first_writer_wins() {
        let (sender, mut receiver) = oneshot::channel();
        let cell = OutcomeCell::new(sender);

        assert!(cell.settle(Settlement::Cancelled));
        assert!(!cell.settle(Settlement::Failed("late".to_string())));
        assert!(matches!(receiver.try_recv(), Ok(Settlement::Cancelled)));
    }

    #[tokio::test]
    async fn test_racing_signals_settle_once() {
        let dir = tempfile::tempdir().unwrap();
        let (completions, _) = broadcast::channel(4);
        let manager = Arc::new(EagerManager {
            staged: dir.path().join("staged.bin"),
            completions,
            removed: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let inner = inner(dir.path(), manager.clone(), sink.clone());

        let result = fetch_managed(&inner, request("race")).await.unwrap();

        let expected = dir.path().join("cache").join("blob.bin");
        assert_eq!(
            result,
            FetchResult::Managed {
                absolute_file_path: expected.clone(),
                result: "SUCCESS".to_string(),
            }
        );
        assert_eq!(std::fs::read(&expected).unwrap(), b"managed bytes");
        assert!(!dir.path().join("staged.bin").exists());
        assert_eq!(manager.removed.load(Ordering::SeqCst), 1);

        let events = sink.events.lock();
        let last = events.last().unwrap();
        assert_eq!((last.written, last.total), (13, 13));
        assert!(inner.broker.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stalled_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(StalledManager::new());
        let inner = Arc::new(inner(
            dir.path(),
            manager.clone(),
            Arc::new(RecordingSink::default()),
        ));

        let running = {
            let inner = inner.clone();
            tokio::spawn(async move { fetch_managed(&inner, request("stalled")).await })
        };

        while !inner.broker.is_registered("stalled") {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        inner.broker.cancel("stalled");

        let result = running.await.unwrap();
        assert_eq!(result.err(), Some(Error::Cancelled));
        assert_eq!(manager.removed.load(Ordering::SeqCst), 1);
        assert!(!inner.broker.is_registered("stalled"));
    }

    #[tokio::test]
    async fn test_dropped_fetch_releases_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(StalledManager::new());
        let inner = inner(dir.path(), manager.clone(), Arc::new(RecordingSink::default()));

        let outcome = tokio::time::timeout(
            Duration::from_millis(30),
            fetch_managed(&inner, request("abandoned")),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(manager.removed.load(Ordering::SeqCst), 1);
        assert!(inner.broker.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_header_rejected_before_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(StalledManager::new());
        let inner = inner(dir.path(), manager.clone(), Arc::new(RecordingSink::default()));

        let request = FetchRequest::from_value(
            &json!({
                "taskId": "bad-header",
                "url": "https://example.com/blob",
                "filename": "blob.bin",
                "useDownloadManager": true,
                "headers": {"bad name": "v"},
            }),
            500,
        )
        .unwrap();

        let result = fetch_managed(&inner, request).await;

        assert_eq!(result.err(), Some(Error::invalid("headers", "bad name")));
        assert_eq!(manager.enqueued.load(Ordering::SeqCst), 0);
        assert_eq!(manager.removed.load(Ordering::SeqCst), 0);
        assert!(inner.broker.is_empty());
    }

    #[tokio::test]
    async fn test_export_without_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let (completions, _) = broadcast::channel(4);
        let manager = Arc::new(ContentManager {
            removed: AtomicUsize::new(0),
            completions,
        });
        let inner = inner(dir.path(), manager.clone(), Arc::new(RecordingSink::default()));

        let result = fetch_managed(&inner, request("content")).await.unwrap();

        let expected = dir.path().join("cache").join("blob.bin");
        assert_eq!(result.absolute_file_path(), &expected);
        assert_eq!(std::fs::read(&expected).unwrap(), b"content");
        assert_eq!(manager.removed.load(Ordering::SeqCst), 1);
    }
}
