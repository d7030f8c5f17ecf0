//! Portable in-process download manager
//!
//! Stands in for an OS download service on platforms without one. Each
//! enqueued download runs on its own tokio task, writes into the staging
//! directory and records its progress in a shared table that `query` reads.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{DownloadId, DownloadManager, DownloadProgress, DownloadStatus, ManagedRequest};
use crate::{Error, Result};

struct LocalDownload {
    progress: DownloadProgress,
    task: Option<JoinHandle<()>>,
}

type DownloadTable = Arc<Mutex<HashMap<DownloadId, LocalDownload>>>;

/// Download manager backed by the courier's own HTTP client
pub struct LocalDownloadManager {
    client: reqwest::Client,
    staging_dir: PathBuf,
    next_id: AtomicI64,
    downloads: DownloadTable,
    completions: broadcast::Sender<DownloadId>,
}

impl LocalDownloadManager {
    /// Create a manager staging its files in `staging_dir`
    pub fn new(client: reqwest::Client, staging_dir: PathBuf) -> Self {
        let (completions, _) = broadcast::channel(64);
        Self {
            client,
            staging_dir,
            next_id: AtomicI64::new(1),
            downloads: Arc::new(Mutex::new(HashMap::new())),
            completions,
        }
    }
}

impl DownloadManager for LocalDownloadManager {
    fn enqueue(&self, request: ManagedRequest) -> Result<DownloadId> {
        std::fs::create_dir_all(&self.staging_dir).map_err(|e| {
            Error::exception(format!("Failed to create staging directory: {}", e))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = self.staging_dir.join(format!("{}-{}", id, request.filename));

        self.downloads.lock().insert(
            id,
            LocalDownload {
                progress: DownloadProgress {
                    status: DownloadStatus::Pending,
                    bytes_so_far: 0,
                    bytes_total: None,
                    local_path: Some(path.clone()),
                },
                task: None,
            },
        );

        tracing::debug!("Enqueued managed download {} for task {}", id, request.task_id);

        let task = tokio::spawn(run_download(
            self.client.clone(),
            request,
            path,
            id,
            self.downloads.clone(),
            self.completions.clone(),
        ));

        match self.downloads.lock().get_mut(&id) {
            Some(download) => download.task = Some(task),
            // Removed before the handle could be stored
            None => task.abort(),
        }

        Ok(id)
    }

    fn query(&self, id: DownloadId) -> Result<Option<DownloadProgress>> {
        Ok(self
            .downloads
            .lock()
            .get(&id)
            .map(|download| download.progress.clone()))
    }

    fn remove(&self, id: DownloadId) -> Result<()> {
        let Some(download) = self.downloads.lock().remove(&id) else {
            return Ok(());
        };

        if let Some(task) = download.task {
            task.abort();
        }

        if let Some(path) = download.progress.local_path {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed staging file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::exception(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    fn completions(&self) -> broadcast::Receiver<DownloadId> {
        self.completions.subscribe()
    }
}

fn update(downloads: &DownloadTable, id: DownloadId, apply: impl FnOnce(&mut DownloadProgress)) {
    if let Some(download) = downloads.lock().get_mut(&id) {
        apply(&mut download.progress);
    }
}

async fn run_download(
    client: reqwest::Client,
    request: ManagedRequest,
    path: PathBuf,
    id: DownloadId,
    downloads: DownloadTable,
    completions: broadcast::Sender<DownloadId>,
) {
    update(&downloads, id, |p| p.status = DownloadStatus::Running);

    let status = match transfer(&client, &request, &path, id, &downloads).await {
        Ok(()) => DownloadStatus::Successful,
        Err(e) => {
            tracing::error!("Managed download {} failed: {}", id, e);
            let _ = tokio::fs::remove_file(&path).await;
            DownloadStatus::Failed
        }
    };

    update(&downloads, id, |p| p.status = status);
    let _ = completions.send(id);
}

async fn transfer(
    client: &reqwest::Client,
    request: &ManagedRequest,
    path: &PathBuf,
    id: DownloadId,
    downloads: &DownloadTable,
) -> Result<()> {
    let mut builder = client.get(request.url.clone());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await?;
    if !response.status().is_success() {
        return Err(Error::exception(format!(
            "server responded with {}",
            response.status()
        )));
    }

    let total = response.content_length();
    update(downloads, id, |p| p.bytes_total = total);

    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        update(downloads, id, |p| p.bytes_so_far = written);
    }

    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: Url) -> ManagedRequest {
        ManagedRequest {
            task_id: "local".to_string(),
            url,
            headers: vec![("x-test".to_string(), "1".to_string())],
            mime_type: "application/octet-stream".to_string(),
            filename: "blob.bin".to_string(),
            title: None,
            description: None,
            notifications_enabled: false,
        }
    }

    #[tokio::test]
    async fn test_download_completes_and_broadcasts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 2048]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(reqwest::Client::new(), dir.path().to_path_buf());
        let mut completions = manager.completions();

        let url = Url::parse(&format!("{}/blob", server.uri())).unwrap();
        let id = manager.enqueue(request(url)).unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished, id);

        let progress = manager.query(id).unwrap().unwrap();
        assert_eq!(progress.status, DownloadStatus::Successful);
        assert_eq!(progress.bytes_so_far, 2048);
        assert_eq!(progress.bytes_total, Some(2048));

        let local = progress.local_path.unwrap();
        assert_eq!(std::fs::read(&local).unwrap().len(), 2048);

        manager.remove(id).unwrap();
        assert!(!local.exists());
        assert!(manager.query(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_status_fails_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(reqwest::Client::new(), dir.path().to_path_buf());
        let mut completions = manager.completions();

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let id = manager.enqueue(request(url)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();

        let progress = manager.query(id).unwrap().unwrap();
        assert_eq!(progress.status, DownloadStatus::Failed);
        assert!(!progress.local_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(reqwest::Client::new(), dir.path().to_path_buf());
        manager.remove(42).unwrap();
    }
}
