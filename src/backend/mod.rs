//! OS download manager abstraction for managed fetches

pub mod local;

#[cfg(all(target_os = "android", feature = "android-download-manager"))]
pub mod android;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use crate::Result;
use crate::config::CourierConfig;

pub use local::LocalDownloadManager;

/// Identifier the manager assigns to an enqueued download
pub type DownloadId = i64;

/// What a managed download needs from the request descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRequest {
    /// Task the download belongs to
    pub task_id: String,
    /// Source URL
    pub url: Url,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// MIME type advertised to the manager
    pub mime_type: String,
    /// Final file name, also used for the staging file
    pub filename: String,
    /// Notification title
    pub title: Option<String>,
    /// Notification description
    pub description: Option<String>,
    /// Whether the manager shows a notification
    pub notifications_enabled: bool,
}

/// Download status as reported by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Waiting to start
    Pending,
    /// Transferring
    Running,
    /// Paused by the manager, e.g. waiting for network
    Paused,
    /// Finished and the file is complete
    Successful,
    /// Finished without a usable file
    Failed,
}

impl From<i32> for DownloadStatus {
    fn from(status: i32) -> Self {
        match status {
            1 => DownloadStatus::Pending,
            2 => DownloadStatus::Running,
            4 => DownloadStatus::Paused,
            8 => DownloadStatus::Successful,
            _ => DownloadStatus::Failed,
        }
    }
}

impl DownloadStatus {
    /// Whether the manager will not change this status again
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Successful | DownloadStatus::Failed)
    }
}

/// One row of the manager's download table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Current status
    pub status: DownloadStatus,
    /// Bytes written so far
    pub bytes_so_far: u64,
    /// Expected size, when known
    pub bytes_total: Option<u64>,
    /// Where the manager writes the file, when it is reachable as a plain path
    pub local_path: Option<PathBuf>,
}

/// The operations a managed fetch needs from an OS download manager
pub trait DownloadManager: Send + Sync {
    /// Hand a download to the manager
    fn enqueue(&self, request: ManagedRequest) -> Result<DownloadId>;

    /// Look up a download; `None` once the manager no longer knows it
    fn query(&self, id: DownloadId) -> Result<Option<DownloadProgress>>;

    /// Stop a download and delete whatever it has written
    fn remove(&self, id: DownloadId) -> Result<()>;

    /// Stream of ids whose downloads reached a terminal status
    fn completions(&self) -> broadcast::Receiver<DownloadId>;

    /// Copy a finished download that has no `local_path` to `destination`
    ///
    /// Called from a blocking thread.
    fn export(&self, id: DownloadId, destination: &Path) -> Result<()> {
        let _ = destination;
        Err(crate::Error::exception(format!(
            "Managed download {} has no local file",
            id
        )))
    }
}

/// Pick the download manager native to the current platform
pub fn default_for_platform(
    config: &CourierConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn DownloadManager>> {
    #[cfg(all(target_os = "android", feature = "android-download-manager"))]
    {
        let _ = client;
        let _ = config;
        Ok(Arc::new(android::AndroidDownloadManager::new()?))
    }

    #[cfg(not(all(target_os = "android", feature = "android-download-manager")))]
    {
        Ok(Arc::new(LocalDownloadManager::new(
            client,
            config.staging_dir.clone(),
        )))
    }
}
