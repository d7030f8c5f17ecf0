//! Courier configuration

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Name of the subdirectory created under the platform cache and data directories
const APP_DIR_NAME: &str = "blob-courier";

/// Sibling of the cache directory holding in-flight managed downloads
const STAGING_DIR_NAME: &str = "blob-courier-staging";

/// Canonical progress throttle interval in milliseconds
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

/// Default capacity of the progress broadcast channel
pub const DEFAULT_PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Process level configuration shared by every request of a courier
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierConfig {
    /// Directory backing the `cache` target
    pub cache_dir: PathBuf,
    /// Directory backing the `data` target
    pub data_dir: PathBuf,
    /// Where the portable download manager keeps in-flight managed downloads
    pub staging_dir: PathBuf,
    /// Throttle interval used when a request does not carry one
    #[serde(rename = "progressIntervalMilliseconds")]
    pub progress_interval_ms: u64,
    /// User agent sent with every request
    pub user_agent: Option<String>,
    /// Whole-request timeout for unmanaged transfers
    #[serde(rename = "timeoutMilliseconds")]
    pub timeout_ms: Option<u64>,
    /// Capacity of the progress event channel
    pub progress_channel_capacity: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        let cache_base = platform_base(dirs::cache_dir());

        Self {
            cache_dir: cache_base.join(APP_DIR_NAME),
            data_dir: platform_base(dirs::data_dir()).join(APP_DIR_NAME),
            staging_dir: cache_base.join(STAGING_DIR_NAME),
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            user_agent: None,
            timeout_ms: None,
            progress_channel_capacity: DEFAULT_PROGRESS_CHANNEL_CAPACITY,
        }
    }
}

fn platform_base(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(std::env::temp_dir)
}

impl CourierConfig {
    /// Parse a configuration from JSON, filling absent fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::invalid("config", format!("failed to parse configuration: {}", e)))
    }

    /// Read and parse a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::exception(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Configuration rooted in a single directory, used by tests and sandboxed hosts
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
            staging_dir: root.join("staging"),
            ..Self::default()
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
