//! Result shapes handed back to callers

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `result` value of a managed fetch that completed
pub const MANAGED_DOWNLOAD_SUCCESS: &str = "SUCCESS";
/// `result` value of a managed fetch that failed
pub const MANAGED_DOWNLOAD_FAILURE: &str = "FAILURE";

/// Status line and headers of an HTTP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseInfo {
    /// HTTP status code
    pub code: u16,
    /// Response headers, multiple values joined with `", "`
    pub headers: BTreeMap<String, String>,
}

impl ResponseInfo {
    pub(crate) fn from_parts(status: http::StatusCode, headers: &http::HeaderMap) -> Self {
        Self {
            code: status.as_u16(),
            headers: flatten_headers(headers),
        }
    }
}

/// Outcome of a successful fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum FetchResult {
    /// The OS download manager performed the transfer
    Managed {
        /// Where the blob now lives
        #[serde(rename = "absoluteFilePath")]
        absolute_file_path: PathBuf,
        /// Always [`MANAGED_DOWNLOAD_SUCCESS`] for a resolved fetch
        result: String,
    },
    /// The courier streamed the transfer itself
    Unmanaged {
        /// Where the blob now lives
        #[serde(rename = "absoluteFilePath")]
        absolute_file_path: PathBuf,
        /// Response status and headers
        response: ResponseInfo,
    },
}

impl FetchResult {
    /// Destination of the fetched blob
    pub fn absolute_file_path(&self) -> &PathBuf {
        match self {
            FetchResult::Managed {
                absolute_file_path, ..
            }
            | FetchResult::Unmanaged {
                absolute_file_path, ..
            } => absolute_file_path,
        }
    }
}

/// Response of an upload or send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResponse {
    /// HTTP status code
    pub code: u16,
    /// Response body, or `""` when the caller did not ask for it
    pub data: String,
    /// Response headers, multiple values joined with `", "`
    pub headers: BTreeMap<String, String>,
}

/// Outcome of a successful upload or send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// The server response
    pub response: UploadResponse,
}

/// Join repeated headers into one comma separated value per name
pub(crate) fn flatten_headers(headers: &http::HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();

    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }

    flat
}
