//! Fetch and upload binary payloads with throttled progress, cancellation
//! and optional delegation to the platform download manager.
//!
//! Every operation takes an untyped JSON map, validates it into a typed
//! descriptor and resolves to a single result or a single [`Error`] whose
//! [`Error::code`] is stable.
//!
//! ```no_run
//! # use blob_courier::Courier;
//! # use serde_json::json;
//! # async fn example() -> blob_courier::Result<()> {
//! let courier = Courier::builder().user_agent("my-app/1.0").build()?;
//!
//! let result = courier
//!     .upload_blob(&json!({
//!         "taskId": "upload-1",
//!         "url": "https://example.com/upload",
//!         "parts": {
//!             "file": {
//!                 "type": "file",
//!                 "payload": {"absoluteFilePath": "/tmp/photo.jpg", "mimeType": "image/jpeg"},
//!             },
//!         },
//!         "returnResponse": true,
//!     }))
//!     .await?;
//!
//! println!("{} {}", result.response.code, result.response.data);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

pub use backend::{
    DownloadId, DownloadManager, DownloadProgress, DownloadStatus, LocalDownloadManager,
    ManagedRequest,
};
pub use cancel::{CancellationBroker, Registration};
pub use client::{Courier, CourierBuilder};
pub use config::CourierConfig;
pub use error::{Error, ErrorPayload, Result};
pub use lifecycle::{Phase, TransferPath};
pub use progress::{EventBridge, PROGRESS_EVENT_NAME, ProgressEvent, ProgressNotifier, ProgressSink};
pub use response::{
    FetchResult, MANAGED_DOWNLOAD_FAILURE, MANAGED_DOWNLOAD_SUCCESS, ResponseInfo, UploadResponse,
    UploadResult,
};

pub use body::StreamingBody;

pub mod backend;
pub mod error;
pub mod params;

mod body;
mod cancel;
mod client;
mod config;
mod lifecycle;
mod progress;
mod response;
