//! The courier: wires validation, transfer and result mapping per request

pub mod background;
pub mod download;
pub mod upload;

use futures_util::FutureExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{self, DownloadManager};
use crate::cancel::CancellationBroker;
use crate::config::CourierConfig;
use crate::lifecycle::{Lifecycle, TransferPath};
use crate::params::{CancelRequest, FetchRequest, SendRequest, TargetDirectory, UploadRequest};
use crate::progress::{EventBridge, ProgressEvent, ProgressSink};
use crate::response::{FetchResult, UploadResult};
use crate::{Error, Result};

pub(crate) struct CourierInner {
    pub(crate) config: CourierConfig,
    pub(crate) client: reqwest::Client,
    pub(crate) bridge: EventBridge,
    pub(crate) sink: Arc<dyn ProgressSink>,
    pub(crate) broker: Arc<CancellationBroker>,
    pub(crate) manager: Arc<dyn DownloadManager>,
}

impl CourierInner {
    pub(crate) fn target_dir(&self, target: TargetDirectory) -> &PathBuf {
        match target {
            TargetDirectory::Cache => &self.config.cache_dir,
            TargetDirectory::Data => &self.config.data_dir,
        }
    }

    pub(crate) fn apply_timeout(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.timeout() {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }
}

/// Fetches, uploads and sends blobs
///
/// Cloning is cheap; clones share the HTTP client, the progress sink, the
/// cancellation broker and the download manager.
///
/// # Examples
///
/// ```no_run
/// # use blob_courier::Courier;
/// # use serde_json::json;
/// # async fn example() -> blob_courier::Result<()> {
/// let courier = Courier::new()?;
/// let mut progress = courier.subscribe();
///
/// let result = courier
///     .fetch_blob(&json!({
///         "taskId": "photo-1",
///         "url": "https://example.com/photo.jpg",
///         "filename": "photo.jpg",
///     }))
///     .await?;
///
/// println!("Saved to {:?}", result.absolute_file_path());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Courier {
    inner: Arc<CourierInner>,
}

impl Courier {
    /// Create a courier with default configuration
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a courier builder
    pub fn builder() -> CourierBuilder {
        CourierBuilder::new()
    }

    /// Configuration in effect
    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    /// Broker routing this courier's cancellations
    pub fn cancellation_broker(&self) -> &Arc<CancellationBroker> {
        &self.inner.broker
    }

    /// Listen to progress events
    ///
    /// Only receives events when no custom progress sink was installed.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.bridge.subscribe()
    }

    /// Download a blob into the cache or data directory
    pub async fn fetch_blob(&self, raw: &Value) -> Result<FetchResult> {
        let mut lifecycle = Lifecycle::new("fetch");

        let request = match FetchRequest::from_value(raw, self.inner.config.progress_interval_ms) {
            Ok(request) => request,
            Err(e) => return lifecycle.finish(Err(e)),
        };
        lifecycle.validated(&request.common.task_id);

        let result = if request.use_download_manager {
            lifecycle.dispatch(TransferPath::Managed);
            background::fetch_managed(&self.inner, request).await
        } else {
            lifecycle.dispatch(TransferPath::Unmanaged);
            download::fetch_unmanaged(&self.inner, request).await
        };

        lifecycle.finish(result)
    }

    /// Upload parts as `multipart/form-data`
    pub async fn upload_blob(&self, raw: &Value) -> Result<UploadResult> {
        let mut lifecycle = Lifecycle::new("upload");

        let request = match UploadRequest::from_value(raw, self.inner.config.progress_interval_ms) {
            Ok(request) => request,
            Err(e) => return lifecycle.finish(Err(e)),
        };
        lifecycle.validated(&request.common.task_id);
        lifecycle.dispatch(TransferPath::Unmanaged);

        let result = upload::upload_multipart(&self.inner, request).await;
        lifecycle.finish(result)
    }

    /// Stream a single file as the raw request body
    pub async fn send_blob(&self, raw: &Value) -> Result<UploadResult> {
        let mut lifecycle = Lifecycle::new("send");

        let request = match SendRequest::from_value(raw, self.inner.config.progress_interval_ms) {
            Ok(request) => request,
            Err(e) => return lifecycle.finish(Err(e)),
        };
        lifecycle.validated(&request.common.task_id);
        lifecycle.dispatch(TransferPath::Unmanaged);

        let result = upload::send_file(&self.inner, request).await;
        lifecycle.finish(result)
    }

    /// Cancel the transfer registered under `taskId`
    ///
    /// Cancelling an unknown or already finished task succeeds without effect.
    pub async fn cancel_request(&self, raw: &Value) -> Result<()> {
        let request = CancelRequest::from_value(raw)?;
        if !self.inner.broker.cancel(&request.task_id) {
            tracing::debug!("Nothing to cancel for task {}", request.task_id);
        }
        Ok(())
    }

    /// Run [`Courier::fetch_blob`] on its own task and hand the outcome to `resolve`
    pub fn spawn_fetch_blob<F>(&self, raw: Value, resolve: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<FetchResult>) + Send + 'static,
    {
        let courier = self.clone();
        dispatch(async move { courier.fetch_blob(&raw).await }, resolve)
    }

    /// Run [`Courier::upload_blob`] on its own task and hand the outcome to `resolve`
    pub fn spawn_upload_blob<F>(&self, raw: Value, resolve: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<UploadResult>) + Send + 'static,
    {
        let courier = self.clone();
        dispatch(async move { courier.upload_blob(&raw).await }, resolve)
    }

    /// Run [`Courier::send_blob`] on its own task and hand the outcome to `resolve`
    pub fn spawn_send_blob<F>(&self, raw: Value, resolve: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<UploadResult>) + Send + 'static,
    {
        let courier = self.clone();
        dispatch(async move { courier.send_blob(&raw).await }, resolve)
    }

    /// Run [`Courier::cancel_request`] on its own task and hand the outcome to `resolve`
    pub fn spawn_cancel_request<F>(&self, raw: Value, resolve: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let courier = self.clone();
        dispatch(async move { courier.cancel_request(&raw).await }, resolve)
    }
}

/// Run `work` on a worker task and resolve exactly once, even if the worker panics
///
/// Aborting the returned handle drops `work`, releasing whatever it holds,
/// and `resolve` is not called.
fn dispatch<T, Fut, F>(work: Fut, resolve: F) -> JoinHandle<()>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    F: FnOnce(Result<T>) + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::from_panic(panic)),
        };
        resolve(outcome);
    })
}

/// Merge caller headers into a header map, later entries replacing earlier ones
pub(crate) fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::invalid("headers", name.as_str()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| Error::invalid("headers", value.as_str()))?;
        map.insert(header_name, header_value);
    }

    Ok(map)
}

/// Builder for creating couriers
pub struct CourierBuilder {
    config: CourierConfig,
    sink: Option<Arc<dyn ProgressSink>>,
    broker: Option<Arc<CancellationBroker>>,
    manager: Option<Arc<dyn DownloadManager>>,
}

impl CourierBuilder {
    /// Create a new courier builder
    pub fn new() -> Self {
        Self {
            config: CourierConfig::default(),
            sink: None,
            broker: None,
            manager: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    /// Directory backing the `cache` target
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    /// Directory backing the `data` target
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Staging directory of the portable download manager
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    /// Default progress throttle interval
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Set request timeout for unmanaged transfers
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Deliver progress to `sink` instead of the built-in event bridge
    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a dedicated cancellation broker instead of the process-wide one
    pub fn cancellation_broker(mut self, broker: Arc<CancellationBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use a specific download manager for managed fetches
    pub fn download_manager(mut self, manager: Arc<dyn DownloadManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Build the courier
    pub fn build(self) -> Result<Courier> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let client = builder
            .build()
            .map_err(|e| Error::exception(format!("Failed to create HTTP client: {}", e)))?;

        let bridge = EventBridge::new(self.config.progress_channel_capacity);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(bridge.clone()) as Arc<dyn ProgressSink>);
        let broker = self.broker.unwrap_or_else(CancellationBroker::global);
        let manager = match self.manager {
            Some(manager) => manager,
            None => backend::default_for_platform(&self.config, client.clone())?,
        };

        Ok(Courier {
            inner: Arc::new(CourierInner {
                config: self.config,
                client,
                bridge,
                sink,
                broker,
                manager,
            }),
        })
    }
}

impl Default for CourierBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_map_replaces_duplicates() {
        let map = header_map(&[
            ("X-One".to_string(), "a".to_string()),
            ("x-one".to_string(), "b".to_string()),
        ])
        .unwrap();
        assert_eq!(map.get("x-one").unwrap(), "b");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_header_map_rejects_bad_names() {
        assert_eq!(
            header_map(&[("bad name".to_string(), "v".to_string())]).err(),
            Some(Error::invalid("headers", "bad name"))
        );
    }

    #[tokio::test]
    async fn test_spawned_validation_failure_resolves_once() {
        let dir = tempfile::tempdir().unwrap();
        let courier = Courier::builder()
            .config(CourierConfig::rooted_at(dir.path()))
            .cancellation_broker(Arc::new(CancellationBroker::new()))
            .build()
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        courier
            .spawn_fetch_blob(json!({"taskId": "t"}), move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap().err(), Some(Error::no_key("url")));
    }

    #[tokio::test]
    async fn test_panicking_worker_maps_to_unexpected_error() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        dispatch(
            async {
                if true {
                    panic!("worker blew up");
                }
                Ok(())
            },
            move |result: Result<()>| {
                let _ = tx.send(result);
            },
        )
        .await
        .unwrap();

        let error = rx.await.unwrap().unwrap_err();
        assert_eq!(error.code(), crate::error::ERROR_UNEXPECTED_ERROR);
    }

    #[tokio::test]
    async fn test_aborting_dispatch_drops_the_work() {
        struct Signal(Option<tokio::sync::oneshot::Sender<()>>);

        impl Drop for Signal {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();
        let (resolved_tx, resolved_rx) = tokio::sync::oneshot::channel::<Result<()>>();

        let signal = Signal(Some(dropped_tx));
        let handle = dispatch(
            async move {
                let _signal = signal;
                std::future::pending::<()>().await;
                Ok(())
            },
            move |result| {
                let _ = resolved_tx.send(result);
            },
        );

        tokio::task::yield_now().await;
        handle.abort();

        dropped_rx.await.unwrap();
        assert!(resolved_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_ok() {
        let courier = Courier::builder()
            .cancellation_broker(Arc::new(CancellationBroker::new()))
            .build()
            .unwrap();

        courier.cancel_request(&json!({"taskId": "ghost"})).await.unwrap();
        assert_eq!(
            courier.cancel_request(&json!({})).await.err(),
            Some(Error::no_key("taskId"))
        );
    }
}
