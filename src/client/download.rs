//! Unmanaged fetch: stream the response body straight to the destination file

use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{CourierInner, header_map};
use crate::params::FetchRequest;
use crate::progress::ProgressNotifier;
use crate::response::{FetchResult, ResponseInfo};
use crate::{Error, Result};

pub(crate) async fn fetch_unmanaged(
    inner: &CourierInner,
    request: FetchRequest,
) -> Result<FetchResult> {
    // Registered before the first await so an early cancel is observed
    let registration = inner.broker.register(&request.common.task_id);

    let destination = inner.target_dir(request.target).join(&request.filename);
    let notifier = ProgressNotifier::new(
        request.common.task_id.as_str(),
        request.common.progress_interval,
        inner.sink.clone(),
    );

    // Also covers the caller dropping this future mid-transfer
    let mut partial = PartialFile::new(destination.clone());
    let outcome = tokio::select! {
        biased;
        _ = registration.token().cancelled() => Err(Error::Cancelled),
        result = stream_to_file(inner, &request, &destination, &notifier, &mut partial) => result,
    };
    drop(registration);

    let response = outcome?;
    partial.keep();

    Ok(FetchResult::Unmanaged {
        absolute_file_path: destination,
        response,
    })
}

/// A destination this request created, removed on drop unless kept
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: false }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed partial download {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove partial download {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

async fn stream_to_file(
    inner: &CourierInner,
    request: &FetchRequest,
    destination: &Path,
    notifier: &ProgressNotifier,
    partial: &mut PartialFile,
) -> Result<ResponseInfo> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::exception(format!("Failed to create parent directory: {}", e))
        })?;
    }

    let builder = inner
        .client
        .request(request.common.method.clone(), request.common.url.clone())
        .headers(header_map(&request.common.headers)?);
    let response = inner.apply_timeout(builder).send().await?;

    let info = ResponseInfo::from_parts(response.status(), response.headers());
    let total = response.content_length();

    tracing::debug!(
        "Fetching {} for task {} ({} bytes expected)",
        request.common.url,
        request.common.task_id,
        total.map_or_else(|| "unknown".to_string(), |t| t.to_string())
    );

    // Truncates whatever was at the destination before
    let mut file = tokio::fs::File::create(destination)
        .await
        .map_err(|e| Error::exception(format!("Failed to create file: {}", e)))?;
    partial.arm();

    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::exception(format!("Failed to write to file: {}", e)))?;

        written += chunk.len() as u64;
        notifier.notify(written, total);
    }

    file.flush()
        .await
        .map_err(|e| Error::exception(format!("Failed to flush file: {}", e)))?;

    notifier.complete(written, total);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.bin");
        std::fs::write(&path, b"half").unwrap();

        let mut partial = PartialFile::new(path.clone());
        partial.arm();
        drop(partial);

        assert!(!path.exists());
    }

    #[test]
    fn test_kept_file_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whole.bin");
        std::fs::write(&path, b"whole").unwrap();

        let mut partial = PartialFile::new(path.clone());
        partial.arm();
        partial.keep();

        assert_eq!(std::fs::read(&path).unwrap(), b"whole");
    }

    #[test]
    fn test_unarmed_guard_leaves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.bin");
        std::fs::write(&path, b"keep me").unwrap();

        drop(PartialFile::new(path.clone()));

        assert!(path.exists());
    }
}
