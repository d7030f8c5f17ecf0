//! Streaming request bodies: multipart framing and raw single-file bodies

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt, future};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::io::ReaderStream;

use crate::params::{Part, PartPayload};
use crate::progress::ProgressNotifier;
use crate::{Error, Result};

static BOUNDARY_COUNTER: AtomicU64 = AtomicU64::new(0);

enum Segment {
    Bytes(Bytes),
    File(PathBuf),
}

/// A request body assembled from in-memory chunks and files streamed from disk
///
/// The length is computed up front from file metadata so `Content-Length`
/// can be sent and progress can report a known total.
pub struct StreamingBody {
    segments: Vec<Segment>,
    content_type: String,
    content_length: u64,
}

impl StreamingBody {
    /// Frame `parts` as `multipart/form-data`, in declaration order
    pub async fn multipart(parts: &[Part]) -> Result<Self> {
        let boundary = generate_boundary();
        let mut segments = Vec::with_capacity(parts.len() * 2 + 1);
        let mut content_length = 0u64;

        for (index, part) in parts.iter().enumerate() {
            let mut head = String::new();
            if index > 0 {
                head.push_str("\r\n");
            }
            head.push_str(&format!("--{}\r\n", boundary));

            match &part.payload {
                PartPayload::String(value) => {
                    head.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        quote(&part.name)
                    ));
                    head.push_str(value);
                    push_bytes(&mut segments, &mut content_length, head);
                }
                PartPayload::File(file) => {
                    let len = file_len(&file.absolute_file_path).await?;
                    head.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                        quote(&part.name),
                        quote(&file.filename)
                    ));
                    head.push_str(&format!("Content-Type: {}\r\n", file.mime_type));
                    head.push_str(&format!("Content-Length: {}\r\n\r\n", len));
                    push_bytes(&mut segments, &mut content_length, head);

                    segments.push(Segment::File(file.absolute_file_path.clone()));
                    content_length += len;
                }
            }
        }

        push_bytes(
            &mut segments,
            &mut content_length,
            format!("\r\n--{}--\r\n", boundary),
        );

        Ok(Self {
            segments,
            content_type: format!("multipart/form-data; boundary={}", boundary),
            content_length,
        })
    }

    /// Stream a single file as the whole body
    pub async fn file(path: &Path, mime_type: &str) -> Result<Self> {
        let content_length = file_len(path).await?;
        Ok(Self {
            segments: vec![Segment::File(path.to_path_buf())],
            content_type: mime_type.to_string(),
            content_length,
        })
    }

    /// Value for the `Content-Type` header
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Exact number of bytes the body will produce
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Byte stream that reports cumulative bytes handed to the transport
    pub(crate) fn into_stream(
        self,
        notifier: Arc<ProgressNotifier>,
    ) -> BoxStream<'static, std::io::Result<Bytes>> {
        let total = self.content_length;
        let mut written = 0u64;

        stream::iter(self.segments)
            .map(segment_stream)
            .flatten()
            .inspect_ok(move |chunk| {
                written += chunk.len() as u64;
                notifier.notify(written, Some(total));
            })
            .boxed()
    }

    pub(crate) fn into_reqwest_body(self, notifier: Arc<ProgressNotifier>) -> reqwest::Body {
        reqwest::Body::wrap_stream(self.into_stream(notifier))
    }
}

fn segment_stream(segment: Segment) -> BoxStream<'static, std::io::Result<Bytes>> {
    match segment {
        Segment::Bytes(bytes) => stream::once(future::ready(Ok(bytes))).boxed(),
        Segment::File(path) => stream::once(tokio::fs::File::open(path))
            .map_ok(ReaderStream::new)
            .try_flatten()
            .boxed(),
    }
}

fn push_bytes(segments: &mut Vec<Segment>, content_length: &mut u64, text: String) {
    *content_length += text.len() as u64;
    segments.push(Segment::Bytes(Bytes::from(text)));
}

async fn file_len(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::exception(format!("Failed to read {}: {}", path.display(), e)))?;

    if !metadata.is_file() {
        return Err(Error::exception(format!("{} is not a file", path.display())));
    }

    Ok(metadata.len())
}

/// Header parameter values may not carry quotes or line breaks
fn quote(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn generate_boundary() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let sequence = BOUNDARY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("----BlobCourierBoundary{:x}{:x}", timestamp, sequence)
}
