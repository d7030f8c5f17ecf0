//! Multipart uploads and raw single-file sends

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use std::sync::Arc;

use super::{CourierInner, header_map};
use crate::body::StreamingBody;
use crate::params::{Common, SendRequest, UploadRequest};
use crate::progress::ProgressNotifier;
use crate::response::{UploadResponse, UploadResult, flatten_headers};
use crate::{Error, Result};

pub(crate) async fn upload_multipart(
    inner: &CourierInner,
    request: UploadRequest,
) -> Result<UploadResult> {
    let registration = inner.broker.register(&request.common.task_id);

    tokio::select! {
        biased;
        _ = registration.token().cancelled() => Err(Error::Cancelled),
        result = async {
            let body = StreamingBody::multipart(&request.parts).await?;
            execute(inner, &request.common, body, request.return_response).await
        } => result,
    }
}

pub(crate) async fn send_file(inner: &CourierInner, request: SendRequest) -> Result<UploadResult> {
    let registration = inner.broker.register(&request.common.task_id);

    tokio::select! {
        biased;
        _ = registration.token().cancelled() => Err(Error::Cancelled),
        result = async {
            let body = StreamingBody::file(&request.absolute_file_path, &request.mime_type).await?;
            execute(inner, &request.common, body, request.return_response).await
        } => result,
    }
}

async fn execute(
    inner: &CourierInner,
    common: &Common,
    body: StreamingBody,
    return_response: bool,
) -> Result<UploadResult> {
    let content_length = body.content_length();

    let mut headers = header_map(&common.headers)?;
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(body.content_type())
            .map_err(|_| Error::invalid("mimeType", body.content_type()))?,
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));

    let notifier = Arc::new(ProgressNotifier::new(
        common.task_id.as_str(),
        common.progress_interval,
        inner.sink.clone(),
    ));

    tracing::debug!(
        "Uploading {} bytes to {} for task {}",
        content_length,
        common.url,
        common.task_id
    );

    let builder = inner
        .client
        .request(common.method.clone(), common.url.clone())
        .headers(headers)
        .body(body.into_reqwest_body(notifier.clone()));
    let response = inner.apply_timeout(builder).send().await?;

    let code = response.status().as_u16();
    let headers = flatten_headers(response.headers());

    // The body is only read when the caller asked for it
    let data = if return_response {
        response.text().await?
    } else {
        String::new()
    };

    notifier.complete(content_length, Some(content_length));

    Ok(UploadResult {
        response: UploadResponse {
            code,
            data,
            headers,
        },
    })
}
