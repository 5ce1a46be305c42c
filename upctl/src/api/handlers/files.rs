use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Uri},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::AppState;
use crate::api::models::files::{FileUploadResponse, UploadErrorResponse};
use crate::errors::Result;
use crate::upload::{UploadErrorKind, UploadRequest, UploadResult};

#[utoipa::path(
    post,
    path = "/api/file/upload",
    tag = "files",
    summary = "Upload file",
    description = "Store the raw request body as a new object. Every successful upload gets a fresh key; \
        a filename hint, if given, is sanitized and appended to it.",
    params(
        ("filename" = Option<String>, Query, description = "Filename hint, appended to the generated key"),
        ("encoding" = Option<String>, Query, description = "Set to `base64` when the body is base64 text"),
        ("x-file-name" = Option<String>, Header, description = "Filename hint, used when the query parameter is absent"),
        ("content-transfer-encoding" = Option<String>, Header, description = "`base64` marks a base64 body"),
    ),
    request_body(
        content_type = "application/octet-stream",
        description = "File content. The declared content type is stored with the object."
    ),
    responses(
        (status = 200, description = "File stored", body = FileUploadResponse),
        (status = 400, description = "Missing, empty, malformed or oversized body", body = UploadErrorResponse),
        (status = 429, description = "Too many uploads in progress", body = UploadErrorResponse),
        (status = 500, description = "Unexpected failure", body = UploadErrorResponse),
        (status = 502, description = "The object store rejected or failed the write", body = UploadErrorResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<UploadResult> {
    // Held until the response is built so buffered bodies count against the limit
    let _permit = state.limiters.acquire_upload().await?;

    let is_base64_encoded = is_base64_body(&headers, &query);
    let max_body_len = state.uploads.settings().max_body_len(is_base64_encoded);

    let mut request = UploadRequest {
        headers: lowercase_headers(&headers),
        body: None,
        is_base64_encoded,
        path: uri.path().to_string(),
        query,
    };

    // An announced oversize body is rejected by the handler without being read
    let declared_too_large = request.declared_content_length().is_some_and(|len| len > max_body_len);
    if !declared_too_large {
        match read_body(body, max_body_len).await {
            Ok(content) => request.body = Some(content),
            Err(BodyError::TooLarge) => {
                tracing::debug!(max_body_len, "Upload body exceeded limit while streaming");
                return Ok(UploadResult::failure(
                    UploadErrorKind::ValidationError,
                    format!(
                        "body exceeds maximum of {} bytes",
                        state.uploads.settings().max_file_size
                    ),
                ));
            }
            Err(BodyError::Read(e)) => {
                tracing::debug!(error = %e, "Failed to read upload body");
                return Ok(UploadResult::failure(
                    UploadErrorKind::ValidationError,
                    format!("failed to read body: {e}"),
                ));
            }
        }
    }

    Ok(state.uploads.handle(request).await)
}

fn is_base64_body(headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    let header_says = headers
        .get("content-transfer-encoding")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("base64"));
    let query_says = query.get("encoding").is_some_and(|value| value.eq_ignore_ascii_case("base64"));

    header_says || query_says
}

/// Flatten a header map into lower-case names, joining repeated headers with `, `.
/// Values that are not visible ASCII are dropped.
fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

enum BodyError {
    TooLarge,
    Read(axum::Error),
}

/// Buffer the body, giving up as soon as it grows past `limit` bytes
async fn read_body(body: Body, limit: u64) -> std::result::Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if (buffer.len() + chunk.len()) as u64 > limit {
            return Err(BodyError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer.freeze())
}
