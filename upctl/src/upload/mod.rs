//! The upload handler: validate one upload, persist it, report the outcome.
//!
//! This module is deliberately free of HTTP framework types. The HTTP layer turns whatever it
//! received into an [`UploadRequest`], calls [`UploadHandler::handle`], and serializes the
//! returned [`UploadResult`]. That keeps the whole contract testable with plain data.
//!
//! Every invocation is independent and goes
//! `Received -> Validated -> Stored -> Succeeded`, or ends in a failure at whichever step went
//! wrong. Failures come back as data; [`UploadHandler::handle`] never returns an error or
//! propagates a panic.

mod key;

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use tracing::instrument;

use crate::config::Config;
use crate::storage::{DEFAULT_CONTENT_TYPE, FileStorage, FileStorageRequest, StorageError};

pub use key::{MAX_FILENAME_LEN, StoredObjectKey, sanitize_filename};

/// One inbound upload, as delivered by the routing layer.
///
/// Header names are expected in lower case; lookups through [`UploadRequest::header`] lower-case
/// the requested name.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    /// The body is base64 text that must be decoded before storing
    pub is_base64_encoded: bool,
    pub path: String,
    pub query: HashMap<String, String>,
}

impl UploadRequest {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn base64_encoded(mut self) -> Self {
        self.is_base64_encoded = true;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Filename suggested by the client: `?filename=`, then `x-file-name`, then the `filename`
    /// parameter of `content-disposition`
    pub fn filename_hint(&self) -> Option<&str> {
        self.query
            .get("filename")
            .map(String::as_str)
            .or_else(|| self.header("x-file-name"))
            .or_else(|| self.header("content-disposition").and_then(disposition_filename))
            .filter(|name| !name.trim().is_empty())
    }

    /// Length announced in `content-length`, if present and numeric
    pub fn declared_content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|value| value.trim().parse().ok())
    }
}

/// Extract `filename="..."` from a `content-disposition` value
fn disposition_filename(value: &str) -> Option<&str> {
    value
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("filename="))
        .map(|name| name.trim().trim_matches('"'))
        .next()
}

/// Failure categories an upload can end in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadErrorKind {
    /// Missing, empty, malformed or oversized body. Not worth retrying unchanged.
    ValidationError,
    /// The object store rejected or failed the write. Safe to retry.
    StorageError,
    /// Unexpected fault inside the handler
    InternalError,
}

impl fmt::Display for UploadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadErrorKind::ValidationError => "ValidationError",
            UploadErrorKind::StorageError => "StorageError",
            UploadErrorKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Outcome of one upload. Exactly one of success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Success { key: StoredObjectKey, size: u64 },
    Failure { kind: UploadErrorKind, message: String },
}

impl UploadResult {
    pub fn failure(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        UploadResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadResult::Success { .. })
    }

    pub fn error_kind(&self) -> Option<UploadErrorKind> {
        match self {
            UploadResult::Success { .. } => None,
            UploadResult::Failure { kind, .. } => Some(*kind),
        }
    }

    /// HTTP status this outcome maps to
    pub fn status_code(&self) -> u16 {
        match self {
            UploadResult::Success { .. } => 200,
            UploadResult::Failure { kind, .. } => match kind {
                UploadErrorKind::ValidationError => 400,
                UploadErrorKind::StorageError => 502,
                UploadErrorKind::InternalError => 500,
            },
        }
    }

    /// Client-facing error string, e.g. `ValidationError: empty body`
    pub fn error_message(&self) -> Option<String> {
        match self {
            UploadResult::Success { .. } => None,
            UploadResult::Failure { kind, message } => Some(format!("{kind}: {message}")),
        }
    }
}

/// Surrounding whitespace tolerated on a base64 body (trailing newlines, CRLF)
const BASE64_WHITESPACE_ALLOWANCE: u64 = 16;

/// Tunables for the upload handler, resolved from [`Config`] at startup
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Largest accepted (decoded) body, in bytes
    pub max_file_size: u64,
    /// Prepended to every generated key
    pub key_prefix: String,
    /// Upper bound on a single store write
    pub put_timeout: Duration,
}

impl UploadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_size: config.limits.files.max_file_size,
            key_prefix: config.storage.key_prefix.clone(),
            put_timeout: config.storage.put_timeout,
        }
    }

    /// Largest body worth reading off the wire: base64 inflates content by 4/3 and may be
    /// wrapped in whitespace that decoding trims
    pub fn max_body_len(&self, is_base64_encoded: bool) -> u64 {
        if is_base64_encoded {
            self.max_file_size
                .div_ceil(3)
                .saturating_mul(4)
                .saturating_add(BASE64_WHITESPACE_ALLOWANCE)
        } else {
            self.max_file_size
        }
    }
}

/// Why an upload stopped before succeeding
enum Rejection {
    Validation(String),
    Storage(StorageError),
}

/// Validates uploads and writes them to the configured object store.
///
/// Cheap to clone; all clones share the same storage handle.
#[derive(Clone)]
pub struct UploadHandler {
    storage: Arc<dyn FileStorage>,
    settings: UploadSettings,
}

impl UploadHandler {
    pub fn new(storage: Arc<dyn FileStorage>, settings: UploadSettings) -> Self {
        Self { storage, settings }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Process one upload end to end.
    ///
    /// Never fails: validation problems, storage failures and panics inside the handler are all
    /// converted into [`UploadResult::Failure`].
    #[instrument(skip_all, fields(path = %request.path, filename = request.filename_hint()))]
    pub async fn handle(&self, request: UploadRequest) -> UploadResult {
        tracing::info!(
            declared_length = request.declared_content_length(),
            base64 = request.is_base64_encoded,
            "Received upload request"
        );

        match AssertUnwindSafe(self.process(request)).catch_unwind().await {
            Ok(Ok((key, size))) => {
                tracing::info!(key = %key, size, "Upload stored");
                UploadResult::Success { key, size }
            }
            Ok(Err(Rejection::Validation(message))) => {
                tracing::debug!(reason = %message, "Upload rejected");
                UploadResult::failure(UploadErrorKind::ValidationError, message)
            }
            Ok(Err(Rejection::Storage(err))) => {
                tracing::warn!(error = %err, "Upload could not be stored");
                UploadResult::failure(UploadErrorKind::StorageError, err.user_message())
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                tracing::error!(panic = %detail, "Upload handler panicked");
                UploadResult::failure(UploadErrorKind::InternalError, "internal error")
            }
        }
    }

    async fn process(&self, request: UploadRequest) -> Result<(StoredObjectKey, u64), Rejection> {
        let max_file_size = self.settings.max_file_size;

        // Fail fast on an announced size before touching the body
        if let Some(declared) = request.declared_content_length()
            && declared > self.settings.max_body_len(request.is_base64_encoded)
        {
            return Err(too_large(declared, max_file_size));
        }

        let content = match &request.body {
            None => return Err(Rejection::Validation("missing body".to_string())),
            Some(body) if request.is_base64_encoded => decode_base64(body)?,
            Some(body) => body.clone(),
        };

        if content.is_empty() {
            return Err(Rejection::Validation("empty body".to_string()));
        }

        let size = content.len() as u64;
        if size > max_file_size {
            return Err(too_large(size, max_file_size));
        }

        let filename_hint = request.filename_hint();
        let key = StoredObjectKey::generate(&self.settings.key_prefix, filename_hint);
        let content_type = resolve_content_type(request.header("content-type"), filename_hint);

        tracing::debug!(key = %key, size, content_type = %content_type, "Writing upload to storage");

        let store = self.storage.store(FileStorageRequest {
            key: key.to_string(),
            content,
            content_type,
        });

        match tokio::time::timeout(self.settings.put_timeout, store).await {
            Ok(Ok(())) => Ok((key, size)),
            Ok(Err(err)) => Err(Rejection::Storage(err)),
            // A write already handed to the backend (a blocking rename, an in-flight PUT) may
            // still land after this; the object is then orphaned under a key the client never sees
            Err(_) => Err(Rejection::Storage(StorageError::Timeout {
                message: format!("write did not finish within {:?}", self.settings.put_timeout),
            })),
        }
    }
}

fn too_large(size: u64, max_file_size: u64) -> Rejection {
    Rejection::Validation(format!("body of {size} bytes exceeds maximum of {max_file_size} bytes"))
}

fn decode_base64(body: &[u8]) -> Result<Bytes, Rejection> {
    base64::engine::general_purpose::STANDARD
        .decode(body.trim_ascii())
        .map(Bytes::from)
        .map_err(|e| Rejection::Validation(format!("malformed base64 body: {e}")))
}

/// Declared type if the client sent one, otherwise a guess from the filename extension
fn resolve_content_type(declared: Option<&str>, filename_hint: Option<&str>) -> String {
    if let Some(declared) = declared.map(str::trim).filter(|value| !value.is_empty()) {
        return declared.to_string();
    }

    filename_hint
        .and_then(|name| mime_guess::from_path(name).first_raw())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}
