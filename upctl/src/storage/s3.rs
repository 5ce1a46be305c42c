use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::{http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
};
use bytes::Bytes;

use super::{FileStorage, FileStorageRequest, Result, StorageError};

/// S3 storage backend. Works against AWS S3 and S3-compatible stores (MinIO, R2, ...).
///
/// `PutObject` creates objects atomically, so an interrupted upload never becomes visible.
/// SDK-level retries are disabled: a failed write is reported straight back and the client
/// decides whether to try again.
pub struct S3FileStorage {
    client: Client,
    bucket: String,
}

impl S3FileStorage {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS environment (credentials chain, `AWS_REGION`, ...)
    ///
    /// `region` and `endpoint_url` override what the environment provides. Path-style
    /// addressing is needed by most self-hosted S3-compatible stores.
    pub async fn from_env(bucket: &str, region: Option<String>, endpoint_url: Option<String>, force_path_style: bool) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint_url) = endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let shared_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(force_path_style)
            .retry_config(RetryConfig::disabled())
            .build();

        Self::new(Client::from_conf(s3_config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl FileStorage for S3FileStorage {
    async fn store(&self, request: FileStorageRequest) -> Result<()> {
        let size = request.content.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .content_length(size as i64)
            .body(ByteStream::from(request.content))
            .send()
            .await
            .map_err(classify_sdk_error)?;

        tracing::debug!(bucket = %self.bucket, key = %request.key, size, "Stored object in S3");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let content = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable {
                message: format!("failed to read object body: {e}"),
            })?;

        Ok(content.into_bytes())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) => match classify_sdk_error(err) {
                StorageError::NotFound => Ok(false),
                other => Err(other),
            },
        }
    }
}

/// Error codes S3 (and compatible stores) use for authorization failures
const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AllAccessDisabled",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
];

/// Error codes that mean the write would exceed some limit
const QUOTA_CODES: &[&str] = &["QuotaExceeded", "ServiceQuotaExceeded", "EntityTooLarge", "XMinioStorageFull"];

/// Error codes that indicate a transient condition on the store side
const UNAVAILABLE_CODES: &[&str] = &["SlowDown", "ServiceUnavailable", "InternalError", "RequestTimeout"];

/// Map an SDK failure onto the storage error categories
fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    tracing::debug!(error = %DisplayErrorContext(&err), "S3 request failed");

    let service_failure = match &err {
        SdkError::TimeoutError(_) => {
            return StorageError::Timeout {
                message: "request to object store timed out".to_string(),
            };
        }
        SdkError::DispatchFailure(_) => {
            return StorageError::Unavailable {
                message: "could not reach object store".to_string(),
            };
        }
        SdkError::ResponseError(_) => {
            return StorageError::Unavailable {
                message: "object store sent an unreadable response".to_string(),
            };
        }
        SdkError::ServiceError(service) => Some((service.raw().status().as_u16(), service.err().code().map(str::to_string))),
        _ => None,
    };

    let Some((status, code)) = service_failure else {
        return StorageError::Other(anyhow::Error::new(err));
    };

    let code_is = |codes: &[&str]| code.as_deref().is_some_and(|c| codes.contains(&c));
    let label = code.clone().unwrap_or_else(|| format!("HTTP {status}"));

    if code_is(PERMISSION_CODES) || status == 403 {
        StorageError::PermissionDenied { message: label }
    } else if code_is(QUOTA_CODES) {
        StorageError::QuotaExceeded { message: label }
    } else if code.as_deref() == Some("NoSuchBucket") {
        StorageError::Unavailable {
            message: "bucket does not exist".to_string(),
        }
    } else if code.as_deref() == Some("NoSuchKey") || status == 404 {
        StorageError::NotFound
    } else if code_is(UNAVAILABLE_CODES) || status >= 500 {
        StorageError::Unavailable { message: label }
    } else {
        StorageError::Other(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::Credentials;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage_for(endpoint_url: &str) -> S3FileStorage {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test-access-key", "test-secret-key", None, None, "test"))
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .build();

        S3FileStorage::new(Client::from_conf(config), "test-bucket")
    }

    fn s3_error(status: u16, code: &str) -> ResponseTemplate {
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Error><Code>{code}</Code><Message>{code}</Message><RequestId>req-1</RequestId></Error>"#
        );
        ResponseTemplate::new(status).set_body_raw(body, "application/xml")
    }

    fn request(key: &str) -> FileStorageRequest {
        FileStorageRequest {
            key: key.to_string(),
            content: Bytes::from_static(b"hello world"),
            content_type: "text/plain".to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_puts_object_into_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/test-bucket/abc-note.txt"))
            .and(header("content-type", "text/plain"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server.uri());
        storage.store(request("abc-note.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_access_denied_is_permission_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(s3_error(403, "AccessDenied"))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server.uri());
        let result = storage.store(request("abc")).await;

        match result {
            Err(StorageError::PermissionDenied { message }) => assert_eq!(message, "AccessDenied"),
            other => panic!("Expected PermissionDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_slow_down_is_unavailable_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(s3_error(503, "SlowDown"))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server.uri());
        let result = storage.store(request("abc")).await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_retrieve_and_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-bucket/present"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = storage_for(&server.uri());
        assert_eq!(&storage.retrieve("present").await.unwrap()[..], b"hello world");
        assert!(storage.exists("present").await.unwrap());
        assert!(!storage.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        // Reserve a free port, then release it so nothing is listening there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let storage = storage_for(&format!("http://{addr}"));
        let result = storage.store(request("abc")).await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
    }
}
