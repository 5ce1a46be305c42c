//! # upctl: upload control service
//!
//! `upctl` accepts files over HTTP and persists them to durable object storage. A client
//! `POST`s raw bytes to `/api/file/upload`; the service validates the body, stores it under a
//! freshly generated key and answers with `{"key": ..., "size": ...}`. Failures come back as
//! `{"error": "<Kind>: <message>"}` with a status that tells the client whether retrying makes
//! sense.
//!
//! ## Architecture
//!
//! The HTTP layer is [axum](https://github.com/tokio-rs/axum). Requests flow through:
//!
//! 1. [`limits`]: admission control, rejecting with 429 when too many uploads are in flight
//! 2. [`api::handlers::files`]: converts the HTTP request into a plain [`upload::UploadRequest`]
//! 3. [`upload::UploadHandler`]: validation, key derivation and the store write
//! 4. [`storage`]: the [`storage::FileStorage`] backend chosen at startup (S3, local, memory)
//!
//! The upload handler knows nothing about HTTP, and nothing below the HTTP layer reads the
//! environment: configuration ([`config`]) is resolved once at startup and injected.
//!
//! ## Running
//!
//! ```bash
//! # Local filesystem storage under ./data/uploads
//! upctl
//!
//! # S3 storage, bucket injected by the deployment
//! S3_BUCKET_NAME=my-bucket upctl -f config.yaml
//! ```

pub mod api;
pub mod config;
pub mod errors;
pub mod limits;
pub mod openapi;
pub mod storage;
pub mod telemetry;
#[cfg(test)]
mod test_utils;
pub mod upload;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
};
use bon::Builder;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;

use crate::config::CorsOrigin;
use crate::limits::Limiters;
use crate::openapi::ApiDoc;
use crate::storage::{FileStorage, create_file_storage};
use crate::upload::{UploadHandler, UploadSettings};

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .uploads(handler)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub uploads: UploadHandler,
    #[builder(default)]
    pub limiters: Limiters,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors = &config.cors;

    let allow_origin = if cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::with_capacity(cors.allowed_origins.len());
        for origin in &cors.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                // Browsers send the bare origin, without path or trailing slash
                origins.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let exposed_headers = cors
        .exposed_headers
        .iter()
        .map(|name| name.parse::<HeaderName>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut layer = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(cors.allow_credentials)
        .expose_headers(exposed_headers);

    if let Some(max_age) = cors.max_age {
        layer = layer.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(layer)
}

/// Build the application router: the upload route, health check, API docs, CORS and tracing.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    // The upload adapter enforces its own size limit while streaming the body
    let upload_routes = Router::new()
        .route(
            "/api/file/upload",
            post(api::handlers::files::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(upload_routes)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    let cors_layer = create_cors_layer(&state.config)?;

    Ok(router.layer(cors_layer).layer(TraceLayer::new_for_http()))
}

/// The assembled service: configuration, storage backend and router.
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create the storage backend named in the configuration and wire everything to it
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let storage = create_file_storage(&config.storage.backend).await?;
        Self::with_storage(config, storage)
    }

    /// Wire the application to an already constructed storage backend
    pub fn with_storage(config: Config, storage: Arc<dyn FileStorage>) -> anyhow::Result<Self> {
        let uploads = UploadHandler::new(storage, UploadSettings::from_config(&config));
        let state = AppState::builder()
            .config(config.clone())
            .uploads(uploads)
            .limiters(Limiters::new(&config.limits))
            .build();

        let router = build_router(&state)?;
        Ok(Self { router, config })
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Upload service listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::test_utils::create_test_config;
    use axum::http::{StatusCode, header};

    #[tokio::test]
    async fn test_healthz() {
        let server = Application::new(create_test_config()).await.unwrap().into_test_server();

        let response = server.get("/healthz").await;

        response.assert_status_ok();
        response.assert_text("OK");
    }

    #[tokio::test]
    async fn test_openapi_json_is_served() {
        let server = Application::new(create_test_config()).await.unwrap().into_test_server();

        let response = server.get("/api-docs/openapi.json").await;

        response.assert_status_ok();
        let doc: serde_json::Value = response.json();
        assert!(doc["paths"]["/api/file/upload"]["post"].is_object());
    }

    #[tokio::test]
    async fn test_application_with_local_backend_persists_to_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config();
        config.storage.backend = StorageBackend::Local {
            path: temp_dir.path().to_path_buf(),
        };
        config.storage.key_prefix = "incoming/".to_string();

        let server = Application::new(config).await.unwrap().into_test_server();
        let response = server
            .post("/api/file/upload")
            .add_query_param("filename", "report.csv")
            .bytes(bytes::Bytes::from_static(b"a,b\n1,2\n"))
            .await;

        response.assert_status_ok();
        let body: api::models::files::FileUploadResponse = response.json();
        assert!(body.key.starts_with("incoming/"));
        let on_disk = std::fs::read(temp_dir.path().join(&body.key)).unwrap();
        assert_eq!(on_disk, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_only() {
        let mut config = create_test_config();
        config.cors.allowed_origins = vec![CorsOrigin::Url("https://app.example.com".parse().unwrap())];
        config.cors.allow_credentials = true;
        let server = Application::new(config).await.unwrap().into_test_server();

        let allowed = server
            .get("/healthz")
            .add_header(header::ORIGIN, HeaderValue::from_static("https://app.example.com"))
            .await;
        assert_eq!(allowed.header(header::ACCESS_CONTROL_ALLOW_ORIGIN), "https://app.example.com");
        assert_eq!(allowed.header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS), "true");

        let denied = server
            .get("/healthz")
            .add_header(header::ORIGIN, HeaderValue::from_static("https://evil.example.com"))
            .await;
        assert_eq!(denied.status_code(), StatusCode::OK);
        assert!(denied.maybe_header(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_invalid_exposed_header_is_rejected() {
        let mut config = create_test_config();
        config.cors.exposed_headers = vec!["not a header".to_string()];
        assert!(create_cors_layer(&config).is_err());
    }
}
