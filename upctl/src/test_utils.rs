//! Helpers for building test applications.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;

use crate::config::{Config, StorageBackend};
use crate::limits::Limiters;
use crate::storage::{FileStorage, MemoryFileStorage};
use crate::upload::{UploadHandler, UploadSettings};
use crate::{AppState, Application, build_router};

/// Largest body the test configuration accepts
pub const TEST_MAX_FILE_SIZE: u64 = 1024;

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    config.storage.backend = StorageBackend::Memory;
    config.storage.put_timeout = Duration::from_secs(5);
    config.limits.files.max_file_size = TEST_MAX_FILE_SIZE;
    config
}

/// Test server backed by in-memory storage, returned alongside it for inspection
pub async fn create_test_app() -> (TestServer, Arc<MemoryFileStorage>) {
    let storage = Arc::new(MemoryFileStorage::new());
    let server = create_test_app_with_storage(create_test_config(), storage.clone());
    (server, storage)
}

pub fn create_test_app_with_storage(config: Config, storage: Arc<dyn FileStorage>) -> TestServer {
    Application::with_storage(config, storage)
        .expect("Failed to create application")
        .into_test_server()
}

/// State for tests that need to reach into the limiters while requests are served
pub fn create_test_state(config: Config, storage: Arc<dyn FileStorage>) -> AppState {
    AppState::builder()
        .uploads(UploadHandler::new(storage, UploadSettings::from_config(&config)))
        .limiters(Limiters::new(&config.limits))
        .config(config)
        .build()
}

pub fn create_test_server(state: &AppState) -> TestServer {
    let router = build_router(state).expect("Failed to build router");
    TestServer::new(router.into_make_service()).expect("Failed to create test server")
}
