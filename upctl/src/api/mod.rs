//! HTTP layer.
//!
//! - **[`handlers`]**: axum route handlers
//! - **[`models`]**: response bodies and their OpenAPI schemas
//!
//! The only business endpoint is `POST /api/file/upload`. Its handler is a thin adapter: it turns
//! the HTTP request into an [`UploadRequest`](crate::upload::UploadRequest) and hands it to the
//! [`UploadHandler`](crate::upload::UploadHandler), which owns every upload rule.

pub mod handlers;
pub mod models;
