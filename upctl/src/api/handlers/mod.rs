//! HTTP request handlers.
//!
//! - [`files`]: file upload

pub mod files;
