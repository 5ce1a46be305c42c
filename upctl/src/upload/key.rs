//! Storage key derivation.
//!
//! Keys have the form `<prefix><token>[-<filename>]` where `token` is a fresh UUIDv4 in simple
//! (32 hex chars) form and `filename` is the caller's hint reduced to a safe basename.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest filename suffix kept in a key, in bytes
pub const MAX_FILENAME_LEN: usize = 128;

/// Identifier an uploaded object is persisted under.
///
/// A new key is generated for every upload and never reused, so two uploads can never
/// overwrite each other even when their content and filename are identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredObjectKey(String);

impl StoredObjectKey {
    /// Derive a fresh key from the configured prefix and an optional client filename hint
    pub fn generate(prefix: &str, filename_hint: Option<&str>) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        let suffix = filename_hint.and_then(sanitize_filename);

        let mut key = String::with_capacity(prefix.len() + token.len() + suffix.as_ref().map_or(0, |s| s.len() + 1));
        key.push_str(prefix);
        key.push_str(&token);
        if let Some(suffix) = suffix {
            key.push('-');
            key.push_str(&suffix);
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StoredObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StoredObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reduce a client-supplied filename to something safe to embed in a storage key.
///
/// Only the last path component survives (both `/` and `\` count as separators, `.` and `..`
/// segments are dropped). Characters outside `[A-Za-z0-9._-]` become `_`, runs of dots collapse
/// to one, and leading dots are stripped. Returns `None` when nothing usable is left.
pub fn sanitize_filename(hint: &str) -> Option<String> {
    let basename = hint
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .last()?;

    let mut cleaned = String::with_capacity(basename.len());
    for c in basename.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' };
        if c == '.' && cleaned.ends_with('.') {
            continue;
        }
        cleaned.push(c);
    }

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    // ASCII only at this point, so any byte offset is a char boundary
    Some(trimmed[..trimmed.len().min(MAX_FILENAME_LEN)].to_string())
}
