use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::upload::UploadResult;

/// Body of a successful upload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileUploadResponse {
    /// Key the file was stored under
    #[schema(example = "3f2b9c0e8d7a4b6c9e1f0a2b3c4d5e6f-note.txt")]
    pub key: String,
    /// Stored size in bytes (after base64 decoding, if any)
    #[schema(example = 11)]
    pub size: u64,
}

/// Body of a failed upload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadErrorResponse {
    /// `<Kind>: <message>`, where kind is `ValidationError`, `StorageError` or `InternalError`
    #[schema(example = "ValidationError: empty body")]
    pub error: String,
}

impl IntoResponse for UploadResult {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match self {
            UploadResult::Success { key, size } => (
                status,
                Json(FileUploadResponse {
                    key: key.into_inner(),
                    size,
                }),
            )
                .into_response(),
            failure => {
                let error = failure.error_message().unwrap_or_default();
                (status, Json(UploadErrorResponse { error })).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{StoredObjectKey, UploadErrorKind};

    #[test]
    fn test_failure_maps_to_status() {
        let cases = [
            (UploadErrorKind::ValidationError, StatusCode::BAD_REQUEST),
            (UploadErrorKind::StorageError, StatusCode::BAD_GATEWAY),
            (UploadErrorKind::InternalError, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (kind, expected) in cases {
            let response = UploadResult::failure(kind, "boom").into_response();
            assert_eq!(response.status(), expected, "{kind}");
        }
    }

    #[test]
    fn test_success_is_ok() {
        let result = UploadResult::Success {
            key: StoredObjectKey::generate("", Some("a.txt")),
            size: 3,
        };
        assert_eq!(result.into_response().status(), StatusCode::OK);
    }
}
