//! OpenAPI documentation, served as JSON at `/api-docs/openapi.json` and rendered at `/docs`.

use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "upctl",
        description = "Accepts files over HTTP and persists them to durable object storage."
    ),
    paths(api::handlers::files::upload_file),
    components(schemas(api::models::files::FileUploadResponse, api::models::files::UploadErrorResponse)),
    tags(
        (name = "files", description = "Upload files. Each successful upload is stored under a new, never reused key.")
    )
)]
pub struct ApiDoc;
