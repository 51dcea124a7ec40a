//! Defines routes for bucket, directory, object and multipart operations.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `PUT    /{bucket}` — create bucket
//!   - `DELETE /{bucket}` — delete bucket
//!   - `GET    /{bucket}` — list root directory, `?uploads` for open uploads
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` — upload object, write chunk, upload part, mkdir
//!   - `POST   /{bucket}/{*key}` — start or complete multipart upload, move/rename
//!   - `GET    /{bucket}/{*key}` — download object, list directory or parts
//!   - `HEAD   /{bucket}/{*key}` — retrieve metadata only
//!   - `DELETE /{bucket}/{*key}` — delete object, rmdir, abort upload
//!
//! Keys ending in `/` address directories.

use crate::{
    handlers::{
        bucket_handlers::{create_bucket, delete_bucket, get_bucket},
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, head_object, post_object, put_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Build the router. Handlers share one `StorageService` state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(put_object)
                .post(post_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(get_bucket).put(create_bucket).delete(delete_bucket),
        )
        // Body sizes are bounded per operation by the engine limits.
        .layer(DefaultBodyLimit::disable())
}
