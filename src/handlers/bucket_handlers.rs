//! Bucket-level handlers: create, delete and root listings.

use crate::{
    errors::{AppError, HarborError},
    handlers::{
        ObjectQuery, S3_NS, caller, header_str, multipart_handlers, object_handlers, xml_response,
    },
    models::bucket::AccessPermission,
    services::{bucket::Access, storage_service::StorageService},
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename = "CreateBucketResult")]
struct CreateBucketResultXml {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Location")]
    location: String,
}

pub const ACL_HEADER: &str = "x-harbor-acl";
pub const POOL_HEADER: &str = "x-harbor-pool";

/// PUT `/{bucket}` — create a bucket owned by the caller.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = caller(&headers)?.ok_or(HarborError::AccessDenied)?;
    let permission = match header_str(&headers, ACL_HEADER) {
        None | Some("private") => AccessPermission::Private,
        Some("public") => AccessPermission::Public,
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "{} must be `public` or `private`, got `{}`",
                ACL_HEADER, other
            )));
        }
    };
    let pool = header_str(&headers, POOL_HEADER).unwrap_or(&service.default_pool);

    let created = service
        .buckets()
        .create_bucket(&bucket, owner, permission, pool)
        .await?;

    xml_response(
        StatusCode::OK,
        &CreateBucketResultXml {
            xmlns: S3_NS,
            location: format!("/{}", created.name),
        },
    )
}

/// DELETE `/{bucket}` — tombstone the bucket.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let buckets = service.buckets();
    let bucket = buckets
        .resolve(bucket.as_str(), caller(&headers)?, Access::Write)
        .await?;
    buckets.soft_delete(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/{bucket}` — `?uploads` lists open multipart uploads, otherwise the
/// root directory is listed.
pub async fn get_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let bucket = service
        .buckets()
        .resolve(bucket.as_str(), caller(&headers)?, Access::Read)
        .await?;
    if q.uploads.is_some() {
        return multipart_handlers::list_uploads(&service, &bucket, q.prefix.as_deref()).await;
    }
    object_handlers::list_directory(&service, &bucket, "", &q).await
}
