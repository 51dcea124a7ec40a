//! HTTP handlers for object and directory operations.
//!
//! Object bodies are streamed in both directions: uploads are cut into
//! blocks and written through a `WriteSession`, downloads are read back in
//! blocks of at most the engine's read limit.

use crate::{
    errors::{AppError, HarborError},
    handlers::{ObjectQuery, caller, collect_body, header_str, multipart_handlers, quoted},
    models::{bucket::Bucket, object::Node},
    services::{bucket::Access, storage_service::StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

pub const OFFSET_HEADER: &str = "x-harbor-offset";
pub const RESET_HEADER: &str = "x-harbor-reset";
pub const CREATED_HEADER: &str = "x-harbor-created";

/// Block size for streaming uploads.
const UPLOAD_BLOCK: usize = 4 * 1024 * 1024;
const DEFAULT_LIST_LIMIT: i64 = 100;

/// JSON view of a node for the non-S3 endpoints.
#[derive(Debug, Serialize)]
pub struct NodeView {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub download_count: i64,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            path: node.full_path.clone(),
            is_dir: node.is_dir(),
            size: node.size(),
            etag: (!node.content_hash.is_empty()).then(|| node.content_hash.clone()),
            created_at: node.created_at,
            modified_at: node.modified_at,
            download_count: node.download_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListingView {
    pub path: String,
    pub total: i64,
    pub offset: i64,
    pub entries: Vec<NodeView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkView {
    #[serde(flatten)]
    pub node: NodeView,
    pub created: bool,
}

fn is_dir_key(key: &str) -> bool {
    key.ends_with('/')
}

async fn bucket_for(
    service: &StorageService,
    bucket: &str,
    headers: &HeaderMap,
    access: Access,
) -> Result<Bucket, AppError> {
    Ok(service
        .buckets()
        .resolve(bucket, caller(headers)?, access)
        .await?)
}

/// PUT `/{bucket}/{*key}`
pub async fn put_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let bucket = bucket_for(&service, &bucket, &headers, Access::Write).await?;

    match (q.part_number, q.upload_id.as_deref()) {
        (Some(part_number), Some(upload_id)) => {
            return multipart_handlers::upload_part(
                &service,
                &bucket,
                &key,
                upload_id,
                part_number,
                body,
            )
            .await;
        }
        (None, None) => {}
        _ => {
            return Err(AppError::bad_request(
                "partNumber and uploadId must be given together",
            ));
        }
    }

    if is_dir_key(&key) {
        let dir = service.directories().mkdir(&bucket, &key).await?;
        return Ok((StatusCode::CREATED, Json(NodeView::from(&dir))).into_response());
    }

    if let Some(raw) = header_str(&headers, OFFSET_HEADER) {
        let offset = raw
            .parse::<u64>()
            .map_err(|_| AppError::bad_request(format!("invalid {} header", OFFSET_HEADER)))?;
        let reset = header_str(&headers, RESET_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let data = collect_body(body, service.limits.max_part_size).await?;
        let outcome = service
            .writer()
            .write_chunk(&bucket, &key, offset, &data, reset)
            .await?;
        let view = ChunkView {
            node: NodeView::from(&outcome.node),
            created: outcome.created,
        };
        return Ok(Json(view).into_response());
    }

    let node = stream_upload(&service, &bucket, &key, body).await?;
    let mut response = Response::new(Body::empty());
    set_node_headers(response.headers_mut(), &node, 0);
    response.headers_mut().remove(header::CONTENT_LENGTH);
    Ok(response)
}

/// Write a whole request body into `key`, replacing previous content.
async fn stream_upload(
    service: &StorageService,
    bucket: &Bucket,
    key: &str,
    body: Body,
) -> Result<Node, AppError> {
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let mut reader = Box::pin(StreamReader::new(stream));
    let mut session = service.writer().open_session(bucket, key).await?;

    let mut offset = 0u64;
    loop {
        let block = match read_block(&mut reader, UPLOAD_BLOCK).await {
            Ok(block) => block,
            Err(err) => {
                session.abort().await?;
                return Err(AppError::bad_request(format!("reading request body: {}", err)));
            }
        };
        if block.is_empty() {
            break;
        }
        if let Err(err) = session.write_next(offset, &block).await {
            session.abort().await?;
            return Err(err.into());
        }
        offset += block.len() as u64;
    }
    Ok(session.finish().await?)
}

/// Fill up to `size` bytes; shorter only at end of input.
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> io::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(size);
    while buf.len() < size {
        if reader.read_buf(&mut buf).await? == 0 {
            break;
        }
    }
    Ok(buf)
}

/// POST `/{bucket}/{*key}`
pub async fn post_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let bucket = bucket_for(&service, &bucket, &headers, Access::Write).await?;

    if q.uploads.is_some() {
        let acl = header_str(&headers, "x-amz-acl");
        return multipart_handlers::create_upload(&service, &bucket, &key, acl).await;
    }
    if let Some(upload_id) = q.upload_id.as_deref() {
        return multipart_handlers::complete_upload(&service, &bucket, &key, upload_id, body).await;
    }
    if q.move_to.is_some() || q.rename.is_some() {
        let dirs = service.directories();
        let node = dirs
            .get_by_path(&bucket, &key)
            .await?
            .ok_or_else(|| HarborError::NoSuchKey(key.clone()))?;
        let moved = dirs
            .move_or_rename(&bucket, &node, q.move_to.as_deref(), q.rename.as_deref())
            .await?;
        return Ok(Json(NodeView::from(&moved)).into_response());
    }
    Err(AppError::bad_request(
        "expected one of ?uploads, ?uploadId, ?move_to or ?rename",
    ))
}

/// GET `/{bucket}/{*key}`
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let bucket = bucket_for(&service, &bucket, &headers, Access::Read).await?;

    if let Some(upload_id) = q.upload_id.as_deref() {
        return multipart_handlers::list_parts(
            &service,
            &bucket,
            &key,
            upload_id,
            q.part_number_marker.unwrap_or(0),
            q.max_parts.unwrap_or(1000),
        )
        .await;
    }
    if is_dir_key(&key) {
        return list_directory(&service, &bucket, &key, &q).await;
    }

    let node = service.metadata().get_file(&bucket, &key).await?;
    let size = node.size();
    let (start, end, partial) = match header_str(&headers, header::RANGE.as_str()) {
        Some(raw) => {
            let (start, end) = parse_range(raw, size)?;
            (start, end, true)
        }
        None => (0, size, false),
    };

    let writer = service.writer();
    let block = service.limits.max_read_size.max(1);
    let node_for_body = node.clone();
    let body = stream::try_unfold(start, move |pos| {
        let writer = writer.clone();
        let bucket = bucket.clone();
        let node = node_for_body.clone();
        async move {
            if pos >= end {
                return Ok::<_, io::Error>(None);
            }
            let bytes = writer
                .read_range(&bucket, &node, pos, (end - pos).min(block))
                .await
                .map_err(io::Error::other)?;
            if bytes.is_empty() {
                return Ok(None);
            }
            let next = pos + bytes.len() as u64;
            Ok(Some((bytes, next)))
        }
    });

    let mut response = Response::new(Body::from_stream(body));
    set_node_headers(response.headers_mut(), &node, end - start);
    if partial {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        let range = format!("bytes {}-{}/{}", start, end.saturating_sub(1), size);
        if let Ok(value) = HeaderValue::from_str(&range) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

/// HEAD `/{bucket}/{*key}` — same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let bucket = bucket_for(&service, &bucket, &headers, Access::Read).await?;
    let node = service.metadata().get_file(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    set_node_headers(response.headers_mut(), &node, node.size());
    Ok(response)
}

/// DELETE `/{bucket}/{*key}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let bucket = bucket_for(&service, &bucket, &headers, Access::Write).await?;

    if let Some(upload_id) = q.upload_id.as_deref() {
        return multipart_handlers::abort_upload(&service, &bucket, &key, upload_id).await;
    }
    if is_dir_key(&key) {
        service.directories().rmdir(&bucket, &key).await?;
        return Ok(StatusCode::NO_CONTENT);
    }
    let metadata = service.metadata();
    let node = metadata.get_file(&bucket, &key).await?;
    metadata.delete(&bucket, &node).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// One page of a directory as JSON. The continuation token, when given,
/// takes precedence over `offset`.
pub async fn list_directory(
    service: &StorageService,
    bucket: &Bucket,
    dir_path: &str,
    q: &ObjectQuery,
) -> Result<Response, AppError> {
    let offset = match q.continuation_token.as_deref() {
        Some(token) => decode_continuation_token(token)
            .ok_or_else(|| AppError::bad_request("invalid continuation-token"))?,
        None => q.offset.unwrap_or(0).max(0),
    };
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000);

    let listing = service
        .directories()
        .list_dir(bucket, dir_path, offset, limit)
        .await?;
    let next = offset + listing.entries.len() as i64;
    let view = ListingView {
        path: dir_path.trim_matches('/').to_string(),
        total: listing.total,
        offset,
        next_continuation_token: (next < listing.total).then(|| encode_continuation_token(next)),
        entries: listing.entries.iter().map(NodeView::from).collect(),
    };
    Ok(Json(view).into_response())
}

fn set_node_headers(headers: &mut HeaderMap, node: &Node, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if !node.content_hash.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&quoted(&node.content_hash)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&node.modified_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&node.created_at.to_rfc3339()) {
        headers.insert(CREATED_HEADER, value);
    }
}

/// Parse a single `bytes=` range into a half-open `[start, end)` within
/// `size`.
fn parse_range(raw: &str, size: u64) -> Result<(u64, u64), AppError> {
    let unsatisfiable = || AppError {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        code: "InvalidRange",
        message: format!("range `{}` cannot be satisfied for {} bytes", raw, size),
    };
    let spec = raw
        .strip_prefix("bytes=")
        .filter(|s| !s.contains(','))
        .ok_or_else(|| AppError::bad_request(format!("unsupported range `{}`", raw)))?;
    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| AppError::bad_request(format!("malformed range `{}`", raw)))?;
    let number = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| AppError::bad_request(format!("malformed range `{}`", raw)))
    };

    match (first.trim(), last.trim()) {
        ("", "") => Err(AppError::bad_request(format!("malformed range `{}`", raw))),
        ("", suffix) => {
            let n = number(suffix)?;
            if n == 0 || size == 0 {
                return Err(unsatisfiable());
            }
            Ok((size.saturating_sub(n), size))
        }
        (start, "") => {
            let start = number(start)?;
            if start >= size {
                return Err(unsatisfiable());
            }
            Ok((start, size))
        }
        (start, end) => {
            let (start, end) = (number(start)?, number(end)?);
            if start > end {
                return Err(AppError::bad_request(format!("malformed range `{}`", raw)));
            }
            if start >= size {
                return Err(unsatisfiable());
            }
            Ok((start, end.saturating_add(1).min(size)))
        }
    }
}

fn encode_continuation_token(offset: i64) -> String {
    general_purpose::STANDARD.encode(offset.to_string())
}

fn decode_continuation_token(token: &str) -> Option<i64> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|offset| *offset >= 0)
}
