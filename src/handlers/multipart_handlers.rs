//! Multipart upload handlers (S3 wire format).
//!
//! Completion can take long when the parts must be recompacted. When it is
//! still running after the heartbeat idle time the response is committed as
//! 200 and whitespace is streamed until the result (or an `<Error>`
//! document) is ready.

use crate::{
    errors::{AppError, HarborError},
    handlers::{
        S3_NS, XML_DECL, collect_body, error_xml, quoted, render_xml, xml_body, xml_response,
    },
    models::{bucket::Bucket, multipart::CompletedPart},
    services::{multipart::CompletedUpload, storage_service::StorageService},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use chrono::SecondsFormat;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::{future::Future, io, time::Duration};
use tokio::time::timeout;
use tracing::warn;

/// Largest accepted CompleteMultipartUpload document.
const MAX_COMPLETE_BODY: u64 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUploadXml {
    #[serde(rename = "Part", default)]
    parts: Vec<CompletePartXml>,
}

#[derive(Debug, Deserialize)]
struct CompletePartXml {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
struct InitiateMultipartUploadResultXml<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: &'a str,
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "UploadId")]
    upload_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
struct CompleteMultipartUploadResultXml {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Location")]
    location: String,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListPartsResult")]
struct ListPartsResultXml<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: &'a str,
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "UploadId")]
    upload_id: &'a str,
    #[serde(rename = "PartNumberMarker")]
    part_number_marker: u32,
    #[serde(rename = "NextPartNumberMarker", skip_serializing_if = "Option::is_none")]
    next_part_number_marker: Option<u32>,
    #[serde(rename = "MaxParts")]
    max_parts: u32,
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
    #[serde(rename = "Part", default)]
    parts: Vec<PartXml>,
}

#[derive(Debug, Serialize)]
struct PartXml {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "LastModified")]
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Size")]
    size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListMultipartUploadsResult")]
struct ListMultipartUploadsResultXml<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: &'a str,
    #[serde(rename = "Prefix")]
    prefix: &'a str,
    #[serde(rename = "Upload", default)]
    uploads: Vec<MultipartUploadXml<'a>>,
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
}

#[derive(Debug, Serialize)]
struct MultipartUploadXml<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "UploadId")]
    upload_id: &'a str,
    #[serde(rename = "Initiated")]
    initiated: String,
}

fn parse_complete_body(body: &[u8]) -> Result<Vec<CompletedPart>, HarborError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| HarborError::InvalidRequest("body is not valid UTF-8".into()))?;
    let doc: CompleteMultipartUploadXml = quick_xml::de::from_str(text)
        .map_err(|err| HarborError::InvalidRequest(format!("malformed XML: {}", err)))?;
    Ok(doc
        .parts
        .into_iter()
        .map(|p| CompletedPart {
            part_number: p.part_number,
            etag: p.etag,
        })
        .collect())
}

/// POST `/{bucket}/{*key}?uploads`
pub async fn create_upload(
    service: &StorageService,
    bucket: &Bucket,
    key: &str,
    acl: Option<&str>,
) -> Result<Response, AppError> {
    let upload = service.multipart().create(bucket, key, acl).await?;
    xml_response(
        StatusCode::OK,
        &InitiateMultipartUploadResultXml {
            xmlns: S3_NS,
            bucket: &bucket.name,
            key: &upload.object_key,
            upload_id: &upload.id,
        },
    )
}

/// PUT `/{bucket}/{*key}?partNumber=N&uploadId=U`
pub async fn upload_part(
    service: &StorageService,
    bucket: &Bucket,
    key: &str,
    upload_id: &str,
    part_number: u32,
    body: Body,
) -> Result<Response, AppError> {
    let data = collect_body(body, service.limits.max_part_size).await?;
    let part = service
        .multipart()
        .upload_part(bucket, upload_id, key, part_number, &data)
        .await?;

    let mut response = Response::new(Body::empty());
    if let Ok(value) = HeaderValue::from_str(&quoted(&part.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// POST `/{bucket}/{*key}?uploadId=U`
pub async fn complete_upload(
    service: &StorageService,
    bucket: &Bucket,
    key: &str,
    upload_id: &str,
    body: Body,
) -> Result<Response, AppError> {
    let raw = collect_body(body, MAX_COMPLETE_BODY).await?;
    let declared = parse_complete_body(&raw)?;

    let coordinator = service.multipart();
    let bucket_owned = bucket.clone();
    let key_owned = key.to_string();
    let upload_id = upload_id.to_string();
    let work = async move {
        coordinator
            .complete(&bucket_owned, &upload_id, &key_owned, &declared)
            .await
            .map_err(AppError::from)
            .and_then(|done| complete_result_xml(&bucket_owned.name, &done))
    };
    with_heartbeat(work, service.heartbeat_idle).await
}

fn complete_result_xml(bucket: &str, done: &CompletedUpload) -> Result<String, AppError> {
    render_xml(&CompleteMultipartUploadResultXml {
        xmlns: S3_NS,
        location: format!("/{}/{}", bucket, done.node.full_path),
        bucket: bucket.to_string(),
        key: done.node.full_path.clone(),
        etag: quoted(&done.etag),
    })
}

/// Run `work` in the background. A result ready within `idle` gets a normal
/// response; otherwise a 200 stream of keep-alive spaces ends with the
/// result document.
async fn with_heartbeat<F>(work: F, idle: Duration) -> Result<Response, AppError>
where
    F: Future<Output = Result<String, AppError>> + Send + 'static,
{
    let mut task = tokio::spawn(work);
    if let Ok(joined) = timeout(idle, &mut task).await {
        let xml = joined.map_err(|err| AppError::internal(err.to_string()))??;
        return Ok(xml_body(StatusCode::OK, format!("{}{}", XML_DECL, xml)));
    }

    let head = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(XML_DECL.as_bytes())) });
    let tail = stream::unfold(Some(task), move |state| async move {
        let mut task = state?;
        match timeout(idle, &mut task).await {
            Err(_) => Some((Ok(Bytes::from_static(b" ")), Some(task))),
            Ok(joined) => {
                let xml = match joined {
                    Ok(Ok(xml)) => xml,
                    Ok(Err(err)) => error_xml(&err),
                    Err(join) => {
                        warn!(error = %join, "completion task failed");
                        error_xml(&AppError::internal("internal error"))
                    }
                };
                Some((Ok(Bytes::from(xml)), None))
            }
        }
    });
    let body = Body::from_stream(futures::StreamExt::chain(head, tail));
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    Ok(response)
}

/// GET `/{bucket}/{*key}?uploadId=U`
pub async fn list_parts(
    service: &StorageService,
    bucket: &Bucket,
    key: &str,
    upload_id: &str,
    part_number_marker: u32,
    max_parts: u32,
) -> Result<Response, AppError> {
    let listing = service
        .multipart()
        .list_parts(bucket, upload_id, key, part_number_marker, max_parts)
        .await?;

    let parts = listing
        .parts
        .iter()
        .map(|part| PartXml {
            part_number: part.part_number,
            last_modified: part.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            etag: quoted(&part.etag),
            size: part.size,
        })
        .collect();
    xml_response(
        StatusCode::OK,
        &ListPartsResultXml {
            xmlns: S3_NS,
            bucket: &bucket.name,
            key: &listing.upload.object_key,
            upload_id: &listing.upload.id,
            part_number_marker,
            next_part_number_marker: listing.next_part_number_marker,
            max_parts: listing.max_parts,
            is_truncated: listing.is_truncated,
            parts,
        },
    )
}

/// GET `/{bucket}?uploads`
pub async fn list_uploads(
    service: &StorageService,
    bucket: &Bucket,
    prefix: Option<&str>,
) -> Result<Response, AppError> {
    let uploads = service.multipart().list_uploads(bucket, prefix).await?;
    xml_response(
        StatusCode::OK,
        &ListMultipartUploadsResultXml {
            xmlns: S3_NS,
            bucket: &bucket.name,
            prefix: prefix.unwrap_or(""),
            uploads: uploads
                .iter()
                .map(|upload| MultipartUploadXml {
                    key: &upload.object_key,
                    upload_id: &upload.id,
                    initiated: upload.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                })
                .collect(),
            is_truncated: false,
        },
    )
}

/// DELETE `/{bucket}/{*key}?uploadId=U`
pub async fn abort_upload(
    service: &StorageService,
    bucket: &Bucket,
    key: &str,
    upload_id: &str,
) -> Result<StatusCode, AppError> {
    service.multipart().abort(bucket, upload_id, key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::body::to_bytes;

    #[test]
    fn parses_complete_document() {
        let body = br#"<CompleteMultipartUpload>
            <Part><PartNumber>1</PartNumber><ETag>"aa"</ETag></Part>
            <Part><ETag>bb</ETag><PartNumber>2</PartNumber></Part>
        </CompleteMultipartUpload>"#;
        let parts = parse_complete_body(body).unwrap();
        assert_eq!(
            parts,
            vec![
                CompletedPart { part_number: 1, etag: "\"aa\"".into() },
                CompletedPart { part_number: 2, etag: "bb".into() },
            ]
        );
        assert_matches!(
            parse_complete_body(b"<CompleteMultipartUpload><Part>"),
            Err(HarborError::InvalidRequest(_))
        );
    }

    #[test]
    fn result_documents_carry_namespace_and_escape_keys() {
        let xml = render_xml(&InitiateMultipartUploadResultXml {
            xmlns: S3_NS,
            bucket: "b1",
            key: "a<b&c.txt",
            upload_id: "u1",
        })
        .unwrap();
        assert!(xml.starts_with(&format!(
            r#"<InitiateMultipartUploadResult xmlns="{}">"#,
            S3_NS
        )));
        assert!(xml.contains("<Key>a&lt;b&amp;c.txt</Key>"));
        assert!(xml.contains("<UploadId>u1</UploadId>"));

        let xml = render_xml(&ListPartsResultXml {
            xmlns: S3_NS,
            bucket: "b1",
            key: "k",
            upload_id: "u1",
            part_number_marker: 0,
            next_part_number_marker: None,
            max_parts: 2,
            is_truncated: false,
            parts: vec![
                PartXml {
                    part_number: 1,
                    last_modified: "2026-01-01T00:00:00.000Z".into(),
                    etag: quoted("aa"),
                    size: 5,
                },
                PartXml {
                    part_number: 2,
                    last_modified: "2026-01-01T00:00:01.000Z".into(),
                    etag: quoted("bb"),
                    size: 3,
                },
            ],
        })
        .unwrap();
        assert_eq!(xml.matches("<Part>").count(), 2);
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
        assert!(!xml.contains("NextPartNumberMarker"));
        assert!(xml.contains("<Size>3</Size>"));
    }

    #[tokio::test]
    async fn quick_results_are_plain_responses() {
        let response = with_heartbeat(async { Ok("<Done/>".to_string()) }, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], format!("{}<Done/>", XML_DECL).as_bytes());

        let err = with_heartbeat(
            async { Err(AppError::from(HarborError::InvalidPartOrder)) },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn slow_results_stream_whitespace_first() {
        let work = async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Err(AppError::from(HarborError::InvalidPart("bad".into())))
        };
        let response = with_heartbeat(work, Duration::from_millis(30)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let rest = text.strip_prefix(XML_DECL).unwrap();
        assert!(rest.starts_with(' '));
        assert!(rest.trim_start().starts_with("<Error><Code>InvalidPart</Code>"));
    }
}
