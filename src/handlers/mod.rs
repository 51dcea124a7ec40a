//! HTTP handlers. Each module maps requests onto one group of storage
//! operations; the helpers below are shared between them.

pub mod bucket_handlers;
pub mod health_handlers;
pub mod multipart_handlers;
pub mod object_handlers;

use crate::errors::{AppError, HarborError};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Caller identity, set by the fronting gateway.
pub const USER_HEADER: &str = "x-harbor-user";

pub(crate) const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
pub(crate) const S3_NS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Query parameters of object-level routes. Which of them are present picks
/// the operation.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    pub uploads: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
    #[serde(rename = "max-parts")]
    pub max_parts: Option<u32>,
    #[serde(rename = "part-number-marker")]
    pub part_number_marker: Option<u32>,
    pub move_to: Option<String>,
    pub rename: Option<String>,
    pub prefix: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

/// `None` for anonymous requests. A malformed id is rejected.
pub(crate) fn caller(headers: &HeaderMap) -> Result<Option<i64>, AppError> {
    match header_str(headers, USER_HEADER) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("invalid {} header", USER_HEADER))),
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Serialize one XML document body, without the declaration.
pub(crate) fn render_xml<T: Serialize>(payload: &T) -> Result<String, AppError> {
    quick_xml::se::to_string(payload)
        .map_err(|err| AppError::internal(format!("failed to serialize xml response: {}", err)))
}

pub(crate) fn xml_response<T: Serialize>(
    status: StatusCode,
    payload: &T,
) -> Result<Response, AppError> {
    let xml = render_xml(payload)?;
    Ok(xml_body(status, format!("{}{}", XML_DECL, xml)))
}

/// Wrap an already rendered document.
pub(crate) fn xml_body(status: StatusCode, xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    *response.status_mut() = status;
    response
}

#[derive(Debug, Serialize)]
#[serde(rename = "Error")]
struct ErrorXml<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    #[serde(rename = "Message")]
    message: &'a str,
}

/// S3 `<Error>` document for errors reported inside a 200 response.
pub(crate) fn error_xml(err: &AppError) -> String {
    let doc = ErrorXml {
        code: err.code,
        message: &err.message,
    };
    render_xml(&doc).unwrap_or_else(|_| {
        warn!(code = err.code, "could not serialize error document");
        String::from("<Error><Code>InternalError</Code></Error>")
    })
}

pub(crate) fn quoted(etag: &str) -> String {
    format!("\"{}\"", etag)
}

/// Bodies over `limit` bytes are `EntityTooLarge`.
pub(crate) async fn collect_body(body: Body, limit: u64) -> Result<bytes::Bytes, AppError> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    axum::body::to_bytes(body, limit).await.map_err(|err| {
        AppError::from(HarborError::EntityTooLarge(format!(
            "request body rejected: {}",
            err
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_documents_escape_the_message() {
        let err = AppError::from(HarborError::InvalidPart("part <2> & more".into()));
        let xml = error_xml(&err);
        assert!(xml.starts_with("<Error><Code>InvalidPart</Code><Message>"));
        assert!(xml.contains("&lt;2"));
        assert!(xml.contains("&amp; more"));
        assert!(!xml.contains("<2>"));
    }
}
