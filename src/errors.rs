use crate::services::blob::BackendError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Error taxonomy shared by every storage component.
///
/// Each variant carries a stable S3-style code (`code()`) and an HTTP status
/// (`status()`). Backend and database detail stays in the `Display` text and
/// is only logged, never rendered beyond the short message.
#[derive(Debug, Error)]
pub enum HarborError {
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),
    #[error("key `{0}` does not exist")]
    NoSuchKey(String),
    #[error("upload `{0}` does not exist")]
    NoSuchUpload(String),
    /// A path segment that must be a directory is an existing file.
    #[error("the path of `{0}` conflicts with an existing object")]
    NameConflict(String),
    #[error("an object or directory named `{0}` already exists")]
    SameKeyAlreadyExists(String),
    #[error("directory `{0}` already exists")]
    DirectoryAlreadyExists(String),
    #[error("an object named `{0}` already exists")]
    ObjectKeyAlreadyExists(String),
    #[error("parent path of `{0}` does not exist")]
    NoSuchParentPath(String),
    #[error("directory `{0}` is not empty")]
    NoEmptyDir(String),
    #[error("bucket `{0}` is locked")]
    BucketLocked(String),
    #[error("access denied")]
    AccessDenied,
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    EntityTooSmall(String),
    #[error("{0}")]
    EntityTooLarge(String),
    #[error("{0}")]
    InvalidPart(String),
    #[error("the list of parts was not in ascending order")]
    InvalidPartOrder,
    #[error("upload `{0}` is being completed")]
    UploadInProgress(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error(transparent)]
    Storage(#[from] BackendError),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type HarborResult<T> = Result<T, HarborError>;

impl HarborError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchBucket(_) => "NoSuchBucket",
            Self::NoSuchKey(_) => "NoSuchKey",
            Self::NoSuchUpload(_) => "NoSuchUpload",
            Self::NameConflict(_) => "NameConflict",
            Self::SameKeyAlreadyExists(_) => "SameKeyAlreadyExists",
            Self::DirectoryAlreadyExists(_) => "DirectoryAlreadyExists",
            Self::ObjectKeyAlreadyExists(_) => "ObjectKeyAlreadyExists",
            Self::NoSuchParentPath(_) => "NoSuchParentPath",
            Self::NoEmptyDir(_) => "NoEmptyDir",
            Self::BucketLocked(_) => "BucketLockWrite",
            Self::AccessDenied => "AccessDenied",
            Self::BucketAlreadyExists(_) => "BucketAlreadyExists",
            Self::InvalidBucketName { .. } => "InvalidBucketName",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::EntityTooSmall(_) => "EntityTooSmall",
            Self::EntityTooLarge(_) => "EntityTooLarge",
            Self::InvalidPart(_) => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::UploadInProgress(_) => "CompleteMultipartAlreadyInProgress",
            Self::WriteFailed(_) | Self::Storage(_) | Self::Internal(_) | Self::Database(_) => {
                "InternalError"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoSuchBucket(_) | Self::NoSuchKey(_) | Self::NoSuchUpload(_) => {
                StatusCode::NOT_FOUND
            }
            Self::NameConflict(_)
            | Self::SameKeyAlreadyExists(_)
            | Self::DirectoryAlreadyExists(_)
            | Self::ObjectKeyAlreadyExists(_)
            | Self::BucketAlreadyExists(_)
            | Self::NoEmptyDir(_)
            | Self::UploadInProgress(_) => StatusCode::CONFLICT,
            Self::BucketLocked(_) | Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::NoSuchParentPath(_)
            | Self::InvalidBucketName { .. }
            | Self::InvalidRequest(_)
            | Self::InvalidArgument(_)
            | Self::EntityTooSmall(_)
            | Self::EntityTooLarge(_)
            | Self::InvalidPart(_)
            | Self::InvalidPartOrder => StatusCode::BAD_REQUEST,
            Self::WriteFailed(_) | Self::Storage(_) | Self::Internal(_) | Self::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            code: "InvalidRequest",
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "InternalError",
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<HarborError> for AppError {
    fn from(err: HarborError) -> Self {
        let status = err.status();
        let message = match &err {
            HarborError::Storage(_) | HarborError::Database(_) | HarborError::WriteFailed(_) => {
                tracing::error!(error = %err, "storage failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            status,
            code: err.code(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_are_stable() {
        let err = HarborError::UploadInProgress("u1".into());
        assert_eq!(err.code(), "CompleteMultipartAlreadyInProgress");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = HarborError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), "InternalError");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_detail_is_not_rendered() {
        let app: AppError = HarborError::WriteFailed("pool osd.3 timed out".into()).into();
        assert_eq!(app.code, "InternalError");
        assert_eq!(app.message, "internal error");

        let app: AppError = HarborError::NoEmptyDir("docs".into()).into();
        assert_eq!(app.status, StatusCode::CONFLICT);
        assert!(app.message.contains("docs"));
    }
}
