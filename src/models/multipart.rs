//! Represents multipart upload sessions and parts.

use crate::errors::{HarborError, HarborResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lowest and highest part numbers a client may use.
pub const MIN_PART_NUMBER: u32 = 1;
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Lifecycle of an upload. `Composing` is held only while a completion runs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Composing,
    Completed,
}

/// A multipart upload session, initiated before uploading large files in parts.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Time-ordered opaque upload id (returned to client).
    pub id: String,

    pub bucket_id: i64,

    pub bucket_name: String,

    /// Object key being uploaded.
    pub object_key: String,

    /// MD5 hex of `object_key`.
    pub key_hash: String,

    /// Node id of the completed object; 0 until completion.
    pub object_id: i64,

    pub object_etag: String,

    pub share_code: i64,

    pub part_count: i64,

    /// JSON array of [`PartInfo`] ordered by part number.
    pub parts_json: String,

    /// Byte stride between part offsets; 0 until the first part fixes it.
    pub chunk_size: i64,

    pub status: UploadStatus,

    /// `created_at` of the target node when the upload began.
    pub object_uploaded_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub expires_at: Option<DateTime<Utc>>,

    pub last_modified: DateTime<Utc>,
}

impl MultipartUpload {
    pub fn parts(&self) -> HarborResult<Vec<PartInfo>> {
        serde_json::from_str(&self.parts_json).map_err(|err| {
            HarborError::Internal(format!("corrupt part map for upload `{}`: {}", self.id, err))
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.max(0) as u64
    }

    /// Does this upload target `key` in the given bucket?
    pub fn belongs_to(&self, bucket_id: i64, bucket_name: &str, key: &str) -> bool {
        self.bucket_id == bucket_id && self.bucket_name == bucket_name && self.object_key == key
    }
}

/// Represents a single uploaded part in a multipart upload session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartInfo {
    /// Part number (1-based).
    pub part_number: u32,

    /// Size in bytes.
    pub size: u64,

    /// MD5 hex of the part bytes.
    pub etag: String,

    pub last_modified: DateTime<Utc>,
}

/// Insert or replace a part, keeping the list sorted by part number.
/// Returns the entry that was replaced, if any.
pub fn upsert_part(parts: &mut Vec<PartInfo>, part: PartInfo) -> Option<PartInfo> {
    match parts.binary_search_by_key(&part.part_number, |p| p.part_number) {
        Ok(idx) => Some(std::mem::replace(&mut parts[idx], part)),
        Err(idx) => {
            parts.insert(idx, part);
            None
        }
    }
}

/// A part as declared by the client in a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32, etag: &str) -> PartInfo {
        PartInfo {
            part_number: n,
            size: 1,
            etag: etag.into(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn upsert_keeps_order_and_replaces() {
        let mut parts = Vec::new();
        assert!(upsert_part(&mut parts, part(3, "c")).is_none());
        assert!(upsert_part(&mut parts, part(1, "a")).is_none());
        let old = upsert_part(&mut parts, part(3, "c2")).unwrap();
        assert_eq!(old.etag, "c");
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(parts[1].etag, "c2");
    }
}
