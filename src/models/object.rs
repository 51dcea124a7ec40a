//! Directory and file nodes of a bucket's tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;

/// Column list matching [`Node`] for `SELECT` and `RETURNING` clauses.
pub const NODE_COLUMNS: &str = "id, bucket_id, parent_id, name, full_path, path_hash, is_file, \
     size_bytes, content_hash, created_at, modified_at, download_count, share_code, \
     share_time_limited, share_expires_at, share_password, soft_deleted, async1, async2";

/// Parent id of top-level nodes.
pub const ROOT_PARENT_ID: i64 = 0;

/// Sharing level of a node. Codes are persisted as integers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[repr(i32)]
pub enum ShareCode {
    None = 0,
    ReadOnly = 1,
    ReadWrite = 2,
}

impl ShareCode {
    /// Map an S3 canned ACL (`x-amz-acl`) to a share level.
    pub fn from_canned_acl(acl: &str) -> Option<Self> {
        match acl {
            "private" => Some(Self::None),
            "public-read" => Some(Self::ReadOnly),
            "public-read-write" => Some(Self::ReadWrite),
            _ => None,
        }
    }
}

/// One row of the directory tree: either a directory or a file.
///
/// `size_bytes` only grows between explicit resets. `content_hash` is empty
/// when the content digest is unknown.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Node {
    pub id: i64,
    pub bucket_id: i64,
    /// 0 for nodes directly under the bucket root.
    pub parent_id: i64,
    pub name: String,
    /// Denormalized `/`-joined path from the bucket root.
    pub full_path: String,
    /// MD5 hex of `full_path`.
    pub path_hash: String,
    pub is_file: bool,
    pub size_bytes: i64,
    pub content_hash: String,
    /// Upload time of the current content generation.
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub download_count: i64,
    pub share_code: ShareCode,
    pub share_time_limited: bool,
    pub share_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub share_password: String,
    pub soft_deleted: bool,
    /// Last sync time per backup slot.
    pub async1: Option<DateTime<Utc>>,
    pub async2: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        !self.is_file
    }

    /// Name of the backing blob in the bucket's pool.
    pub fn blob_id(&self) -> String {
        format!("{}_{}", self.bucket_id, self.id)
    }

    pub fn size(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }

    pub fn is_shared_and_in_window(&self, now: DateTime<Utc>) -> bool {
        if self.share_code == ShareCode::None {
            return false;
        }
        if !self.share_time_limited {
            return true;
        }
        self.share_expires_at.is_some_and(|expires| now < expires)
    }

    pub fn has_share_password(&self) -> bool {
        !self.share_password.is_empty()
    }

    /// A node without a share password accepts any password.
    pub fn check_share_password(&self, password: &str) -> bool {
        !self.has_share_password() || self.share_password == hash_share_password(password)
    }
}

pub fn hash_share_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}
