//! Represents a logical bucket — a top-level container for a directory tree.

use crate::errors::{HarborError, HarborResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccessPermission {
    Public,
    Private,
}

/// Administrative lock of a bucket.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum LockState {
    ReadWrite,
    ReadOnly,
    NoReadWrite,
}

/// A storage bucket.
///
/// Buckets own a directory tree of nodes and name the blob pool that holds
/// the bytes of their files.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: i64,

    /// Unique among live buckets. Soft-deleted buckets carry a tombstone name.
    pub name: String,

    /// ID of the user or account that owns this bucket.
    pub owner_id: i64,

    pub access_permission: AccessPermission,

    pub lock_state: LockState,

    /// Blob pool backing this bucket's object data.
    pub pool_name: String,

    pub created_at: DateTime<Utc>,

    pub soft_deleted: bool,
}

impl Bucket {
    pub fn is_public(&self) -> bool {
        self.access_permission == AccessPermission::Public
    }

    /// Reads are refused only under `no-read-write`.
    pub fn ensure_readable(&self) -> HarborResult<()> {
        match self.lock_state {
            LockState::NoReadWrite => Err(HarborError::BucketLocked(self.name.clone())),
            _ => Ok(()),
        }
    }

    /// Writes require `read-write`.
    pub fn ensure_writable(&self) -> HarborResult<()> {
        match self.lock_state {
            LockState::ReadWrite => Ok(()),
            _ => Err(HarborError::BucketLocked(self.name.clone())),
        }
    }
}
