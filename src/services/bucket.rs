//! BucketService — bucket rows, naming rules and access checks.

use crate::{
    db::is_unique_violation,
    errors::{HarborError, HarborResult},
    models::bucket::{AccessPermission, Bucket, LockState},
    services::blob::ClusterRegistry,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

const BUCKET_COLUMNS: &str =
    "id, name, owner_id, access_permission, lock_state, pool_name, created_at, soft_deleted";
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Operations either name a bucket or hand over one already loaded.
#[derive(Debug, Clone)]
pub enum BucketRef {
    ById(i64),
    ByName(String),
    Resolved(Bucket),
}

impl From<&str> for BucketRef {
    fn from(name: &str) -> Self {
        BucketRef::ByName(name.to_string())
    }
}

impl From<Bucket> for BucketRef {
    fn from(bucket: Bucket) -> Self {
        BucketRef::Resolved(bucket)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone)]
pub struct BucketService {
    db: Arc<SqlitePool>,
    registry: ClusterRegistry,
}

impl BucketService {
    pub fn new(db: Arc<SqlitePool>, registry: ClusterRegistry) -> Self {
        Self { db, registry }
    }

    /// Create a bucket on `pool`.
    ///
    /// Returns BucketAlreadyExists if a live bucket has the name.
    pub async fn create_bucket(
        &self,
        name: &str,
        owner_id: i64,
        permission: AccessPermission,
        pool: &str,
    ) -> HarborResult<Bucket> {
        ensure_bucket_name_safe(name)?;
        if !self.registry.contains(pool) {
            return Err(HarborError::InvalidArgument(format!(
                "blob pool `{}` is not configured",
                pool
            )));
        }

        let sql = format!(
            "INSERT INTO buckets (name, owner_id, access_permission, lock_state, pool_name, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {}",
            BUCKET_COLUMNS
        );
        match sqlx::query_as::<_, Bucket>(&sql)
            .bind(name)
            .bind(owner_id)
            .bind(permission)
            .bind(LockState::ReadWrite)
            .bind(pool)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await
        {
            Ok(bucket) => {
                info!(bucket = %bucket.name, id = bucket.id, pool, "created bucket");
                Ok(bucket)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(HarborError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load(&self, bucket: BucketRef) -> HarborResult<Bucket> {
        let (found, label) = match bucket {
            BucketRef::Resolved(bucket) => return Ok(bucket),
            BucketRef::ById(id) => {
                let sql = format!(
                    "SELECT {} FROM buckets WHERE id = ? AND soft_deleted = 0",
                    BUCKET_COLUMNS
                );
                let found = sqlx::query_as::<_, Bucket>(&sql)
                    .bind(id)
                    .fetch_optional(&*self.db)
                    .await?;
                (found, format!("#{}", id))
            }
            BucketRef::ByName(name) => {
                let sql = format!(
                    "SELECT {} FROM buckets WHERE name = ? AND soft_deleted = 0",
                    BUCKET_COLUMNS
                );
                let found = sqlx::query_as::<_, Bucket>(&sql)
                    .bind(&name)
                    .fetch_optional(&*self.db)
                    .await?;
                (found, name)
            }
        };
        found.ok_or(HarborError::NoSuchBucket(label))
    }

    /// Load a bucket and check that `user` may access it.
    ///
    /// Anyone may read a public bucket; everything else needs the owner.
    /// `None` is an anonymous caller.
    pub async fn resolve(
        &self,
        bucket: impl Into<BucketRef>,
        user: Option<i64>,
        access: Access,
    ) -> HarborResult<Bucket> {
        let bucket = self.load(bucket.into()).await?;
        let is_owner = user == Some(bucket.owner_id);
        match access {
            Access::Read => {
                if !is_owner && !bucket.is_public() {
                    return Err(HarborError::AccessDenied);
                }
                bucket.ensure_readable()?;
            }
            Access::Write => {
                if !is_owner {
                    return Err(HarborError::AccessDenied);
                }
                bucket.ensure_writable()?;
            }
        }
        Ok(bucket)
    }

    /// Tombstone a bucket. The name becomes free for a new bucket at once.
    pub async fn soft_delete(&self, bucket: &Bucket) -> HarborResult<()> {
        let tombstone = format!("_deleted_{}_{}", bucket.id, bucket.name);
        let result = sqlx::query(
            "UPDATE buckets SET soft_deleted = 1, name = ? WHERE id = ? AND soft_deleted = 0",
        )
        .bind(&tombstone)
        .bind(bucket.id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HarborError::NoSuchBucket(bucket.name.clone()));
        }
        info!(bucket = %bucket.name, id = bucket.id, "deleted bucket");
        Ok(())
    }

    pub async fn set_lock_state(&self, bucket: &Bucket, state: LockState) -> HarborResult<Bucket> {
        sqlx::query("UPDATE buckets SET lock_state = ? WHERE id = ? AND soft_deleted = 0")
            .bind(state)
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        info!(bucket = %bucket.name, lock_state = ?state, "bucket lock changed");
        self.load(BucketRef::ById(bucket.id)).await
    }

    pub async fn set_access_permission(
        &self,
        bucket: &Bucket,
        permission: AccessPermission,
    ) -> HarborResult<Bucket> {
        sqlx::query("UPDATE buckets SET access_permission = ? WHERE id = ? AND soft_deleted = 0")
            .bind(permission)
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        self.load(BucketRef::ById(bucket.id)).await
    }
}

fn invalid(name: &str, reason: &str) -> HarborError {
    HarborError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// S3 bucket naming rules.
fn ensure_bucket_name_safe(name: &str) -> HarborResult<()> {
    if name.trim() != name {
        return Err(invalid(name, "cannot begin or end with whitespace"));
    }
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len()) {
        return Err(invalid(name, "must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            name,
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid(name, "must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            name,
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid(name, "must not be formatted like an IP address"));
    }
    Ok(())
}

/// Names of the form `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let segments: Vec<&str> = name.split('.').collect();
    segments.len() == 4
        && segments.iter().all(|s| {
            !s.is_empty() && s.len() <= 3 && s.chars().all(|c| c.is_ascii_digit()) && s.parse::<u8>().is_ok()
        })
}
