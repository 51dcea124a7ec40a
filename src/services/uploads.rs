//! Row access for `multipart_uploads`.
//!
//! Shared by the metadata store (stale uploads are dropped when an object is
//! reset or deleted) and the multipart coordinator.

use crate::{
    errors::{HarborError, HarborResult},
    models::multipart::{MultipartUpload, PartInfo, UploadStatus},
    services::path,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;

const UPLOAD_COLUMNS: &str = "id, bucket_id, bucket_name, object_key, key_hash, object_id, \
     object_etag, share_code, part_count, parts_json, chunk_size, status, object_uploaded_at, \
     created_at, expires_at, last_modified";

#[derive(Clone)]
pub struct UploadRepository {
    db: Arc<SqlitePool>,
}

impl UploadRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get(&self, upload_id: &str) -> HarborResult<Option<MultipartUpload>> {
        let sql = format!("SELECT {} FROM multipart_uploads WHERE id = ?", UPLOAD_COLUMNS);
        Ok(sqlx::query_as::<_, MultipartUpload>(&sql)
            .bind(upload_id)
            .fetch_optional(&*self.db)
            .await?)
    }

    pub async fn insert(&self, upload: &MultipartUpload) -> HarborResult<()> {
        sqlx::query(
            "INSERT INTO multipart_uploads (
                id, bucket_id, bucket_name, object_key, key_hash, object_id, object_etag,
                share_code, part_count, parts_json, chunk_size, status, object_uploaded_at,
                created_at, expires_at, last_modified
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&upload.id)
        .bind(upload.bucket_id)
        .bind(&upload.bucket_name)
        .bind(&upload.object_key)
        .bind(&upload.key_hash)
        .bind(upload.object_id)
        .bind(&upload.object_etag)
        .bind(upload.share_code)
        .bind(upload.part_count)
        .bind(&upload.parts_json)
        .bind(upload.chunk_size)
        .bind(upload.status)
        .bind(upload.object_uploaded_at)
        .bind(upload.created_at)
        .bind(upload.expires_at)
        .bind(upload.last_modified)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Drop every upload row targeting `key`, whatever its status.
    pub async fn delete_for_key(&self, bucket_id: i64, key: &str) -> HarborResult<u64> {
        let result =
            sqlx::query("DELETE FROM multipart_uploads WHERE bucket_id = ? AND key_hash = ?")
                .bind(bucket_id)
                .bind(path::path_hash(key))
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected())
    }

    /// Compare-and-set the chunk size from 0. False when it was already set.
    pub async fn set_chunk_size_once(&self, upload_id: &str, chunk_size: u64) -> HarborResult<bool> {
        let result = sqlx::query(
            "UPDATE multipart_uploads SET chunk_size = ?, last_modified = ?
             WHERE id = ? AND chunk_size = 0",
        )
        .bind(to_i64(chunk_size)?)
        .bind(Utc::now())
        .bind(upload_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn transition(
        &self,
        upload_id: &str,
        from: UploadStatus,
        to: UploadStatus,
    ) -> HarborResult<bool> {
        let result = sqlx::query(
            "UPDATE multipart_uploads SET status = ?, last_modified = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(from)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_if_status(&self, upload_id: &str, status: UploadStatus) -> HarborResult<bool> {
        let result = sqlx::query("DELETE FROM multipart_uploads WHERE id = ? AND status = ?")
            .bind(upload_id)
            .bind(status)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(
        &self,
        upload_id: &str,
        object_id: i64,
        object_etag: &str,
    ) -> HarborResult<()> {
        let result = sqlx::query(
            "UPDATE multipart_uploads
             SET status = ?, object_id = ?, object_etag = ?, last_modified = ?
             WHERE id = ? AND status = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(object_id)
        .bind(object_etag)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UploadStatus::Composing)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() != 1 {
            return Err(HarborError::Internal(format!(
                "upload {} was superseded while composing",
                upload_id
            )));
        }
        Ok(())
    }

    /// Open uploads of a bucket, newest first.
    pub async fn list_uploading(
        &self,
        bucket_id: i64,
        bucket_name: &str,
        prefix: Option<&str>,
    ) -> HarborResult<Vec<MultipartUpload>> {
        let sql = format!(
            "SELECT {} FROM multipart_uploads
             WHERE bucket_id = ? AND bucket_name = ? AND status = ?
             ORDER BY created_at DESC, id DESC",
            UPLOAD_COLUMNS
        );
        let uploads = sqlx::query_as::<_, MultipartUpload>(&sql)
            .bind(bucket_id)
            .bind(bucket_name)
            .bind(UploadStatus::Uploading)
            .fetch_all(&*self.db)
            .await?;
        Ok(match prefix {
            Some(prefix) if !prefix.is_empty() => uploads
                .into_iter()
                .filter(|u| u.object_key.starts_with(prefix))
                .collect(),
            _ => uploads,
        })
    }
}

/// Take the write lock on an upload row inside a transaction.
///
/// The first statement of the transaction writes the row, so SQLite holds
/// the database write lock until commit and concurrent lockers queue behind
/// the busy timeout. False when the row is gone.
pub(crate) async fn lock_row(
    conn: &mut SqliteConnection,
    upload_id: &str,
    now: DateTime<Utc>,
) -> HarborResult<bool> {
    let result = sqlx::query("UPDATE multipart_uploads SET last_modified = ? WHERE id = ?")
        .bind(now)
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn fetch_locked(
    conn: &mut SqliteConnection,
    upload_id: &str,
) -> HarborResult<MultipartUpload> {
    let sql = format!("SELECT {} FROM multipart_uploads WHERE id = ?", UPLOAD_COLUMNS);
    sqlx::query_as::<_, MultipartUpload>(&sql)
        .bind(upload_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| HarborError::NoSuchUpload(upload_id.to_string()))
}

pub(crate) async fn store_parts(
    conn: &mut SqliteConnection,
    upload_id: &str,
    parts: &[PartInfo],
) -> HarborResult<()> {
    let parts_json = serde_json::to_string(parts)
        .map_err(|err| HarborError::Internal(format!("encoding part map: {}", err)))?;
    sqlx::query("UPDATE multipart_uploads SET parts_json = ?, part_count = ? WHERE id = ?")
        .bind(parts_json)
        .bind(parts.len() as i64)
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) fn to_i64(value: u64) -> HarborResult<i64> {
    i64::try_from(value)
        .map_err(|_| HarborError::InvalidArgument(format!("value {} is out of range", value)))
}
