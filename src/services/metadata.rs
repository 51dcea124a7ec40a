//! ObjectMetadataStore — file nodes and the lifecycle of their blobs.
//!
//! Metadata changes are committed before the matching blob operation; when
//! the blob operation fails the metadata change is compensated.

use crate::{
    errors::{HarborError, HarborResult},
    models::{
        bucket::Bucket,
        object::{NODE_COLUMNS, Node, ShareCode, hash_share_password},
    },
    services::{
        blob::{ClusterRegistry, PartitionedBlobStore},
        directory::{DirectoryIndex, insert_node},
        path,
        uploads::{UploadRepository, to_i64},
    },
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ObjectMetadataStore {
    db: Arc<SqlitePool>,
    registry: ClusterRegistry,
    dirs: DirectoryIndex,
    uploads: UploadRepository,
}

impl ObjectMetadataStore {
    pub fn new(db: Arc<SqlitePool>, registry: ClusterRegistry) -> Self {
        Self {
            dirs: DirectoryIndex::new(db.clone()),
            uploads: UploadRepository::new(db.clone()),
            db,
            registry,
        }
    }

    /// Partitioned blob access for the bucket's pool.
    pub fn blobs(&self, bucket: &Bucket) -> HarborResult<PartitionedBlobStore> {
        Ok(self.registry.store(&bucket.pool_name)?)
    }

    pub fn directories(&self) -> &DirectoryIndex {
        &self.dirs
    }

    /// Look up a file by path. Directories and missing paths are `NoSuchKey`.
    pub async fn get_file(&self, bucket: &Bucket, file_path: &str) -> HarborResult<Node> {
        match self.dirs.get_by_path(bucket, file_path).await? {
            Some(node) if node.is_file => Ok(node),
            _ => Err(HarborError::NoSuchKey(path::normalize(file_path))),
        }
    }

    pub async fn get_by_id(&self, bucket: &Bucket, id: i64) -> HarborResult<Node> {
        self.dirs
            .get_by_id(bucket, id)
            .await?
            .ok_or_else(|| HarborError::NoSuchKey(format!("#{}", id)))
    }

    /// Find the file at `file_path` or create an empty one, creating missing
    /// ancestor directories. Returns whether the file was created.
    pub async fn get_or_create_empty(
        &self,
        bucket: &Bucket,
        file_path: &str,
    ) -> HarborResult<(Node, bool)> {
        let (parent_path, name) = path::split(file_path);
        path::validate_leaf(&name)?;
        let parent = self.dirs.ensure_path(bucket, &parent_path).await?;
        let full_path = path::join(&parent_path, &name);

        if let Some(existing) = self.dirs.get_child(bucket, parent.id(), &name).await? {
            return existing_file(existing);
        }
        match insert_node(&self.db, bucket.id, parent.id(), &name, &full_path, true, Utc::now())
            .await?
        {
            Some(node) => {
                debug!(bucket = %bucket.name, path = %full_path, id = node.id, "created object");
                Ok((node, true))
            }
            // Lost a race to a concurrent creator.
            None => match self.dirs.get_child(bucket, parent.id(), &name).await? {
                Some(existing) => existing_file(existing),
                None => Err(HarborError::Internal(format!(
                    "object `{}` vanished during creation",
                    full_path
                ))),
            },
        }
    }

    /// Raise the recorded size to `candidate` if larger. Never shrinks.
    ///
    /// `content_hash`, when given, replaces the stored hash. False when the
    /// node no longer exists.
    pub async fn update_size_monotonic(
        &self,
        node_id: i64,
        candidate: u64,
        modified_at: DateTime<Utc>,
        content_hash: Option<&str>,
    ) -> HarborResult<bool> {
        let mut conn = self.db.acquire().await?;
        raise_size(&mut conn, node_id, candidate, modified_at, content_hash).await
    }

    /// Put back a size/hash snapshot after a failed blob write.
    pub async fn restore_snapshot(&self, node: &Node) -> HarborResult<()> {
        sqlx::query(
            "UPDATE nodes SET size_bytes = ?, modified_at = ?, content_hash = ? WHERE id = ?",
        )
        .bind(node.size_bytes)
        .bind(node.modified_at)
        .bind(&node.content_hash)
        .bind(node.id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn set_content_hash(&self, node_id: i64, content_hash: &str) -> HarborResult<()> {
        sqlx::query("UPDATE nodes SET content_hash = ? WHERE id = ?")
            .bind(content_hash)
            .bind(node_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Set the exact final size and hash of a completed object.
    pub async fn finalize(
        &self,
        bucket: &Bucket,
        node_id: i64,
        size: u64,
        content_hash: &str,
    ) -> HarborResult<Node> {
        sqlx::query(
            "UPDATE nodes SET size_bytes = ?, content_hash = ?, modified_at = ?
             WHERE id = ? AND soft_deleted = 0",
        )
        .bind(to_i64(size)?)
        .bind(content_hash)
        .bind(Utc::now())
        .bind(node_id)
        .execute(&*self.db)
        .await?;
        self.get_by_id(bucket, node_id).await
    }

    /// Empty an existing file so it can be written from scratch.
    ///
    /// The emptied metadata is committed first, then the blob is removed. If
    /// the blob removal fails the previous size, hash and upload time are
    /// restored; otherwise stale multipart uploads of the path are dropped.
    pub async fn reset_for_overwrite(&self, bucket: &Bucket, node: &Node) -> HarborResult<Node> {
        let store = self.blobs(bucket)?;
        let node = self.get_by_id(bucket, node.id).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE nodes SET size_bytes = 0, content_hash = '', created_at = ?, modified_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(node.id)
        .execute(&*self.db)
        .await?;

        if let Err(err) = store.delete(&node.blob_id(), node.size()).await {
            warn!(path = %node.full_path, error = %err, "blob removal failed during reset, restoring metadata");
            sqlx::query(
                "UPDATE nodes SET size_bytes = ?, content_hash = ?, created_at = ?, modified_at = ?
                 WHERE id = ?",
            )
            .bind(node.size_bytes)
            .bind(&node.content_hash)
            .bind(node.created_at)
            .bind(node.modified_at)
            .bind(node.id)
            .execute(&*self.db)
            .await?;
            return Err(err.into());
        }

        self.drop_uploads(bucket, &node).await?;
        self.get_by_id(bucket, node.id).await
    }

    async fn drop_uploads(&self, bucket: &Bucket, node: &Node) -> HarborResult<()> {
        let dropped = self.uploads.delete_for_key(bucket.id, &node.full_path).await?;
        if dropped > 0 {
            debug!(path = %node.full_path, dropped, "dropped stale multipart uploads");
        }
        Ok(())
    }

    /// Delete a file (metadata, blob, then stale uploads) or an empty directory.
    ///
    /// When the blob removal fails the metadata row is re-inserted with its
    /// original id and the failure is surfaced.
    pub async fn delete(&self, bucket: &Bucket, node: &Node) -> HarborResult<()> {
        if node.is_dir() {
            if self.dirs.child_count(bucket, node.id).await? > 0 {
                return Err(HarborError::NoEmptyDir(node.full_path.clone()));
            }
            sqlx::query("DELETE FROM nodes WHERE id = ?")
                .bind(node.id)
                .execute(&*self.db)
                .await?;
            return Ok(());
        }

        let store = self.blobs(bucket)?;
        // The caller's copy may predate later writes; delete what is stored.
        let node = &self.get_by_id(bucket, node.id).await?;

        let result = sqlx::query("DELETE FROM nodes WHERE id = ? AND bucket_id = ?")
            .bind(node.id)
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(HarborError::NoSuchKey(node.full_path.clone()));
        }

        if let Err(err) = store.delete(&node.blob_id(), node.size()).await {
            warn!(path = %node.full_path, error = %err, "blob removal failed, restoring metadata row");
            self.reinsert(node).await?;
            return Err(err.into());
        }
        self.drop_uploads(bucket, node).await?;
        info!(bucket = %bucket.name, path = %node.full_path, "deleted object");
        Ok(())
    }

    async fn reinsert(&self, node: &Node) -> HarborResult<()> {
        let sql = format!(
            "INSERT INTO nodes ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            NODE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(node.id)
            .bind(node.bucket_id)
            .bind(node.parent_id)
            .bind(&node.name)
            .bind(&node.full_path)
            .bind(&node.path_hash)
            .bind(node.is_file)
            .bind(node.size_bytes)
            .bind(&node.content_hash)
            .bind(node.created_at)
            .bind(node.modified_at)
            .bind(node.download_count)
            .bind(node.share_code)
            .bind(node.share_time_limited)
            .bind(node.share_expires_at)
            .bind(&node.share_password)
            .bind(node.soft_deleted)
            .bind(node.async1)
            .bind(node.async2)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Best effort; a failed increment is only logged.
    pub async fn increment_download_count(&self, node_id: i64) {
        if let Err(err) =
            sqlx::query("UPDATE nodes SET download_count = download_count + 1 WHERE id = ?")
                .bind(node_id)
                .execute(&*self.db)
                .await
        {
            warn!(node_id, error = %err, "failed to bump download count");
        }
    }

    /// Configure sharing of a node.
    ///
    /// `days == 0` shares permanently, `days > 0` until now + days and
    /// `days < 0` (or `ShareCode::None`) turns sharing off. An empty password
    /// clears it.
    pub async fn set_share(
        &self,
        bucket: &Bucket,
        node: &Node,
        code: ShareCode,
        days: i64,
        password: Option<&str>,
    ) -> HarborResult<Node> {
        bucket.ensure_writable()?;
        let (code, time_limited, expires_at) = if code == ShareCode::None || days < 0 {
            (ShareCode::None, false, None)
        } else if days == 0 {
            (code, false, None)
        } else {
            let window = Duration::try_days(days)
                .ok_or_else(|| HarborError::InvalidArgument(format!("{} days is too long", days)))?;
            (code, true, Some(Utc::now() + window))
        };
        let password_hash = match password {
            Some(pw) if !pw.is_empty() => hash_share_password(pw),
            _ => String::new(),
        };

        sqlx::query(
            "UPDATE nodes SET share_code = ?, share_time_limited = ?, share_expires_at = ?,
                              share_password = ?
             WHERE id = ? AND bucket_id = ?",
        )
        .bind(code)
        .bind(time_limited)
        .bind(expires_at)
        .bind(password_hash)
        .bind(node.id)
        .bind(bucket.id)
        .execute(&*self.db)
        .await?;
        self.get_by_id(bucket, node.id).await
    }
}

/// `size = MAX(size, candidate)` on any connection, including one inside a
/// transaction.
pub(crate) async fn raise_size(
    conn: &mut SqliteConnection,
    node_id: i64,
    candidate: u64,
    modified_at: DateTime<Utc>,
    content_hash: Option<&str>,
) -> HarborResult<bool> {
    let result = sqlx::query(
        "UPDATE nodes
         SET size_bytes = MAX(size_bytes, ?), modified_at = ?,
             content_hash = COALESCE(?, content_hash)
         WHERE id = ? AND soft_deleted = 0",
    )
    .bind(to_i64(candidate)?)
    .bind(modified_at)
    .bind(content_hash)
    .bind(node_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

fn existing_file(node: Node) -> HarborResult<(Node, bool)> {
    if node.is_file {
        Ok((node, false))
    } else {
        Err(HarborError::SameKeyAlreadyExists(node.full_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::multipart::UploadStatus, test_support::TestEnv};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn get_or_create_reuses_files_and_rejects_directories() {
        let env = TestEnv::new().await;
        let meta = env.service.metadata();

        let (first, created) = meta.get_or_create_empty(&env.bucket, "a/b/c.bin").await.unwrap();
        assert!(created);
        assert_eq!(first.full_path, "a/b/c.bin");
        let (again, created) = meta.get_or_create_empty(&env.bucket, "/a/b/c.bin").await.unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);

        assert_matches!(
            meta.get_or_create_empty(&env.bucket, "a/b").await,
            Err(HarborError::SameKeyAlreadyExists(_))
        );
    }

    #[tokio::test]
    async fn size_never_shrinks() {
        let env = TestEnv::new().await;
        let meta = env.service.metadata();
        let (node, _) = meta.get_or_create_empty(&env.bucket, "grow").await.unwrap();

        for candidate in [10, 4, 12, 0, 11] {
            assert!(
                meta.update_size_monotonic(node.id, candidate, Utc::now(), None)
                    .await
                    .unwrap()
            );
        }
        assert_eq!(env.file("grow").await.size_bytes, 12);
        assert!(!meta.update_size_monotonic(-1, 1, Utc::now(), None).await.unwrap());
    }

    #[tokio::test]
    async fn failed_blob_delete_restores_the_row() {
        let env = TestEnv::new().await;
        let node = env.put("keep/me.txt", b"precious").await;

        env.backend.fail_removes(1);
        assert_matches!(
            env.service.metadata().delete(&env.bucket, &node).await,
            Err(HarborError::Storage(_))
        );

        let restored = env.file("keep/me.txt").await;
        assert_eq!(restored, node);
        assert!(env.backend.contains(&node.blob_id()));

        env.service.metadata().delete(&env.bucket, &node).await.unwrap();
        assert!(!env.backend.contains(&node.blob_id()));
        assert_matches!(
            env.service.metadata().get_file(&env.bucket, "keep/me.txt").await,
            Err(HarborError::NoSuchKey(_))
        );
    }

    #[tokio::test]
    async fn reset_rolls_back_when_blob_delete_fails() {
        let env = TestEnv::new().await;
        let node = env.put("r.txt", b"abc").await;

        env.backend.fail_removes(1);
        assert!(env.service.metadata().reset_for_overwrite(&env.bucket, &node).await.is_err());
        let after = env.file("r.txt").await;
        assert_eq!(after.size_bytes, 3);
        assert_eq!(after.content_hash, node.content_hash);
        assert_eq!(after.created_at, node.created_at);

        let reset = env.service.metadata().reset_for_overwrite(&env.bucket, &node).await.unwrap();
        assert_eq!(reset.size_bytes, 0);
        assert!(reset.content_hash.is_empty());
        assert!(reset.created_at > node.created_at);
        assert!(!env.backend.contains(&node.blob_id()));
    }

    #[tokio::test]
    async fn failed_delete_keeps_open_uploads() {
        let env = TestEnv::new().await;
        let mp = env.service.multipart();
        let upload = mp.create(&env.bucket, "up/obj.bin", None).await.unwrap();
        mp.upload_part(&env.bucket, &upload.id, "up/obj.bin", 1, b"part").await.unwrap();
        let node = env.file("up/obj.bin").await;

        env.backend.fail_removes(1);
        assert!(env.service.metadata().delete(&env.bucket, &node).await.is_err());
        assert_eq!(env.file("up/obj.bin").await, node);
        let kept = env.service.uploads().get(&upload.id).await.unwrap().unwrap();
        assert_eq!(kept.status, UploadStatus::Uploading);
        assert_eq!(kept.parts().unwrap().len(), 1);

        env.service.metadata().delete(&env.bucket, &node).await.unwrap();
        assert!(env.service.uploads().get(&upload.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_reset_keeps_open_uploads() {
        let env = TestEnv::new().await;
        let mp = env.service.multipart();
        let upload = mp.create(&env.bucket, "up/obj.bin", None).await.unwrap();
        mp.upload_part(&env.bucket, &upload.id, "up/obj.bin", 1, b"part").await.unwrap();

        env.backend.fail_removes(1);
        assert!(
            env.service
                .writer()
                .write_chunk(&env.bucket, "up/obj.bin", 0, b"new", true)
                .await
                .is_err()
        );
        assert_eq!(env.file("up/obj.bin").await.size_bytes, 4);
        assert!(env.service.uploads().get(&upload.id).await.unwrap().is_some());

        env.service
            .writer()
            .write_chunk(&env.bucket, "up/obj.bin", 0, b"new", true)
            .await
            .unwrap();
        assert!(env.service.uploads().get(&upload.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn share_settings() {
        let env = TestEnv::new().await;
        let node = env.put("shared.txt", b"x").await;
        let meta = env.service.metadata();

        let shared = meta
            .set_share(&env.bucket, &node, ShareCode::ReadOnly, 3, Some("pw"))
            .await
            .unwrap();
        assert!(shared.is_shared_and_in_window(Utc::now()));
        assert!(shared.share_time_limited);
        assert!(shared.check_share_password("pw"));

        let off = meta
            .set_share(&env.bucket, &node, ShareCode::ReadWrite, -1, None)
            .await
            .unwrap();
        assert_eq!(off.share_code, ShareCode::None);
        assert!(!off.is_shared_and_in_window(Utc::now()));
    }

    #[tokio::test]
    async fn download_count_increments() {
        let env = TestEnv::new().await;
        let node = env.put("d.txt", b"x").await;
        env.service.metadata().increment_download_count(node.id).await;
        env.service.metadata().increment_download_count(node.id).await;
        assert_eq!(env.file("d.txt").await.download_count, 2);
    }
}
