//! MultipartUploadCoordinator — S3 multipart uploads over chunked objects.
//!
//! Parts are written straight into the target object at
//! `(part_number - 1) * chunk_size`, where `chunk_size` is fixed once by the
//! first part that arrives. Completion is then usually a metadata update.
//! When the first arriving part was a last part larger than the others, the
//! stored layout has holes and completion recompacts the parts into a fresh
//! object. A short last part arriving first leaves overlapping parts, which
//! cannot be completed.

use crate::{
    config::EngineLimits,
    errors::{HarborError, HarborResult},
    models::{
        bucket::Bucket,
        multipart::{
            CompletedPart, MAX_PART_NUMBER, MIN_PART_NUMBER, MultipartUpload, PartInfo,
            UploadStatus, upsert_part,
        },
        object::{Node, ShareCode},
    },
    services::{
        blob::PartitionedBlobStore,
        directory::insert_node,
        hash::{RunningMd5, md5_hex, multipart_etag},
        metadata::{ObjectMetadataStore, raise_size},
        path,
        uploads::{UploadRepository, fetch_locked, lock_row, store_parts, to_i64},
    },
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_LIST_PARTS: u32 = 1000;

/// Outcome of a successful completion.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub upload_id: String,
    /// Composite S3 ETag, `{hex}-{part count}`.
    pub etag: String,
    pub node: Node,
    pub recompacted: bool,
}

#[derive(Debug, Clone)]
pub struct PartListing {
    pub upload: MultipartUpload,
    pub parts: Vec<PartInfo>,
    pub max_parts: u32,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// New upload id: microsecond timestamp in hex followed by a random uuid.
/// Ids of later uploads sort after earlier ones.
fn new_upload_id(now: DateTime<Utc>) -> String {
    format!(
        "{:016x}{}",
        now.timestamp_micros().max(0),
        Uuid::new_v4().simple()
    )
}

fn strip_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

#[derive(Clone)]
pub struct MultipartUploadCoordinator {
    db: Arc<SqlitePool>,
    metadata: ObjectMetadataStore,
    uploads: UploadRepository,
    limits: EngineLimits,
}

impl MultipartUploadCoordinator {
    pub fn new(db: Arc<SqlitePool>, metadata: ObjectMetadataStore, limits: EngineLimits) -> Self {
        Self {
            uploads: UploadRepository::new(db.clone()),
            db,
            metadata,
            limits,
        }
    }

    /// Start an upload for `key`.
    ///
    /// Any earlier upload of the key is dropped and an existing object is
    /// emptied. `acl` is an S3 canned ACL; non-private ACLs share the object.
    pub async fn create(
        &self,
        bucket: &Bucket,
        key: &str,
        acl: Option<&str>,
    ) -> HarborResult<MultipartUpload> {
        bucket.ensure_writable()?;
        let key = path::normalize(key);
        let share = match acl {
            None => ShareCode::None,
            Some(acl) => ShareCode::from_canned_acl(acl).ok_or_else(|| {
                HarborError::InvalidRequest(format!("unsupported acl `{}`", acl))
            })?,
        };

        let dropped = self.uploads.delete_for_key(bucket.id, &key).await?;
        if dropped > 0 {
            debug!(key = %key, dropped, "superseded earlier uploads");
        }

        let (mut node, created) = self.metadata.get_or_create_empty(bucket, &key).await?;
        if !created {
            node = self.metadata.reset_for_overwrite(bucket, &node).await?;
        }
        if share != ShareCode::None {
            node = self.metadata.set_share(bucket, &node, share, 0, None).await?;
        }

        let now = Utc::now();
        let upload = MultipartUpload {
            id: new_upload_id(now),
            bucket_id: bucket.id,
            bucket_name: bucket.name.clone(),
            key_hash: path::path_hash(&key),
            object_key: key,
            object_id: 0,
            object_etag: String::new(),
            share_code: share as i64,
            part_count: 0,
            parts_json: "[]".into(),
            chunk_size: 0,
            status: UploadStatus::Uploading,
            object_uploaded_at: node.created_at,
            created_at: now,
            expires_at: None,
            last_modified: now,
        };
        self.uploads.insert(&upload).await?;
        info!(bucket = %bucket.name, key = %upload.object_key, upload_id = %upload.id, "multipart upload created");
        Ok(upload)
    }

    /// Store one part and record it in the part map.
    pub async fn upload_part(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: &[u8],
    ) -> HarborResult<PartInfo> {
        bucket.ensure_writable()?;
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(HarborError::InvalidArgument(format!(
                "part number must be an integer between {} and {}",
                MIN_PART_NUMBER, MAX_PART_NUMBER
            )));
        }
        let size = data.len() as u64;
        if size == 0 {
            return Err(HarborError::EntityTooSmall("a part must not be empty".into()));
        }
        if size > self.limits.max_part_size {
            return Err(HarborError::EntityTooLarge(format!(
                "a part may be at most {} bytes",
                self.limits.max_part_size
            )));
        }

        let key = path::normalize(key);
        let upload = self.open_upload(bucket, upload_id, &key).await?;
        let node = self.metadata.get_file(bucket, &key).await?;
        let store = self.metadata.blobs(bucket)?;

        let chunk_size = self.fix_chunk_size(&upload, size).await?;
        let offset = u64::from(part_number - 1)
            .checked_mul(chunk_size)
            .ok_or_else(|| HarborError::InvalidArgument("part offset overflows".into()))?;

        let part = PartInfo {
            part_number,
            size,
            etag: md5_hex(data),
            last_modified: Utc::now(),
        };

        // Part map and object size change together under the row lock.
        let previous = {
            let mut tx = self.db.begin().await?;
            if !lock_row(&mut tx, upload_id, part.last_modified).await? {
                return Err(HarborError::NoSuchUpload(upload_id.to_string()));
            }
            let locked = fetch_locked(&mut tx, upload_id).await?;
            ensure_uploading(&locked)?;
            let mut parts = locked.parts()?;
            let previous = upsert_part(&mut parts, part.clone());
            store_parts(&mut tx, upload_id, &parts).await?;
            raise_size(&mut tx, node.id, offset + size, part.last_modified, Some("")).await?;
            tx.commit().await?;
            previous
        };

        if let Err(err) = store.write(&node.blob_id(), offset, data).await {
            warn!(
                upload_id,
                part_number,
                error = %err,
                "part write failed, reverting part map"
            );
            if let Err(rollback) = self
                .revert_part(upload_id, &node, &part, previous, chunk_size)
                .await
            {
                warn!(upload_id, part_number, error = %rollback, "part map revert failed");
            }
            return Err(HarborError::WriteFailed(err.to_string()));
        }

        debug!(upload_id, part_number, offset, size, "part stored");
        Ok(part)
    }

    /// The chunk size of the upload, fixed by whichever part lands first.
    ///
    /// A last part arriving early fixes a stride that completion later
    /// recompacts.
    async fn fix_chunk_size(&self, upload: &MultipartUpload, size: u64) -> HarborResult<u64> {
        if upload.chunk_size() > 0 {
            return Ok(upload.chunk_size());
        }
        if self.uploads.set_chunk_size_once(&upload.id, size).await? {
            debug!(upload_id = %upload.id, chunk_size = size, "chunk size fixed");
            return Ok(size);
        }
        // Lost the race; use the winner's value.
        let current = self
            .uploads
            .get(&upload.id)
            .await?
            .ok_or_else(|| HarborError::NoSuchUpload(upload.id.clone()))?;
        Ok(current.chunk_size())
    }

    async fn revert_part(
        &self,
        upload_id: &str,
        node: &Node,
        part: &PartInfo,
        previous: Option<PartInfo>,
        chunk_size: u64,
    ) -> HarborResult<()> {
        let mut tx = self.db.begin().await?;
        if !lock_row(&mut tx, upload_id, Utc::now()).await? {
            return Ok(());
        }
        let locked = fetch_locked(&mut tx, upload_id).await?;
        let mut parts = locked.parts()?;
        match previous {
            Some(previous) => {
                upsert_part(&mut parts, previous);
            }
            None => parts.retain(|p| !(p.part_number == part.part_number && p.etag == part.etag)),
        }
        store_parts(&mut tx, upload_id, &parts).await?;

        // Size recomputed from what the map still references.
        let covered = parts
            .iter()
            .map(|p| u64::from(p.part_number - 1) * chunk_size + p.size)
            .max()
            .unwrap_or(0);
        sqlx::query("UPDATE nodes SET size_bytes = ? WHERE id = ?")
            .bind(to_i64(covered)?)
            .bind(node.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Validate the declared part list and assemble the object.
    ///
    /// Any failure returns the upload to `uploading` so the client can fix
    /// and retry.
    pub async fn complete(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        key: &str,
        declared: &[CompletedPart],
    ) -> HarborResult<CompletedUpload> {
        bucket.ensure_writable()?;
        let key = path::normalize(key);
        let upload = self.owned_upload(bucket, upload_id, &key).await?;

        if !self
            .uploads
            .transition(upload_id, UploadStatus::Uploading, UploadStatus::Composing)
            .await?
        {
            return Err(match self.uploads.get(upload_id).await?.map(|u| u.status) {
                Some(UploadStatus::Composing) => HarborError::UploadInProgress(upload_id.to_string()),
                _ => HarborError::NoSuchUpload(upload_id.to_string()),
            });
        }
        // Re-read: parts cannot change once composing.
        let upload = self.uploads.get(upload_id).await?.unwrap_or(upload);

        match self.compose(bucket, &upload, declared).await {
            Ok(done) => {
                self.uploads
                    .mark_completed(upload_id, done.node.id, &done.etag)
                    .await?;
                info!(
                    bucket = %bucket.name,
                    key = %key,
                    upload_id,
                    etag = %done.etag,
                    recompacted = done.recompacted,
                    "multipart upload completed"
                );
                Ok(done)
            }
            Err(err) => {
                if let Err(revert) = self
                    .uploads
                    .transition(upload_id, UploadStatus::Composing, UploadStatus::Uploading)
                    .await
                {
                    warn!(upload_id, error = %revert, "failed to reopen upload after completion error");
                }
                Err(err)
            }
        }
    }

    async fn compose(
        &self,
        bucket: &Bucket,
        upload: &MultipartUpload,
        declared: &[CompletedPart],
    ) -> HarborResult<CompletedUpload> {
        let node = self.metadata.get_file(bucket, &upload.object_key).await?;
        let parts = upload.parts()?;
        validate_parts(&parts, declared, self.limits.min_part_size)?;

        let etag = multipart_etag(parts.iter().map(|p| p.etag.as_str()))?;
        let first = parts[0].size;
        let last = &parts[parts.len() - 1];
        let final_size = first * u64::from(last.part_number - 1) + last.size;
        let chunk_size = upload.chunk_size();

        if parts.len() == 1 || chunk_size == first {
            let node = self
                .metadata
                .finalize(bucket, node.id, final_size, &etag)
                .await?;
            return Ok(CompletedUpload {
                upload_id: upload.id.clone(),
                etag,
                node,
                recompacted: false,
            });
        }
        if chunk_size < first {
            return Err(HarborError::InvalidPart(
                "the last part was uploaded first and the stored parts overlap, upload the parts again"
                    .into(),
            ));
        }

        let node = self
            .recompact(bucket, upload, &node, &parts, chunk_size, final_size)
            .await?;
        Ok(CompletedUpload {
            upload_id: upload.id.clone(),
            etag,
            node,
            recompacted: true,
        })
    }

    /// Copy the parts from their `chunk_size` stride into a new object with
    /// the `parts[0].size` stride, then swap it in under the original name.
    async fn recompact(
        &self,
        bucket: &Bucket,
        upload: &MultipartUpload,
        node: &Node,
        parts: &[PartInfo],
        chunk_size: u64,
        final_size: u64,
    ) -> HarborResult<Node> {
        let store = self.metadata.blobs(bucket)?;
        let dirs = self.metadata.directories();
        let (parent_path, _) = path::split(&node.full_path);
        let parent = dirs.resolve(bucket, &parent_path).await?;
        let temp_name = format!(".{}.compose-{}", node.name, upload.id);
        let temp_path = path::join(&parent_path, &temp_name);

        if let Some(stale) = dirs.get_child(bucket, parent.id(), &temp_name).await? {
            self.metadata.delete(bucket, &stale).await?;
        }
        let temp = insert_node(&self.db, bucket.id, parent.id(), &temp_name, &temp_path, true, Utc::now())
            .await?
            .ok_or_else(|| HarborError::Internal(format!("could not create `{}`", temp_path)))?;
        info!(
            upload_id = %upload.id,
            from_stride = chunk_size,
            to_stride = parts[0].size,
            "recompacting multipart upload"
        );

        let copied = async {
            self.metadata
                .update_size_monotonic(temp.id, final_size, Utc::now(), None)
                .await?;
            let digest =
                copy_parts(&store, node, &temp, parts, chunk_size, self.limits.copy_block).await?;
            self.swap_in(node, &temp, final_size, &digest).await
        }
        .await;

        if let Err(err) = copied {
            warn!(upload_id = %upload.id, error = %err, "recompaction failed, removing temporary object");
            if let Ok(current) = self.metadata.get_by_id(bucket, temp.id).await {
                if let Err(cleanup) = self.metadata.delete(bucket, &current).await {
                    warn!(path = %temp_path, error = %cleanup, "failed to remove temporary object");
                }
            }
            return Err(err);
        }

        if let Err(err) = store.delete(&node.blob_id(), node.size()).await {
            warn!(blob = %node.blob_id(), error = %err, "old blob left behind after recompaction");
        }
        self.metadata.get_by_id(bucket, temp.id).await
    }

    /// Replace `old` by `temp` in one transaction.
    async fn swap_in(&self, old: &Node, temp: &Node, size: u64, digest: &str) -> HarborResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(old.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE nodes
             SET name = ?, full_path = ?, path_hash = ?, size_bytes = ?, content_hash = ?,
                 created_at = ?, modified_at = ?, share_code = ?, share_time_limited = ?,
                 share_expires_at = ?, share_password = ?
             WHERE id = ?",
        )
        .bind(&old.name)
        .bind(&old.full_path)
        .bind(&old.path_hash)
        .bind(to_i64(size)?)
        .bind(digest)
        .bind(old.created_at)
        .bind(Utc::now())
        .bind(old.share_code)
        .bind(old.share_time_limited)
        .bind(old.share_expires_at)
        .bind(&old.share_password)
        .bind(temp.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Cancel an upload. The object is removed too when it still holds the
    /// content generation this upload started.
    pub async fn abort(&self, bucket: &Bucket, upload_id: &str, key: &str) -> HarborResult<()> {
        bucket.ensure_writable()?;
        let key = path::normalize(key);
        let upload = self.owned_upload(bucket, upload_id, &key).await?;
        if !self
            .uploads
            .delete_if_status(upload_id, UploadStatus::Uploading)
            .await?
        {
            return Err(HarborError::NoSuchUpload(upload_id.to_string()));
        }

        if let Some(node) = self.metadata.directories().get_by_path(bucket, &key).await? {
            if node.is_file && node.created_at == upload.object_uploaded_at {
                self.metadata.delete(bucket, &node).await?;
            }
        }
        info!(bucket = %bucket.name, key = %key, upload_id, "multipart upload aborted");
        Ok(())
    }

    pub async fn list_parts(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        key: &str,
        part_number_marker: u32,
        max_parts: u32,
    ) -> HarborResult<PartListing> {
        bucket.ensure_readable()?;
        if !(1..=MAX_LIST_PARTS).contains(&max_parts) {
            return Err(HarborError::InvalidArgument(format!(
                "max-parts must be between 1 and {}",
                MAX_LIST_PARTS
            )));
        }
        if part_number_marker > MAX_PART_NUMBER {
            return Err(HarborError::InvalidArgument(format!(
                "part-number-marker must be between 0 and {}",
                MAX_PART_NUMBER
            )));
        }
        let upload = self.owned_upload(bucket, upload_id, &path::normalize(key)).await?;
        if upload.status == UploadStatus::Completed {
            return Err(HarborError::NoSuchUpload(upload_id.to_string()));
        }

        let mut parts: Vec<PartInfo> = upload
            .parts()?
            .into_iter()
            .filter(|p| p.part_number > part_number_marker)
            .take(max_parts as usize + 1)
            .collect();
        let is_truncated = parts.len() > max_parts as usize;
        parts.truncate(max_parts as usize);
        let next_part_number_marker = if is_truncated {
            parts.last().map(|p| p.part_number)
        } else {
            None
        };
        Ok(PartListing {
            upload,
            parts,
            max_parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    pub async fn list_uploads(
        &self,
        bucket: &Bucket,
        prefix: Option<&str>,
    ) -> HarborResult<Vec<MultipartUpload>> {
        bucket.ensure_readable()?;
        self.uploads
            .list_uploading(bucket.id, &bucket.name, prefix)
            .await
    }

    /// An upload of this bucket and key that is not completed.
    async fn owned_upload(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        key: &str,
    ) -> HarborResult<MultipartUpload> {
        match self.uploads.get(upload_id).await? {
            Some(upload)
                if upload.belongs_to(bucket.id, &bucket.name, key)
                    && upload.status != UploadStatus::Completed =>
            {
                Ok(upload)
            }
            _ => Err(HarborError::NoSuchUpload(upload_id.to_string())),
        }
    }

    /// An upload that still accepts parts.
    async fn open_upload(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        key: &str,
    ) -> HarborResult<MultipartUpload> {
        let upload = self.owned_upload(bucket, upload_id, key).await?;
        ensure_uploading(&upload)?;
        Ok(upload)
    }
}

fn ensure_uploading(upload: &MultipartUpload) -> HarborResult<()> {
    match upload.status {
        UploadStatus::Uploading => Ok(()),
        UploadStatus::Composing => Err(HarborError::UploadInProgress(upload.id.clone())),
        UploadStatus::Completed => Err(HarborError::NoSuchUpload(upload.id.clone())),
    }
}

/// Check the client's part list against the stored part map.
fn validate_parts(
    stored: &[PartInfo],
    declared: &[CompletedPart],
    min_part_size: u64,
) -> HarborResult<()> {
    if declared.is_empty() {
        return Err(HarborError::InvalidPart("at least one part is required".into()));
    }
    let mut previous = 0u32;
    for part in declared {
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part.part_number) {
            return Err(HarborError::InvalidPart(format!(
                "part number {} is out of range",
                part.part_number
            )));
        }
        if part.part_number <= previous {
            return Err(HarborError::InvalidPartOrder);
        }
        previous = part.part_number;
    }
    if stored.len() != declared.len() {
        return Err(HarborError::InvalidPart(format!(
            "{} parts were declared but {} were uploaded",
            declared.len(),
            stored.len()
        )));
    }
    for (index, (stored, declared)) in stored.iter().zip(declared).enumerate() {
        let expected = index as u32 + 1;
        if stored.part_number != expected || declared.part_number != expected {
            return Err(HarborError::InvalidPart(format!("part {} is missing", expected)));
        }
        if strip_quotes(&declared.etag) != stored.etag {
            return Err(HarborError::InvalidPart(format!(
                "etag of part {} does not match",
                expected
            )));
        }
    }

    let first = stored[0].size;
    for part in &stored[..stored.len() - 1] {
        if part.size < min_part_size {
            return Err(HarborError::EntityTooSmall(format!(
                "part {} is smaller than the minimum part size",
                part.part_number
            )));
        }
        if part.size != first {
            return Err(HarborError::InvalidPart(format!(
                "part {} differs in size from part 1",
                part.part_number
            )));
        }
    }
    Ok(())
}

/// Copy every part from stride `chunk_size` in `from` to stride
/// `parts[0].size` in `to`, returning the MD5 of the assembled object.
async fn copy_parts(
    store: &PartitionedBlobStore,
    from: &Node,
    to: &Node,
    parts: &[PartInfo],
    chunk_size: u64,
    block: u64,
) -> HarborResult<String> {
    let stride = parts[0].size;
    let mut hasher = RunningMd5::new();
    for part in parts {
        let src = u64::from(part.part_number - 1) * chunk_size;
        let dst = u64::from(part.part_number - 1) * stride;
        let mut copied = 0;
        while copied < part.size {
            let len = block.max(1).min(part.size - copied);
            let bytes = store.read(&from.blob_id(), src + copied, len).await?;
            store
                .write(&to.blob_id(), dst + copied, &bytes)
                .await
                .map_err(|err| HarborError::WriteFailed(err.to_string()))?;
            hasher.update(dst + copied, &bytes);
            copied += len;
        }
    }
    hasher
        .hex()
        .ok_or_else(|| HarborError::Internal("recompaction produced a non-sequential copy".into()))
}
