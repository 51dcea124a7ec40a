//! ChunkWriteEngine — positioned writes into objects.
//!
//! Every chunk goes through the same sequence: the object's size is raised
//! in metadata first, then the bytes are written to the blob. A failed blob
//! write rolls the metadata back (or removes a freshly created object) and
//! surfaces `WriteFailed`.

use crate::{
    config::EngineLimits,
    errors::{HarborError, HarborResult},
    models::{bucket::Bucket, object::Node},
    services::{
        blob::PartitionedBlobStore,
        hash::{RunningMd5, md5_hex},
        metadata::ObjectMetadataStore,
    },
};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

/// Result of a single `write_chunk` call.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub node: Node,
    pub created: bool,
}

#[derive(Clone)]
pub struct ChunkWriteEngine {
    metadata: ObjectMetadataStore,
    limits: EngineLimits,
}

impl ChunkWriteEngine {
    pub fn new(metadata: ObjectMetadataStore, limits: EngineLimits) -> Self {
        Self { metadata, limits }
    }

    /// Write `data` at `offset` of the object at `file_path`.
    ///
    /// Creates the object and its ancestor directories when missing. With
    /// `reset`, a pre-existing object is emptied before the write.
    pub async fn write_chunk(
        &self,
        bucket: &Bucket,
        file_path: &str,
        offset: u64,
        data: &[u8],
        reset: bool,
    ) -> HarborResult<WriteOutcome> {
        bucket.ensure_writable()?;
        let store = self.metadata.blobs(bucket)?;
        let (mut node, created) = self.metadata.get_or_create_empty(bucket, file_path).await?;
        if reset && !created {
            node = self.metadata.reset_for_overwrite(bucket, &node).await?;
        }

        // The digest of the chunk is the digest of the object only when the
        // object was empty and the chunk starts at 0.
        let digest = if created || reset {
            (offset == 0).then(|| md5_hex(data)).unwrap_or_default()
        } else {
            String::new()
        };

        if let Err(err) = self
            .save_chunk(&store, &node, offset, data, Some(&digest))
            .await
        {
            if created {
                self.discard_created(bucket, &node).await;
            }
            return Err(err);
        }

        let node = self.metadata.get_by_id(bucket, node.id).await?;
        Ok(WriteOutcome { node, created })
    }

    /// Start a sequential streaming write. Existing objects are reset.
    pub async fn open_session(&self, bucket: &Bucket, file_path: &str) -> HarborResult<WriteSession> {
        bucket.ensure_writable()?;
        let store = self.metadata.blobs(bucket)?;
        let (mut node, created) = self.metadata.get_or_create_empty(bucket, file_path).await?;
        if !created {
            node = self.metadata.reset_for_overwrite(bucket, &node).await?;
        }
        Ok(WriteSession {
            engine: self.clone(),
            bucket: bucket.clone(),
            store,
            node,
            created,
            hasher: RunningMd5::new(),
        })
    }

    /// Whole-object upload in one buffer.
    pub async fn put_object(&self, bucket: &Bucket, file_path: &str, data: &[u8]) -> HarborResult<Node> {
        let mut session = self.open_session(bucket, file_path).await?;
        if let Err(err) = session.write_next(0, data).await {
            session.abort().await?;
            return Err(err);
        }
        session.finish().await
    }

    /// Read `len` bytes at `offset` of a file, clamped to its recorded size.
    ///
    /// Unwritten ranges read as zeros. Reads starting at 0 count as downloads.
    pub async fn read_range(
        &self,
        bucket: &Bucket,
        node: &Node,
        offset: u64,
        len: u64,
    ) -> HarborResult<Bytes> {
        bucket.ensure_readable()?;
        if !node.is_file {
            return Err(HarborError::NoSuchKey(node.full_path.clone()));
        }
        if len > self.limits.max_read_size {
            return Err(HarborError::InvalidArgument(format!(
                "a single read is limited to {} bytes",
                self.limits.max_read_size
            )));
        }
        let size = node.size();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let len = len.min(size - offset);
        let bytes = self
            .metadata
            .blobs(bucket)?
            .read(&node.blob_id(), offset, len)
            .await?;
        if offset == 0 {
            self.metadata.increment_download_count(node.id).await;
        }
        Ok(bytes)
    }

    pub fn metadata(&self) -> &ObjectMetadataStore {
        &self.metadata
    }

    /// metadata-update → blob-write, with rollback of the metadata on failure.
    async fn save_chunk(
        &self,
        store: &PartitionedBlobStore,
        node: &Node,
        offset: u64,
        data: &[u8],
        content_hash: Option<&str>,
    ) -> HarborResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| HarborError::InvalidArgument("write range overflows".into()))?;
        if !self
            .metadata
            .update_size_monotonic(node.id, end, Utc::now(), content_hash)
            .await?
        {
            return Err(HarborError::NoSuchKey(node.full_path.clone()));
        }

        if let Err(err) = store.write(&node.blob_id(), offset, data).await {
            warn!(
                path = %node.full_path,
                offset,
                len = data.len(),
                error = %err,
                "blob write failed, rolling back size"
            );
            if let Err(rollback) = self.metadata.restore_snapshot(node).await {
                warn!(path = %node.full_path, error = %rollback, "size rollback failed");
            }
            return Err(HarborError::WriteFailed(err.to_string()));
        }
        debug!(path = %node.full_path, offset, len = data.len(), "chunk written");
        Ok(())
    }

    async fn discard_created(&self, bucket: &Bucket, node: &Node) {
        if let Err(err) = self.metadata.delete(bucket, node).await {
            warn!(path = %node.full_path, error = %err, "failed to discard object after write failure");
        }
    }
}

/// A sequential write into one object.
///
/// `write_next` may be called repeatedly; a failed chunk leaves the session
/// open so the same chunk can be sent again. The session ends with `finish`,
/// which records the content hash, or `abort`, which discards a newly
/// created object.
pub struct WriteSession {
    engine: ChunkWriteEngine,
    bucket: Bucket,
    store: PartitionedBlobStore,
    node: Node,
    created: bool,
    hasher: RunningMd5,
}

impl WriteSession {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub async fn write_next(&mut self, offset: u64, data: &[u8]) -> HarborResult<()> {
        self.engine
            .save_chunk(&self.store, &self.node, offset, data, Some(""))
            .await?;
        let end = offset + data.len() as u64;
        if end > self.node.size() {
            self.node.size_bytes = end as i64;
        }
        self.node.content_hash.clear();
        self.hasher.update(offset, data);
        Ok(())
    }

    /// Store the running digest (empty when writes were not sequential).
    pub async fn finish(self) -> HarborResult<Node> {
        let digest = self.hasher.hex().unwrap_or_default();
        let metadata = self.engine.metadata();
        metadata.set_content_hash(self.node.id, &digest).await?;
        metadata.get_by_id(&self.bucket, self.node.id).await
    }

    pub async fn abort(self) -> HarborResult<()> {
        if self.created {
            let node = self
                .engine
                .metadata()
                .get_by_id(&self.bucket, self.node.id)
                .await?;
            self.engine.metadata().delete(&self.bucket, &node).await?;
        }
        Ok(())
    }
}
