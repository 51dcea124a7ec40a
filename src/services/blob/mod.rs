//! Blob pool access.
//!
//! A blob pool stores flat, named byte parts. Objects larger than one part
//! are split across parts by [`PartitionedBlobStore`]; pools are looked up by
//! name in a [`ClusterRegistry`] built once at start-up.

mod fs;
mod memory;
mod partition;
mod registry;

pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use partition::{
    MAX_PART_SIZE, PartitionedBlobStore, ReadTask, WriteTask, part_id, plan_read, plan_write,
};
pub use registry::{ClusterRegistry, PoolHandle, RegistryBuilder};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("blob part `{0}` not found")]
    NotFound(String),
    #[error("blob pool `{0}` is not registered")]
    UnknownPool(String),
    #[error("blob pool `{0}` is closed")]
    PoolClosed(String),
    #[error("blob operation on `{0}` failed")]
    Injected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Size and modification time of one stored part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Raw part storage of a single pool.
///
/// Implementations never split or pad data: `read` may return fewer bytes
/// than requested when the part is shorter, and report a missing part as
/// [`BackendError::NotFound`].
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Write `data` at `offset` inside `part_id`, extending it as needed.
    async fn write(&self, part_id: &str, offset: u64, data: &[u8]) -> Result<(), BackendError>;

    async fn read(&self, part_id: &str, offset: u64, len: u64) -> Result<Bytes, BackendError>;

    async fn remove(&self, part_id: &str) -> Result<(), BackendError>;

    async fn stat(&self, part_id: &str) -> Result<BlobStat, BackendError>;
}
