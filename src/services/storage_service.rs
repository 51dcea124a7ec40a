//! StorageService — the handle handlers and tools hold.
//!
//! It owns the shared pieces (SQLite pool, blob registry, limits) and hands
//! out the component services built on them. Components are cheap to build;
//! each accessor returns a fresh one.

use crate::{
    config::EngineLimits,
    services::{
        blob::ClusterRegistry,
        bucket::BucketService,
        directory::DirectoryIndex,
        metadata::ObjectMetadataStore,
        multipart::MultipartUploadCoordinator,
        replication::ReplicationLedger,
        uploads::UploadRepository,
        write_engine::ChunkWriteEngine,
    },
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    pub registry: ClusterRegistry,

    pub limits: EngineLimits,

    /// Pool for buckets created without an explicit one.
    pub default_pool: String,

    /// Idle time after which a long completion emits keep-alive whitespace.
    pub heartbeat_idle: Duration,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        registry: ClusterRegistry,
        limits: EngineLimits,
        default_pool: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            limits,
            default_pool: default_pool.into(),
            heartbeat_idle: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat_idle(mut self, idle: Duration) -> Self {
        self.heartbeat_idle = idle;
        self
    }

    pub fn buckets(&self) -> BucketService {
        BucketService::new(self.db.clone(), self.registry.clone())
    }

    pub fn directories(&self) -> DirectoryIndex {
        DirectoryIndex::new(self.db.clone())
    }

    pub fn metadata(&self) -> ObjectMetadataStore {
        ObjectMetadataStore::new(self.db.clone(), self.registry.clone())
    }

    pub fn writer(&self) -> ChunkWriteEngine {
        ChunkWriteEngine::new(self.metadata(), self.limits)
    }

    pub fn uploads(&self) -> UploadRepository {
        UploadRepository::new(self.db.clone())
    }

    pub fn multipart(&self) -> MultipartUploadCoordinator {
        MultipartUploadCoordinator::new(self.db.clone(), self.metadata(), self.limits)
    }

    pub fn replication(&self) -> ReplicationLedger {
        ReplicationLedger::new(self.db.clone())
    }
}
