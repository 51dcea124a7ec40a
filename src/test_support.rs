//! Shared fixtures for unit tests: a migrated SQLite file in a temp dir, a
//! memory blob pool and one bucket owned by [`TEST_OWNER`].

use crate::{
    config::EngineLimits,
    db,
    models::{
        bucket::{AccessPermission, Bucket},
        object::Node,
    },
    services::{
        blob::{ClusterRegistry, MemoryBackend},
        storage_service::StorageService,
    },
};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_OWNER: i64 = 7;
pub const TEST_POOL: &str = "mem";

pub struct TestEnv {
    pub service: StorageService,
    pub bucket: Bucket,
    pub backend: Arc<MemoryBackend>,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_limits(EngineLimits::default()).await
    }

    pub async fn with_limits(limits: EngineLimits) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_file(&dir.path().join("meta.db"), 8).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let backend = Arc::new(MemoryBackend::new());
        let registry = ClusterRegistry::builder(32)
            .pool(TEST_POOL, backend.clone())
            .build();
        let service = StorageService::new(Arc::new(pool), registry, limits, TEST_POOL);
        let bucket = service
            .buckets()
            .create_bucket("test-bucket", TEST_OWNER, AccessPermission::Private, TEST_POOL)
            .await
            .unwrap();

        Self {
            service,
            bucket,
            backend,
            _dir: dir,
        }
    }

    /// Whole-object upload.
    pub async fn put(&self, path: &str, data: &[u8]) -> Node {
        self.service
            .writer()
            .put_object(&self.bucket, path, data)
            .await
            .unwrap()
    }

    pub async fn file(&self, path: &str) -> Node {
        self.service
            .metadata()
            .get_file(&self.bucket, path)
            .await
            .unwrap()
    }

    /// Raw blob content over the recorded size, without counting a download.
    pub async fn read_all(&self, node: &Node) -> Bytes {
        self.service
            .metadata()
            .blobs(&self.bucket)
            .unwrap()
            .read(&node.blob_id(), 0, node.size())
            .await
            .unwrap()
    }
}
