use super::{BackendError, BlobBackend, BlobStat, MAX_PART_SIZE, PartitionedBlobStore};
use bytes::Bytes;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::{Semaphore, SemaphorePermit};

/// A named pool with a bounded number of in-flight backend operations.
///
/// Every operation holds a semaphore permit for its duration; the permit is
/// dropped on all return paths, errors included.
#[derive(Clone)]
pub struct PoolHandle {
    name: Arc<str>,
    backend: Arc<dyn BlobBackend>,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("name", &self.name)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, BackendError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| BackendError::PoolClosed(self.name.to_string()))
    }

    pub async fn write(&self, part_id: &str, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let _permit = self.permit().await?;
        self.backend.write(part_id, offset, data).await
    }

    pub async fn read(&self, part_id: &str, offset: u64, len: u64) -> Result<Bytes, BackendError> {
        let _permit = self.permit().await?;
        self.backend.read(part_id, offset, len).await
    }

    pub async fn remove(&self, part_id: &str) -> Result<(), BackendError> {
        let _permit = self.permit().await?;
        self.backend.remove(part_id).await
    }

    pub async fn stat(&self, part_id: &str) -> Result<BlobStat, BackendError> {
        let _permit = self.permit().await?;
        self.backend.stat(part_id).await
    }
}

/// Process-wide pool lookup, built once from configuration and cloned into
/// every component that touches blobs.
#[derive(Clone, Debug)]
pub struct ClusterRegistry {
    pools: Arc<HashMap<String, PoolHandle>>,
    part_size: u64,
}

impl ClusterRegistry {
    pub fn builder(max_in_flight: usize) -> RegistryBuilder {
        RegistryBuilder {
            max_in_flight: max_in_flight.max(1),
            part_size: MAX_PART_SIZE,
            pools: HashMap::new(),
        }
    }

    pub fn open(&self, pool: &str) -> Result<PoolHandle, BackendError> {
        self.pools
            .get(pool)
            .cloned()
            .ok_or_else(|| BackendError::UnknownPool(pool.to_string()))
    }

    pub fn contains(&self, pool: &str) -> bool {
        self.pools.contains_key(pool)
    }

    /// Partitioned view over a pool.
    pub fn store(&self, pool: &str) -> Result<PartitionedBlobStore, BackendError> {
        Ok(PartitionedBlobStore::with_part_size(
            self.open(pool)?,
            self.part_size,
        ))
    }

    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }
}

pub struct RegistryBuilder {
    max_in_flight: usize,
    part_size: u64,
    pools: HashMap<String, PoolHandle>,
}

impl RegistryBuilder {
    pub fn pool(mut self, name: &str, backend: Arc<dyn BlobBackend>) -> Self {
        let handle = PoolHandle {
            name: Arc::from(name),
            backend,
            permits: Arc::new(Semaphore::new(self.max_in_flight)),
        };
        self.pools.insert(name.to_string(), handle);
        self
    }

    /// Override the part size. Only small test pools should need this.
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn build(self) -> ClusterRegistry {
        ClusterRegistry {
            pools: Arc::new(self.pools),
            part_size: self.part_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob::MemoryBackend;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn permits_are_released_after_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = ClusterRegistry::builder(2)
            .pool("mem", backend.clone())
            .build();
        let handle = registry.open("mem").unwrap();

        backend.fail_writes(3);
        for _ in 0..3 {
            assert!(handle.write("p", 0, b"x").await.is_err());
        }
        assert!(handle.read("p", 0, 1).await.is_err());
        assert_eq!(handle.available_permits(), 2);
        handle.write("p", 0, b"x").await.unwrap();
    }

    #[test]
    fn unknown_pool_is_reported() {
        let registry = ClusterRegistry::builder(1).build();
        assert_matches!(registry.open("nope"), Err(BackendError::UnknownPool(name)) if name == "nope");
    }
}
