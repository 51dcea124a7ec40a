use super::{BackendError, BlobBackend, BlobStat};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

/// In-process pool backend.
///
/// Failures can be injected for the next N writes or removes, which lets
/// callers exercise retry and rollback paths.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    parts: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    failing_writes: AtomicUsize,
    failing_removes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail.
    pub fn fail_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` removes fail.
    pub fn fail_removes(&self, n: usize) {
        self.failing_removes.store(n, Ordering::SeqCst);
    }

    pub fn contains(&self, part_id: &str) -> bool {
        self.parts.lock().contains_key(part_id)
    }

    pub fn part_count(&self) -> usize {
        self.parts.lock().len()
    }

    /// Full contents of a part, if present.
    pub fn snapshot(&self, part_id: &str) -> Option<Vec<u8>> {
        self.parts.lock().get(part_id).map(|(data, _)| data.clone())
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn write(&self, part_id: &str, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(BackendError::Injected(part_id.to_string()));
        }
        let mut parts = self.parts.lock();
        let (bytes, modified_at) = parts
            .entry(part_id.to_string())
            .or_insert_with(|| (Vec::new(), Utc::now()));
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        *modified_at = Utc::now();
        Ok(())
    }

    async fn read(&self, part_id: &str, offset: u64, len: u64) -> Result<Bytes, BackendError> {
        let parts = self.parts.lock();
        let (bytes, _) = parts
            .get(part_id)
            .ok_or_else(|| BackendError::NotFound(part_id.to_string()))?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len as usize).min(bytes.len());
        Ok(Bytes::copy_from_slice(&bytes[start..end]))
    }

    async fn remove(&self, part_id: &str) -> Result<(), BackendError> {
        if Self::take_failure(&self.failing_removes) {
            return Err(BackendError::Injected(part_id.to_string()));
        }
        match self.parts.lock().remove(part_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(part_id.to_string())),
        }
    }

    async fn stat(&self, part_id: &str) -> Result<BlobStat, BackendError> {
        let parts = self.parts.lock();
        let (bytes, modified_at) = parts
            .get(part_id)
            .ok_or_else(|| BackendError::NotFound(part_id.to_string()))?;
        Ok(BlobStat {
            size: bytes.len() as u64,
            modified_at: *modified_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_writes(1);
        assert_matches!(backend.write("a", 0, b"x").await, Err(BackendError::Injected(_)));
        backend.write("a", 2, b"yz").await.unwrap();
        assert_eq!(backend.snapshot("a").unwrap(), vec![0, 0, b'y', b'z']);

        backend.fail_removes(1);
        assert!(backend.remove("a").await.is_err());
        backend.remove("a").await.unwrap();
        assert!(!backend.contains("a"));
    }
}
