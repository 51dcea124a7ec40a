use super::{BackendError, PoolHandle};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Largest size of a single stored part (2 GiB).
pub const MAX_PART_SIZE: u64 = 1 << 31;

/// One slice of a logical write mapped onto a single part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTask {
    pub part_id: String,
    /// Offset inside the part.
    pub part_offset: u64,
    /// Range of the caller's buffer that lands in this part.
    pub slice_start: usize,
    pub slice_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTask {
    pub part_id: String,
    pub part_offset: u64,
    pub len: u64,
}

/// Part 0 is named after the object itself, part N is `{object_id}_{N}`.
pub fn part_id(object_id: &str, index: u64) -> String {
    if index == 0 {
        object_id.to_string()
    } else {
        format!("{}_{}", object_id, index)
    }
}

/// Split `[offset, offset + len)` of an object into per-part slices.
///
/// A byte at an exact part boundary belongs to the part that starts there.
/// A zero-length write yields no tasks.
pub fn plan_write(object_id: &str, offset: u64, len: usize, part_size: u64) -> Vec<WriteTask> {
    let end = offset.saturating_add(len as u64);
    let mut tasks = Vec::new();
    let mut cursor = offset;
    while cursor < end {
        let index = cursor / part_size;
        let part_end = (index + 1).saturating_mul(part_size);
        let stop = end.min(part_end);
        tasks.push(WriteTask {
            part_id: part_id(object_id, index),
            part_offset: cursor - index * part_size,
            slice_start: (cursor - offset) as usize,
            slice_end: (stop - offset) as usize,
        });
        cursor = stop;
    }
    tasks
}

pub fn plan_read(object_id: &str, offset: u64, len: u64, part_size: u64) -> Vec<ReadTask> {
    plan_write(object_id, offset, len as usize, part_size)
        .into_iter()
        .map(|task| ReadTask {
            part_id: task.part_id,
            part_offset: task.part_offset,
            len: (task.slice_end - task.slice_start) as u64,
        })
        .collect()
}

/// Number of parts an object of `size` bytes occupies (at least one).
fn part_count(size: u64, part_size: u64) -> u64 {
    size.div_ceil(part_size).max(1)
}

/// Logical objects of unbounded size over a pool of bounded parts.
#[derive(Clone, Debug)]
pub struct PartitionedBlobStore {
    handle: PoolHandle,
    part_size: u64,
}

impl PartitionedBlobStore {
    pub fn new(handle: PoolHandle) -> Self {
        Self::with_part_size(handle, MAX_PART_SIZE)
    }

    pub fn with_part_size(handle: PoolHandle, part_size: u64) -> Self {
        Self {
            handle,
            part_size: part_size.max(1),
        }
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Write `data` at `offset`.
    ///
    /// Each part slice is retried once. Slices already written stay written
    /// when a later slice fails.
    pub async fn write(&self, object_id: &str, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        for task in plan_write(object_id, offset, data.len(), self.part_size) {
            let slice = &data[task.slice_start..task.slice_end];
            debug!(
                part_id = %task.part_id,
                part_offset = task.part_offset,
                len = slice.len(),
                "writing part slice"
            );
            if let Err(err) = self.handle.write(&task.part_id, task.part_offset, slice).await {
                warn!(part_id = %task.part_id, error = %err, "part write failed, retrying once");
                self.handle
                    .write(&task.part_id, task.part_offset, slice)
                    .await?;
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes. Missing parts and unwritten tails read as zeros.
    pub async fn read(&self, object_id: &str, offset: u64, len: u64) -> Result<Bytes, BackendError> {
        let mut out = BytesMut::with_capacity(len as usize);
        for task in plan_read(object_id, offset, len, self.part_size) {
            let target = out.len() + task.len as usize;
            match self.handle.read(&task.part_id, task.part_offset, task.len).await {
                Ok(bytes) => {
                    let take = bytes.len().min(task.len as usize);
                    out.extend_from_slice(&bytes[..take]);
                }
                Err(err) if err.is_not_found() => {
                    debug!(part_id = %task.part_id, "part absent, zero-filling");
                }
                Err(err) => return Err(err),
            }
            out.resize(target, 0);
        }
        Ok(out.freeze())
    }

    /// Remove every part of an object of `size` bytes, highest part first.
    /// Parts that are already gone count as removed.
    pub async fn delete(&self, object_id: &str, size: u64) -> Result<(), BackendError> {
        for index in (0..part_count(size, self.part_size)).rev() {
            let id = part_id(object_id, index);
            match self.handle.remove(&id).await {
                Ok(()) => debug!(part_id = %id, "removed part"),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob::{ClusterRegistry, MemoryBackend};
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn store(part_size: u64) -> (Arc<MemoryBackend>, PartitionedBlobStore) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = ClusterRegistry::builder(4)
            .part_size(part_size)
            .pool("mem", backend.clone())
            .build();
        (backend, registry.store("mem").unwrap())
    }

    #[test]
    fn boundary_offset_belongs_to_next_part() {
        let tasks = plan_write("3_9", MAX_PART_SIZE, 10, MAX_PART_SIZE);
        assert_eq!(
            tasks,
            vec![WriteTask {
                part_id: "3_9_1".into(),
                part_offset: 0,
                slice_start: 0,
                slice_end: 10,
            }]
        );
    }

    #[test]
    fn write_spanning_boundary_is_split() {
        let tasks = plan_write("o", MAX_PART_SIZE - 4, 10, MAX_PART_SIZE);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].part_id, "o");
        assert_eq!(tasks[0].part_offset, MAX_PART_SIZE - 4);
        assert_eq!((tasks[0].slice_start, tasks[0].slice_end), (0, 4));
        assert_eq!(tasks[1].part_id, "o_1");
        assert_eq!(tasks[1].part_offset, 0);
        assert_eq!((tasks[1].slice_start, tasks[1].slice_end), (4, 10));
    }

    #[test]
    fn empty_write_has_no_tasks() {
        assert!(plan_write("o", 123, 0, MAX_PART_SIZE).is_empty());
    }

    #[tokio::test]
    async fn reads_zero_fill_missing_and_short_parts() {
        let (_backend, store) = store(8);
        store.write("o", 2, b"abc").await.unwrap();
        // part 1 never written, part 0 holds 5 bytes
        let bytes = store.read("o", 0, 20).await.unwrap();
        let mut expected = vec![0u8; 20];
        expected[2..5].copy_from_slice(b"abc");
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[tokio::test]
    async fn writes_across_parts_round_trip() {
        let (backend, store) = store(4);
        store.write("o", 3, b"0123456789").await.unwrap();
        assert_eq!(backend.snapshot("o").unwrap(), vec![0, 0, 0, b'0']);
        assert_eq!(backend.snapshot("o_1").unwrap(), b"1234".to_vec());
        assert_eq!(backend.snapshot("o_2").unwrap(), b"5678".to_vec());
        assert_eq!(backend.snapshot("o_3").unwrap(), b"9".to_vec());
        assert_eq!(&store.read("o", 3, 10).await.unwrap()[..], b"0123456789");
    }

    #[tokio::test]
    async fn a_failed_slice_is_retried_once() {
        let (backend, store) = store(8);
        backend.fail_writes(1);
        store.write("o", 0, b"ok").await.unwrap();
        assert_eq!(backend.snapshot("o").unwrap(), b"ok".to_vec());

        backend.fail_writes(2);
        assert_matches!(
            store.write("p", 0, b"no").await,
            Err(BackendError::Injected(_))
        );
        assert!(!backend.contains("p"));
    }

    #[tokio::test]
    async fn delete_tolerates_absent_parts() {
        let (backend, store) = store(4);
        store.write("o", 0, b"0123").await.unwrap();
        store.write("o", 8, b"89").await.unwrap();
        store.delete("o", 10).await.unwrap();
        assert_eq!(backend.part_count(), 0);
        store.delete("o", 0).await.unwrap();
    }

    proptest! {
        #[test]
        fn plan_covers_the_range_contiguously(offset in 0u64..10_000, len in 0usize..5_000, part in 1u64..700) {
            let tasks = plan_write("x", offset, len, part);
            let mut expected_start = 0usize;
            for task in &tasks {
                prop_assert_eq!(task.slice_start, expected_start);
                prop_assert!(task.slice_end > task.slice_start);
                let span = (task.slice_end - task.slice_start) as u64;
                prop_assert!(task.part_offset + span <= part);
                expected_start = task.slice_end;
            }
            prop_assert_eq!(expected_start, len);
        }
    }
}
