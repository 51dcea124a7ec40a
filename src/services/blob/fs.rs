use super::{BackendError, BlobBackend, BlobStat};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    io::{ErrorKind, SeekFrom},
    path::PathBuf,
};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

/// Pool backend keeping one file per part under `root/{shard}/{shard}/`.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Two-level shard identifiers from MD5(part_id), 00–ff each.
    fn part_path(&self, part_id: &str) -> PathBuf {
        let digest = md5::compute(part_id);
        let mut path = self.root.clone();
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(part_id);
        path
    }
}

fn map_not_found(err: std::io::Error, part_id: &str) -> BackendError {
    if err.kind() == ErrorKind::NotFound {
        BackendError::NotFound(part_id.to_string())
    } else {
        BackendError::Io(err)
    }
}

#[async_trait]
impl BlobBackend for FsBackend {
    async fn write(&self, part_id: &str, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let path = self.part_path(part_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;
        debug!(part_id, offset, len = data.len(), "wrote part slice");
        Ok(())
    }

    async fn read(&self, part_id: &str, offset: u64, len: u64) -> Result<Bytes, BackendError> {
        let path = self.part_path(part_id);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| map_not_found(err, part_id))?;
        let file_len = file.metadata().await?.len();
        if offset >= file_len {
            return Ok(Bytes::new());
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let wanted = len.min(file_len - offset) as usize;
        let mut buf = BytesMut::zeroed(wanted);
        let mut filled = 0;
        while filled < wanted {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    async fn remove(&self, part_id: &str) -> Result<(), BackendError> {
        fs::remove_file(self.part_path(part_id))
            .await
            .map_err(|err| map_not_found(err, part_id))
    }

    async fn stat(&self, part_id: &str) -> Result<BlobStat, BackendError> {
        let meta = fs::metadata(self.part_path(part_id))
            .await
            .map_err(|err| map_not_found(err, part_id))?;
        let modified_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(BlobStat {
            size: meta.len(),
            modified_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn writes_at_offsets_and_reads_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());

        backend.write("1_7", 4, b"tail").await.unwrap();
        backend.write("1_7", 0, b"head").await.unwrap();

        let all = backend.read("1_7", 0, 100).await.unwrap();
        assert_eq!(&all[..], b"headtail");
        let none = backend.read("1_7", 8, 10).await.unwrap();
        assert!(none.is_empty());
        assert_eq!(backend.stat("1_7").await.unwrap().size, 8);
    }

    #[tokio::test]
    async fn missing_parts_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());

        assert_matches!(
            backend.read("missing", 0, 1).await,
            Err(BackendError::NotFound(_))
        );
        assert_matches!(backend.remove("missing").await, Err(BackendError::NotFound(_)));

        backend.write("present", 0, b"x").await.unwrap();
        backend.remove("present").await.unwrap();
        assert_matches!(backend.stat("present").await, Err(BackendError::NotFound(_)));
    }
}
