use assert_matches::assert_matches;
use harbor_store::{
    config::EngineLimits,
    db,
    errors::HarborError,
    models::{
        bucket::{AccessPermission, Bucket},
        multipart::CompletedPart,
    },
    services::{
        blob::{ClusterRegistry, FsBackend},
        bucket::Access,
        hash::md5_hex,
        storage_service::StorageService,
    },
};
use std::sync::Arc;
use tempfile::TempDir;

const OWNER: i64 = 42;

async fn setup(limits: EngineLimits) -> (StorageService, Bucket, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::connect_file(&dir.path().join("meta.db"), 8).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    // Migrations are idempotent.
    db::run_migrations(&pool).await.unwrap();

    let registry = ClusterRegistry::builder(8)
        .pool("disk", Arc::new(FsBackend::new(dir.path().join("blobs"))))
        .part_size(16)
        .build();
    let service = StorageService::new(Arc::new(pool), registry, limits, "disk");
    let bucket = service
        .buckets()
        .create_bucket("flow-bucket", OWNER, AccessPermission::Private, "disk")
        .await
        .unwrap();
    (service, bucket, dir)
}

async fn read_all(service: &StorageService, bucket: &Bucket, path: &str) -> Vec<u8> {
    let node = service.metadata().get_file(bucket, path).await.unwrap();
    service
        .writer()
        .read_range(bucket, &node, 0, node.size())
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn chunk_writes_with_a_hole_read_back_zero_filled() {
    let (service, bucket, _dir) = setup(EngineLimits::default()).await;
    let writer = service.writer();

    let later = writer
        .write_chunk(&bucket, "logs/app.log", 20, b"tail", false)
        .await
        .unwrap();
    assert!(later.created);
    assert_eq!(later.node.size_bytes, 24);

    let head = writer
        .write_chunk(&bucket, "logs/app.log", 0, b"head", false)
        .await
        .unwrap();
    assert!(!head.created);
    assert_eq!(head.node.size_bytes, 24);

    let mut expected = b"head".to_vec();
    expected.extend_from_slice(&[0u8; 16]);
    expected.extend_from_slice(b"tail");
    assert_eq!(read_all(&service, &bucket, "logs/app.log").await, expected);

    let listing = service
        .directories()
        .list_dir(&bucket, "logs", 0, 10)
        .await
        .unwrap();
    assert_eq!(listing.total, 1);
    assert_eq!(listing.entries[0].name, "app.log");
}

#[tokio::test]
async fn last_part_first_upload_completes_with_recompaction() {
    let (service, bucket, _dir) = setup(EngineLimits {
        min_part_size: 5,
        ..EngineLimits::default()
    })
    .await;
    let mp = service.multipart();
    let upload = mp.create(&bucket, "media/clip.bin", None).await.unwrap();

    let p3 = mp
        .upload_part(&bucket, &upload.id, "media/clip.bin", 3, b"333333333")
        .await
        .unwrap();
    let p1 = mp
        .upload_part(&bucket, &upload.id, "media/clip.bin", 1, b"11111")
        .await
        .unwrap();
    let p2 = mp
        .upload_part(&bucket, &upload.id, "media/clip.bin", 2, b"22222")
        .await
        .unwrap();

    let declared: Vec<CompletedPart> = [&p1, &p2, &p3]
        .iter()
        .map(|p| CompletedPart {
            part_number: p.part_number,
            etag: format!("\"{}\"", p.etag),
        })
        .collect();
    let done = mp
        .complete(&bucket, &upload.id, "media/clip.bin", &declared)
        .await
        .unwrap();

    assert!(done.recompacted);
    assert!(done.etag.ends_with("-3"));
    assert_eq!(done.node.size_bytes, 19);
    assert_eq!(done.node.content_hash, md5_hex(b"1111122222333333333"));
    assert_eq!(
        read_all(&service, &bucket, "media/clip.bin").await,
        b"1111122222333333333"
    );
    assert!(mp.list_uploads(&bucket, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn directories_cannot_be_created_through_files() {
    let (service, bucket, _dir) = setup(EngineLimits::default()).await;
    service
        .writer()
        .put_object(&bucket, "a/b", b"file")
        .await
        .unwrap();

    let dirs = service.directories();
    assert_matches!(
        dirs.mkdir(&bucket, "a/b/c").await,
        Err(HarborError::NoSuchParentPath(_))
    );
    assert_matches!(
        service.writer().put_object(&bucket, "a/b/c/d.txt", b"x").await,
        Err(HarborError::NameConflict(_))
    );
    assert_matches!(
        dirs.mkdir(&bucket, "a/b").await,
        Err(HarborError::ObjectKeyAlreadyExists(_))
    );
    dirs.mkdir(&bucket, "a/c").await.unwrap();
    assert_matches!(
        dirs.mkdir(&bucket, "a/c").await,
        Err(HarborError::DirectoryAlreadyExists(_))
    );
}

#[tokio::test]
async fn whole_object_lifecycle_on_disk() {
    let (service, bucket, _dir) = setup(EngineLimits::default()).await;
    let body: Vec<u8> = (0..100u8).collect();

    let node = service
        .writer()
        .put_object(&bucket, "docs/report.pdf", &body)
        .await
        .unwrap();
    assert_eq!(node.content_hash, md5_hex(&body));
    assert_eq!(read_all(&service, &bucket, "docs/report.pdf").await, body);

    let replaced = service
        .writer()
        .put_object(&bucket, "docs/report.pdf", b"short")
        .await
        .unwrap();
    assert_eq!(replaced.id, node.id);
    assert_eq!(replaced.size_bytes, 5);
    assert_eq!(read_all(&service, &bucket, "docs/report.pdf").await, b"short");

    let moved = service
        .directories()
        .move_or_rename(&bucket, &replaced, None, Some("final.pdf"))
        .await
        .unwrap();
    assert_eq!(moved.full_path, "docs/final.pdf");
    assert_eq!(read_all(&service, &bucket, "docs/final.pdf").await, b"short");

    service.metadata().delete(&bucket, &moved).await.unwrap();
    service.directories().rmdir(&bucket, "docs").await.unwrap();
    assert_matches!(
        service.metadata().get_file(&bucket, "docs/final.pdf").await,
        Err(HarborError::NoSuchKey(_))
    );
}

#[tokio::test]
async fn strangers_cannot_reach_private_buckets() {
    let (service, bucket, _dir) = setup(EngineLimits::default()).await;
    let buckets = service.buckets();
    assert_matches!(
        buckets.resolve(bucket.name.as_str(), Some(OWNER + 1), Access::Read).await,
        Err(HarborError::AccessDenied)
    );
    let mine = buckets
        .resolve(bucket.name.as_str(), Some(OWNER), Access::Write)
        .await
        .unwrap();
    assert_eq!(mine.id, bucket.id);
}
