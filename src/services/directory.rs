//! DirectoryIndex — the directory tree of a bucket over the `nodes` table.
//!
//! Paths are resolved segment by segment. Every row is unique per
//! `(bucket_id, parent_id, name)` among live nodes, so a file and a
//! directory can never share a name under one parent.

use crate::{
    errors::{HarborError, HarborResult},
    models::{
        bucket::Bucket,
        object::{NODE_COLUMNS, Node, ROOT_PARENT_ID},
    },
    services::path,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};

/// A resolved directory location.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The virtual bucket root; it has no row.
    Root,
    Dir(Node),
}

impl Resolved {
    /// `parent_id` for children of this location.
    pub fn id(&self) -> i64 {
        match self {
            Self::Root => ROOT_PARENT_ID,
            Self::Dir(node) => node.id,
        }
    }

    pub fn full_path(&self) -> &str {
        match self {
            Self::Root => "",
            Self::Dir(node) => &node.full_path,
        }
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone)]
pub struct DirListing {
    pub entries: Vec<Node>,
    pub total: i64,
}

#[derive(Clone)]
pub struct DirectoryIndex {
    db: Arc<SqlitePool>,
}

impl DirectoryIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Direct lookup by full path, without checking the ancestors.
    pub async fn get_by_path(&self, bucket: &Bucket, full_path: &str) -> HarborResult<Option<Node>> {
        let sql = format!(
            "SELECT {} FROM nodes
             WHERE bucket_id = ? AND path_hash = ? AND full_path = ? AND soft_deleted = 0",
            NODE_COLUMNS
        );
        let normalized = path::normalize(full_path);
        Ok(sqlx::query_as::<_, Node>(&sql)
            .bind(bucket.id)
            .bind(path::path_hash(&normalized))
            .bind(&normalized)
            .fetch_optional(&*self.db)
            .await?)
    }

    pub async fn get_by_id(&self, bucket: &Bucket, id: i64) -> HarborResult<Option<Node>> {
        let sql = format!(
            "SELECT {} FROM nodes WHERE bucket_id = ? AND id = ? AND soft_deleted = 0",
            NODE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Node>(&sql)
            .bind(bucket.id)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?)
    }

    pub async fn get_child(
        &self,
        bucket: &Bucket,
        parent_id: i64,
        name: &str,
    ) -> HarborResult<Option<Node>> {
        let sql = format!(
            "SELECT {} FROM nodes
             WHERE bucket_id = ? AND parent_id = ? AND name = ? AND soft_deleted = 0",
            NODE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Node>(&sql)
            .bind(bucket.id)
            .bind(parent_id)
            .bind(name)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Resolve a directory path.
    ///
    /// The empty path is the root. A missing segment, or a segment that is a
    /// file, fails with `NoSuchParentPath`.
    pub async fn resolve(&self, bucket: &Bucket, dir_path: &str) -> HarborResult<Resolved> {
        let mut current = Resolved::Root;
        for (name, _) in path::breadcrumb(dir_path) {
            match self.get_child(bucket, current.id(), &name).await? {
                Some(node) if node.is_dir() => current = Resolved::Dir(node),
                _ => return Err(HarborError::NoSuchParentPath(path::normalize(dir_path))),
            }
        }
        Ok(current)
    }

    /// Create every missing directory of `dir_path`, root to leaf.
    ///
    /// Concurrent callers converge on the same rows: an insert that loses a
    /// race is discarded and the winner's row is read back. A segment that
    /// is an existing file fails with `NameConflict`.
    pub async fn ensure_path(&self, bucket: &Bucket, dir_path: &str) -> HarborResult<Resolved> {
        let mut current = Resolved::Root;
        for (name, cumulative) in path::breadcrumb(dir_path) {
            path::validate_leaf(&name)?;
            let existing = match self.get_child(bucket, current.id(), &name).await? {
                Some(node) => node,
                None => {
                    let now = Utc::now();
                    match insert_node(&self.db, bucket.id, current.id(), &name, &cumulative, false, now)
                        .await?
                    {
                        Some(created) => {
                            debug!(bucket = %bucket.name, path = %cumulative, "created directory");
                            created
                        }
                        None => self
                            .get_child(bucket, current.id(), &name)
                            .await?
                            .ok_or_else(|| {
                                HarborError::Internal(format!(
                                    "directory `{}` vanished during creation",
                                    cumulative
                                ))
                            })?,
                    }
                }
            };
            if existing.is_file {
                return Err(HarborError::NameConflict(cumulative));
            }
            current = Resolved::Dir(existing);
        }
        Ok(current)
    }

    /// Create one directory. The parent must already exist.
    pub async fn mkdir(&self, bucket: &Bucket, dir_path: &str) -> HarborResult<Node> {
        bucket.ensure_writable()?;
        let (parent_path, name) = path::split(dir_path);
        path::validate_leaf(&name)?;
        let parent = self.resolve(bucket, &parent_path).await?;
        let full_path = path::join(&parent_path, &name);

        if let Some(existing) = self.get_child(bucket, parent.id(), &name).await? {
            return Err(if existing.is_dir() {
                HarborError::DirectoryAlreadyExists(full_path)
            } else {
                HarborError::ObjectKeyAlreadyExists(full_path)
            });
        }

        match insert_node(&self.db, bucket.id, parent.id(), &name, &full_path, false, Utc::now())
            .await?
        {
            Some(node) => {
                info!(bucket = %bucket.name, path = %full_path, "mkdir");
                Ok(node)
            }
            None => Err(HarborError::SameKeyAlreadyExists(full_path)),
        }
    }

    /// Remove an empty directory. Metadata only; directories own no blob.
    pub async fn rmdir(&self, bucket: &Bucket, dir_path: &str) -> HarborResult<()> {
        bucket.ensure_writable()?;
        let normalized = path::normalize(dir_path);
        let node = match self.get_by_path(bucket, &normalized).await? {
            Some(node) if node.is_dir() => node,
            _ => return Err(HarborError::NoSuchKey(normalized)),
        };
        if self.child_count(bucket, node.id).await? > 0 {
            return Err(HarborError::NoEmptyDir(normalized));
        }
        let result = sqlx::query(
            "DELETE FROM nodes WHERE id = ? AND bucket_id = ?
             AND NOT EXISTS (SELECT 1 FROM nodes c
                             WHERE c.bucket_id = ? AND c.parent_id = ? AND c.soft_deleted = 0)",
        )
        .bind(node.id)
        .bind(bucket.id)
        .bind(bucket.id)
        .bind(node.id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HarborError::NoEmptyDir(normalized));
        }
        info!(bucket = %bucket.name, path = %normalized, "rmdir");
        Ok(())
    }

    pub async fn child_count(&self, bucket: &Bucket, parent_id: i64) -> HarborResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM nodes WHERE bucket_id = ? AND parent_id = ? AND soft_deleted = 0",
        )
        .bind(bucket.id)
        .bind(parent_id)
        .fetch_one(&*self.db)
        .await?)
    }

    /// Move `node` under `move_to` and/or rename it.
    ///
    /// The target parent must be an existing directory and must not already
    /// hold a node of the new name. Moving a directory rewrites the paths of
    /// its whole subtree in the same transaction.
    pub async fn move_or_rename(
        &self,
        bucket: &Bucket,
        node: &Node,
        move_to: Option<&str>,
        rename: Option<&str>,
    ) -> HarborResult<Node> {
        bucket.ensure_writable()?;
        if move_to.is_none() && rename.is_none() {
            return Err(HarborError::InvalidRequest(
                "either a target directory or a new name is required".into(),
            ));
        }
        let new_name = match rename {
            Some(name) => {
                path::validate_leaf(name)?;
                name.to_string()
            }
            None => node.name.clone(),
        };

        let parent = match move_to {
            Some(target) => {
                let target = path::normalize(target);
                if node.is_dir()
                    && (target == node.full_path || target.starts_with(&format!("{}/", node.full_path)))
                {
                    return Err(HarborError::InvalidRequest(format!(
                        "cannot move `{}` into itself",
                        node.full_path
                    )));
                }
                self.resolve(bucket, &target).await?
            }
            None => {
                let (parent_path, _) = path::split(&node.full_path);
                self.resolve(bucket, &parent_path).await?
            }
        };

        let new_path = path::join(parent.full_path(), &new_name);
        if new_path == node.full_path {
            return Ok(node.clone());
        }
        if self.get_child(bucket, parent.id(), &new_name).await?.is_some() {
            return Err(HarborError::SameKeyAlreadyExists(new_path));
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            "UPDATE nodes SET parent_id = ?, name = ?, full_path = ?, path_hash = ?, modified_at = ?
             WHERE id = ? AND bucket_id = ? AND soft_deleted = 0",
        )
        .bind(parent.id())
        .bind(&new_name)
        .bind(&new_path)
        .bind(path::path_hash(&new_path))
        .bind(now)
        .bind(node.id)
        .bind(bucket.id)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if crate::db::is_unique_violation(&err) {
                HarborError::SameKeyAlreadyExists(new_path.clone())
            } else {
                HarborError::from(err)
            }
        })?;
        if result.rows_affected() == 0 {
            return Err(HarborError::NoSuchKey(node.full_path.clone()));
        }
        if node.is_dir() {
            rewrite_subtree(&mut tx, bucket.id, &node.full_path, &new_path).await?;
        }
        tx.commit().await?;

        info!(bucket = %bucket.name, from = %node.full_path, to = %new_path, "moved node");
        self.get_by_id(bucket, node.id)
            .await?
            .ok_or_else(|| HarborError::NoSuchKey(new_path))
    }

    /// Children of a directory, directories first, then by name.
    pub async fn list_dir(
        &self,
        bucket: &Bucket,
        dir_path: &str,
        offset: i64,
        limit: i64,
    ) -> HarborResult<DirListing> {
        bucket.ensure_readable()?;
        let dir = self.resolve(bucket, dir_path).await?;
        let total = self.child_count(bucket, dir.id()).await?;
        let sql = format!(
            "SELECT {} FROM nodes
             WHERE bucket_id = ? AND parent_id = ? AND soft_deleted = 0
             ORDER BY is_file ASC, name ASC
             LIMIT ? OFFSET ?",
            NODE_COLUMNS
        );
        let entries = sqlx::query_as::<_, Node>(&sql)
            .bind(bucket.id)
            .bind(dir.id())
            .bind(limit.clamp(1, 1000))
            .bind(offset.max(0))
            .fetch_all(&*self.db)
            .await?;
        Ok(DirListing { entries, total })
    }
}

/// Insert a node unless a live sibling of the same name exists.
/// `None` means the insert lost to an existing row.
pub(crate) async fn insert_node(
    db: &SqlitePool,
    bucket_id: i64,
    parent_id: i64,
    name: &str,
    full_path: &str,
    is_file: bool,
    now: DateTime<Utc>,
) -> HarborResult<Option<Node>> {
    let sql = format!(
        "INSERT INTO nodes (bucket_id, parent_id, name, full_path, path_hash, is_file,
                            size_bytes, content_hash, created_at, modified_at)
         VALUES (?, ?, ?, ?, ?, ?, 0, '', ?, ?)
         ON CONFLICT DO NOTHING
         RETURNING {}",
        NODE_COLUMNS
    );
    Ok(sqlx::query_as::<_, Node>(&sql)
        .bind(bucket_id)
        .bind(parent_id)
        .bind(name)
        .bind(full_path)
        .bind(path::path_hash(full_path))
        .bind(is_file)
        .bind(now)
        .bind(now)
        .fetch_optional(db)
        .await?)
}

async fn rewrite_subtree(
    conn: &mut SqliteConnection,
    bucket_id: i64,
    old_prefix: &str,
    new_prefix: &str,
) -> HarborResult<()> {
    let old_with_sep = format!("{}/", old_prefix);
    let descendants: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, full_path FROM nodes
         WHERE bucket_id = ? AND substr(full_path, 1, ?) = ? AND soft_deleted = 0",
    )
    .bind(bucket_id)
    .bind(old_with_sep.chars().count() as i64)
    .bind(&old_with_sep)
    .fetch_all(&mut *conn)
    .await?;

    for (id, full_path) in descendants {
        let rewritten = format!("{}/{}", new_prefix, &full_path[old_with_sep.len()..]);
        sqlx::query("UPDATE nodes SET full_path = ?, path_hash = ? WHERE id = ?")
            .bind(&rewritten)
            .bind(path::path_hash(&rewritten))
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn ensure_path_is_idempotent() {
        let env = TestEnv::new().await;
        let dirs = env.service.directories();

        let first = dirs.ensure_path(&env.bucket, "a/b/c").await.unwrap();
        let second = dirs.ensure_path(&env.bucket, "/a/b/c/").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.full_path(), "a/b/c");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE bucket_id = ?")
            .bind(env.bucket.id)
            .fetch_one(&*env.service.db)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn concurrent_ensure_path_creates_each_directory_once() {
        let env = TestEnv::new().await;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let dirs = env.service.directories();
            let bucket = env.bucket.clone();
            tasks.push(tokio::spawn(async move {
                dirs.ensure_path(&bucket, "x/y/z").await.map(|r| r.id())
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE bucket_id = ? AND name = 'z'")
                .bind(env.bucket.id)
                .fetch_one(&*env.service.db)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn paths_through_files_are_rejected() {
        let env = TestEnv::new().await;
        env.put("a/b", b"file").await;
        let dirs = env.service.directories();

        assert_matches!(
            dirs.mkdir(&env.bucket, "a/b/c").await,
            Err(HarborError::NoSuchParentPath(_))
        );
        assert_matches!(
            dirs.ensure_path(&env.bucket, "a/b/c").await,
            Err(HarborError::NameConflict(path)) if path == "a/b"
        );
        assert_matches!(
            dirs.resolve(&env.bucket, "a/b").await,
            Err(HarborError::NoSuchParentPath(_))
        );
    }

    #[tokio::test]
    async fn mkdir_reports_the_colliding_kind() {
        let env = TestEnv::new().await;
        let dirs = env.service.directories();
        dirs.mkdir(&env.bucket, "docs").await.unwrap();
        env.put("notes", b"n").await;

        assert_matches!(
            dirs.mkdir(&env.bucket, "docs").await,
            Err(HarborError::DirectoryAlreadyExists(_))
        );
        assert_matches!(
            dirs.mkdir(&env.bucket, "notes").await,
            Err(HarborError::ObjectKeyAlreadyExists(_))
        );
        assert_matches!(
            dirs.mkdir(&env.bucket, "missing/child").await,
            Err(HarborError::NoSuchParentPath(_))
        );
    }

    #[tokio::test]
    async fn rmdir_requires_an_empty_directory() {
        let env = TestEnv::new().await;
        let dirs = env.service.directories();
        env.put("docs/readme.md", b"hi").await;

        assert_matches!(
            dirs.rmdir(&env.bucket, "docs").await,
            Err(HarborError::NoEmptyDir(_))
        );
        assert_matches!(
            dirs.rmdir(&env.bucket, "docs/readme.md").await,
            Err(HarborError::NoSuchKey(_))
        );

        let file = env.file("docs/readme.md").await;
        env.service.metadata().delete(&env.bucket, &file).await.unwrap();
        dirs.rmdir(&env.bucket, "docs").await.unwrap();
        assert!(dirs.get_by_path(&env.bucket, "docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn moving_a_directory_rewrites_descendants() {
        let env = TestEnv::new().await;
        let dirs = env.service.directories();
        env.put("src/lib/mod.rs", b"x").await;
        dirs.mkdir(&env.bucket, "archive").await.unwrap();

        let src = dirs.get_by_path(&env.bucket, "src").await.unwrap().unwrap();
        let moved = dirs
            .move_or_rename(&env.bucket, &src, Some("archive"), Some("old-src"))
            .await
            .unwrap();
        assert_eq!(moved.full_path, "archive/old-src");

        let file = env.file("archive/old-src/lib/mod.rs").await;
        assert_eq!(file.path_hash, path::path_hash("archive/old-src/lib/mod.rs"));
        assert!(dirs.get_by_path(&env.bucket, "src/lib/mod.rs").await.unwrap().is_none());

        let archive = dirs.get_by_path(&env.bucket, "archive").await.unwrap().unwrap();
        assert_matches!(
            dirs.move_or_rename(&env.bucket, &archive, Some("archive/old-src"), None).await,
            Err(HarborError::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn rename_onto_existing_name_fails() {
        let env = TestEnv::new().await;
        env.put("a.txt", b"a").await;
        env.put("b.txt", b"b").await;
        let a = env.file("a.txt").await;

        assert_matches!(
            env.service
                .directories()
                .move_or_rename(&env.bucket, &a, None, Some("b.txt"))
                .await,
            Err(HarborError::SameKeyAlreadyExists(_))
        );
        assert_matches!(
            env.service
                .directories()
                .move_or_rename(&env.bucket, &a, Some("nowhere"), None)
                .await,
            Err(HarborError::NoSuchParentPath(_))
        );
    }

    #[tokio::test]
    async fn listing_orders_directories_first() {
        let env = TestEnv::new().await;
        env.put("z-dir/inner", b"1").await;
        env.put("a-file", b"1").await;
        env.put("m-file", b"1").await;

        let listing = env
            .service
            .directories()
            .list_dir(&env.bucket, "", 0, 10)
            .await
            .unwrap();
        let names: Vec<&str> = listing.entries.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["z-dir", "a-file", "m-file"]);
        assert_eq!(listing.total, 3);

        let page = env
            .service
            .directories()
            .list_dir(&env.bucket, "", 1, 1)
            .await
            .unwrap();
        assert_eq!(page.entries[0].name, "a-file");
    }
}
