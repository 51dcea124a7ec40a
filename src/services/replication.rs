//! Bookkeeping for external replicators.
//!
//! Every file has two sync slots (`async1`, `async2`). A replicator owns one
//! slot, copies files whose slot is unset or older than their last change,
//! and records the time it synced them.

use crate::{
    errors::HarborResult,
    models::{
        bucket::Bucket,
        object::{NODE_COLUMNS, Node},
    },
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSlot {
    First,
    Second,
}

impl SyncSlot {
    fn column(self) -> &'static str {
        match self {
            SyncSlot::First => "async1",
            SyncSlot::Second => "async2",
        }
    }
}

#[derive(Clone)]
pub struct ReplicationLedger {
    db: Arc<SqlitePool>,
}

impl ReplicationLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Files with `id > id_gt` that `slot` has not synced since their last
    /// modification, in id order.
    pub async fn need_async_objects(
        &self,
        bucket: &Bucket,
        slot: SyncSlot,
        id_gt: i64,
        limit: i64,
    ) -> HarborResult<Vec<Node>> {
        let column = slot.column();
        let sql = format!(
            "SELECT {columns} FROM nodes
             WHERE bucket_id = ? AND is_file = 1 AND soft_deleted = 0 AND id > ?
               AND ({column} IS NULL OR {column} <= modified_at)
             ORDER BY id ASC
             LIMIT ?",
            columns = NODE_COLUMNS,
            column = column
        );
        Ok(sqlx::query_as::<_, Node>(&sql)
            .bind(bucket.id)
            .bind(id_gt)
            .bind(limit.clamp(1, 1000))
            .fetch_all(&*self.db)
            .await?)
    }

    /// Record that `slot` holds the content of `node_id` as of `synced_at`.
    pub async fn mark_synced(
        &self,
        bucket: &Bucket,
        node_id: i64,
        slot: SyncSlot,
        synced_at: DateTime<Utc>,
    ) -> HarborResult<bool> {
        let sql = format!(
            "UPDATE nodes SET {} = ? WHERE id = ? AND bucket_id = ?",
            slot.column()
        );
        let result = sqlx::query(&sql)
            .bind(synced_at)
            .bind(node_id)
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use chrono::Duration;

    #[tokio::test]
    async fn synced_files_drop_out_until_modified() {
        let env = TestEnv::new().await;
        let ledger = env.service.replication();
        let a = env.put("r/a", b"1").await;
        let b = env.put("r/b", b"2").await;

        let pending = ledger.need_async_objects(&env.bucket, SyncSlot::First, 0, 10).await.unwrap();
        assert_eq!(pending.iter().map(|n| n.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        let later = Utc::now() + Duration::seconds(60);
        assert!(ledger.mark_synced(&env.bucket, a.id, SyncSlot::First, later).await.unwrap());
        let pending = ledger.need_async_objects(&env.bucket, SyncSlot::First, 0, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);

        // The other slot is independent.
        let pending = ledger.need_async_objects(&env.bucket, SyncSlot::Second, a.id - 1, 10).await.unwrap();
        assert_eq!(pending.len(), 2);

        let paged = ledger.need_async_objects(&env.bucket, SyncSlot::Second, a.id, 10).await.unwrap();
        assert_eq!(paged[0].id, b.id);
    }
}
