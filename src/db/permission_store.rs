//! Persistence for the `role_permissions` table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::row_parsers::permission_record_from_row;
use crate::errors::PermissionError;
use crate::models::permission::{PermissionKey, PermissionRecord};

/// Read/write surface the cache and matrix editor depend on.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Every row with `allowed = true`, across all roles.
    async fn fetch_allowed(&self) -> Result<Vec<PermissionRecord>, PermissionError>;

    /// Every row, granted or not.
    async fn fetch_all(&self) -> Result<Vec<PermissionRecord>, PermissionError>;

    /// Insert or update the row for `record.key()`. Safe to repeat.
    async fn upsert(&self, record: &PermissionRecord) -> Result<(), PermissionError>;
}

#[derive(Debug, Clone)]
pub struct SqlitePermissionStore {
    pool: SqlitePool,
}

impl SqlitePermissionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_where(&self, sql: &str) -> Result<Vec<PermissionRecord>, PermissionError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(permission_record_from_row).collect()
    }

    async fn exists(&self, record: &PermissionRecord) -> Result<bool, PermissionError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM role_permissions WHERE role_id = ? AND resource = ? AND action = ?)"
        )
        .bind(&record.role_id)
        .bind(&record.resource)
        .bind(&record.action)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn update_allowed(&self, record: &PermissionRecord) -> Result<(), PermissionError> {
        sqlx::query(
            "UPDATE role_permissions SET allowed = ?, updated_at = ? WHERE role_id = ? AND resource = ? AND action = ?"
        )
        .bind(record.allowed)
        .bind(Utc::now())
        .bind(&record.role_id)
        .bind(&record.resource)
        .bind(&record.action)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Plain insert. A duplicate key comes back as `ConflictOnWrite`.
    pub async fn insert(&self, record: &PermissionRecord) -> Result<(), PermissionError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO role_permissions (id, role_id, resource, action, allowed, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.role_id)
        .bind(&record.resource)
        .bind(&record.action)
        .bind(record.allowed)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(PermissionError::ConflictOnWrite {
                    role_id: record.role_id.clone(),
                    resource: record.resource.clone(),
                    action: record.action.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of persisted rows for a key; at most one while upserts are the only writer.
    pub async fn count_rows(&self, key: &PermissionKey) -> Result<i64, PermissionError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM role_permissions WHERE role_id = ? AND resource = ? AND action = ?"
        )
        .bind(&key.role_id)
        .bind(&key.resource)
        .bind(&key.action)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Second half of `upsert`. `known` is the result of the existence check,
    /// which may be stale by the time the write runs.
    async fn write(&self, record: &PermissionRecord, known: bool) -> Result<(), PermissionError> {
        if known {
            return self.update_allowed(record).await;
        }

        match self.insert(record).await {
            Ok(()) => Ok(()),
            Err(PermissionError::ConflictOnWrite { .. }) => {
                // Another writer inserted the key between our check and insert.
                tracing::debug!(
                    role_id = %record.role_id,
                    resource = %record.resource,
                    action = %record.action,
                    "insert conflicted, retrying as update"
                );
                self.update_allowed(record).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PermissionStore for SqlitePermissionStore {
    async fn fetch_allowed(&self) -> Result<Vec<PermissionRecord>, PermissionError> {
        self.fetch_where("SELECT role_id, resource, action, allowed FROM role_permissions WHERE allowed = 1")
            .await
    }

    async fn fetch_all(&self) -> Result<Vec<PermissionRecord>, PermissionError> {
        self.fetch_where("SELECT role_id, resource, action, allowed FROM role_permissions ORDER BY role_id, resource, action")
            .await
    }

    async fn upsert(&self, record: &PermissionRecord) -> Result<(), PermissionError> {
        let known = self.exists(record).await?;
        self.write(record, known).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqlitePermissionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect");
        sqlx::migrate!().run(&pool).await.expect("migrate");
        SqlitePermissionStore::new(pool)
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row() {
        let store = store().await;
        let record = PermissionRecord::new("it", "settings", "email-config", true);

        store.upsert(&record).await.unwrap();
        store.upsert(&record).await.unwrap();

        assert_eq!(store.count_rows(&record.key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_updates_allowed_flag() {
        let store = store().await;
        store.upsert(&PermissionRecord::new("sales", "case", "view", true)).await.unwrap();
        store.upsert(&PermissionRecord::new("sales", "case", "view", false)).await.unwrap();

        assert!(store.fetch_allowed().await.unwrap().is_empty());
        let all = store.fetch_all().await.unwrap();
        assert_eq!(all, vec![PermissionRecord::new("sales", "case", "view", false)]);
    }

    #[tokio::test]
    async fn duplicate_insert_reports_conflict() {
        let store = store().await;
        let record = PermissionRecord::new("it", "settings", "system", true);
        store.insert(&record).await.unwrap();

        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, PermissionError::ConflictOnWrite { .. }));
    }

    #[tokio::test]
    async fn stale_existence_check_falls_back_to_update() {
        let store = store().await;
        store.insert(&PermissionRecord::new("sales", "case", "view", true)).await.unwrap();

        // A concurrent writer landed the row after our check said it was missing.
        let revoke = PermissionRecord::new("sales", "case", "view", false);
        store.write(&revoke, false).await.unwrap();

        assert_eq!(store.count_rows(&revoke.key()).await.unwrap(), 1);
        assert_eq!(store.fetch_all().await.unwrap(), vec![revoke]);
    }

    #[tokio::test]
    async fn fetch_allowed_spans_roles() {
        let store = store().await;
        store.upsert(&PermissionRecord::new("sales", "case", "view", true)).await.unwrap();
        store.upsert(&PermissionRecord::new("it", "settings", "system", true)).await.unwrap();
        store.upsert(&PermissionRecord::new("driver", "case", "view", false)).await.unwrap();

        let mut roles: Vec<String> = store
            .fetch_allowed()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.role_id)
            .collect();
        roles.sort();
        assert_eq!(roles, vec!["it".to_string(), "sales".to_string()]);
    }

    #[tokio::test]
    async fn closed_pool_is_store_unavailable() {
        let store = store().await;
        store.pool().close().await;

        let err = store.fetch_allowed().await.unwrap_err();
        assert!(matches!(err, PermissionError::StoreUnavailable(_)));
    }
}
