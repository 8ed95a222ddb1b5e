use crate::error::{is_unique_violation, map_db_error};
use crate::models::LockRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use taskledger_core::{InsertOutcome, LockRecord, LockStore, Result};

/// Lock documents in one table with a unique `(lock_key, region)` index.
#[derive(Clone)]
pub struct PgLockStore {
    pool: Pool<Postgres>,
    table: String,
}

impl PgLockStore {
    pub fn new(pool: Pool<Postgres>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn insert(&self, record: &LockRecord) -> Result<InsertOutcome> {
        let sql = format!(
            "INSERT INTO {} (id, lock_key, region, owner_id, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table
        );

        let inserted = sqlx::query(&sql)
            .bind(record.id())
            .bind(&record.lock_key)
            .bind(&record.region)
            .bind(&record.owner_id)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Duplicate),
            Err(err) => Err(map_db_error(err)),
        }
    }

    async fn take_over_stale(&self, candidate: &LockRecord, stale_before: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET owner_id = $1, created_at = $2, expires_at = $3 \
             WHERE lock_key = $4 AND region = $5 AND expires_at <= $6",
            self.table
        );

        let result = sqlx::query(&sql)
            .bind(&candidate.owner_id)
            .bind(candidate.created_at)
            .bind(candidate.expires_at)
            .bind(&candidate.lock_key)
            .bind(&candidate.region)
            .bind(stale_before)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew_owned(&self, candidate: &LockRecord) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET expires_at = $1 WHERE lock_key = $2 AND region = $3 AND owner_id = $4",
            self.table
        );

        let result = sqlx::query(&sql)
            .bind(candidate.expires_at)
            .bind(&candidate.lock_key)
            .bind(&candidate.region)
            .bind(&candidate.owner_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_owned(&self, lock_key: &str, region: &str, owner_id: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE lock_key = $1 AND region = $2 AND owner_id = $3",
            self.table
        );

        let result = sqlx::query(&sql)
            .bind(lock_key)
            .bind(region)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, lock_key: &str, region: &str) -> Result<Option<LockRecord>> {
        let sql = format!(
            "SELECT lock_key, region, owner_id, created_at, expires_at FROM {} \
             WHERE lock_key = $1 AND region = $2",
            self.table
        );

        let row = sqlx::query_as::<_, LockRow>(&sql)
            .bind(lock_key)
            .bind(region)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(row.map(LockRecord::from))
    }
}
