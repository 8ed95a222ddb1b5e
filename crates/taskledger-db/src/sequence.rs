use crate::error::map_db_error;
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use taskledger_core::{Result, SequenceGenerator, SEQUENCE_KEY};

/// Counter stored as one row keyed by `task_seq`, bumped with a single upsert.
#[derive(Clone)]
pub struct PgSequenceGenerator {
    pool: Pool<Postgres>,
    table: String,
}

impl PgSequenceGenerator {
    pub fn new(pool: Pool<Postgres>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

pub(crate) fn next_value_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} AS s (id, value) VALUES ($1, 1) \
         ON CONFLICT (id) DO UPDATE SET value = s.value + 1 \
         RETURNING value"
    )
}

#[async_trait]
impl SequenceGenerator for PgSequenceGenerator {
    async fn next(&self) -> Result<i64> {
        let sql = next_value_sql(&self.table);
        let value = sqlx::query_scalar::<_, i64>(&sql)
            .bind(SEQUENCE_KEY)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(value)
    }
}
