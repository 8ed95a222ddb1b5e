use crate::error::map_db_error;
use crate::models::{ExecutionRow, ParameterRow};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::PgArguments;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::Arc;
use taskledger_core::{
    Clock, CollectionNames, Error, ExecutionRecord, ExecutionRepository, NewExecution, Page,
    PageRequest, Result, SequenceGenerator, validate_task_name,
};

const EXECUTION_COLUMNS: &str = "execution_id, task_name, start_time, end_time, exit_code, \
     exit_message, error_message, last_updated, external_execution_id, parent_execution_id";

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const NEWEST_FIRST: &str = "ORDER BY start_time DESC, execution_id DESC";

#[derive(Clone)]
pub struct PgExecutionRepository {
    pool: Pool<Postgres>,
    names: CollectionNames,
    sequence: Arc<dyn SequenceGenerator>,
    clock: Arc<dyn Clock>,
}

impl PgExecutionRepository {
    pub fn new(
        pool: Pool<Postgres>,
        names: CollectionNames,
        sequence: Arc<dyn SequenceGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            names,
            sequence,
            clock,
        }
    }

    fn select_executions(&self, filter: &str) -> String {
        format!(
            "SELECT {} FROM {} {} {}",
            EXECUTION_COLUMNS, self.names.executions, filter, NEWEST_FIRST
        )
    }

    /// Attach ordered arguments to each row with one extra round-trip.
    async fn with_arguments(&self, rows: Vec<ExecutionRow>) -> Result<Vec<ExecutionRecord>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.execution_id).collect();
        let sql = format!(
            "SELECT execution_id, value FROM {} WHERE execution_id = ANY($1) \
             ORDER BY execution_id, position",
            self.names.parameters
        );
        let parameters = sqlx::query_as::<_, ParameterRow>(&sql)
            .bind(&ids[..])
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;

        let mut arguments: HashMap<i64, Vec<String>> = HashMap::new();
        for parameter in parameters {
            arguments
                .entry(parameter.execution_id)
                .or_default()
                .push(parameter.value);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let args = arguments.remove(&row.execution_id).unwrap_or_default();
                row.into_record(args)
            })
            .collect())
    }

    /// Run an update that must touch exactly the row for `execution_id`.
    async fn update_one(&self, execution_id: i64, query: PgQuery<'_>) -> Result<()> {
        let result = query.execute(&self.pool).await.map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(execution_id));
        }
        Ok(())
    }

    async fn count_where(&self, filter: &str, task_name: Option<&str>) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} {}", self.names.executions, filter);
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(task_name) = task_name {
            query = query.bind(task_name);
        }
        query.fetch_one(&self.pool).await.map_err(map_db_error)
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    async fn create(&self, execution: NewExecution) -> Result<ExecutionRecord> {
        execution.validate()?;

        let execution_id = self.sequence.next().await?;
        let mut record = execution.into_record(execution_id, self.clock.now());
        // TIMESTAMPTZ keeps microseconds; return what a later read will see.
        record.start_time = record.start_time.trunc_subsecs(6);
        record.last_updated = record.last_updated.trunc_subsecs(6);

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, NULL, NULL, NULL, NULL, $4, $5, $6)",
            self.names.executions, EXECUTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(record.execution_id)
            .bind(&record.task_name)
            .bind(record.start_time)
            .bind(record.last_updated)
            .bind(&record.external_execution_id)
            .bind(record.parent_execution_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        // Not transactional with the insert above.
        let sql = format!(
            "INSERT INTO {} (execution_id, position, value) VALUES ($1, $2, $3)",
            self.names.parameters
        );
        for (position, value) in record.arguments.iter().enumerate() {
            sqlx::query(&sql)
                .bind(execution_id)
                .bind(position as i32)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?;
        }

        tracing::debug!(execution_id, task_name = %record.task_name, "Created task execution");
        Ok(record)
    }

    async fn complete(
        &self,
        execution_id: i64,
        exit_code: i32,
        end_time: DateTime<Utc>,
        exit_message: Option<String>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET end_time = $1, exit_code = $2, exit_message = $3, last_updated = $4 \
             WHERE execution_id = $5",
            self.names.executions
        );
        let query = sqlx::query(&sql)
            .bind(end_time)
            .bind(exit_code)
            .bind(exit_message)
            .bind(self.clock.now())
            .bind(execution_id);

        self.update_one(execution_id, query).await
    }

    async fn update_error(&self, execution_id: i64, error_message: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET error_message = $1, last_updated = $2 WHERE execution_id = $3",
            self.names.executions
        );
        let query = sqlx::query(&sql)
            .bind(error_message)
            .bind(self.clock.now())
            .bind(execution_id);

        self.update_one(execution_id, query).await
    }

    async fn update_external_execution_id(
        &self,
        execution_id: i64,
        external_execution_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET external_execution_id = $1, last_updated = $2 WHERE execution_id = $3",
            self.names.executions
        );
        let query = sqlx::query(&sql)
            .bind(external_execution_id)
            .bind(self.clock.now())
            .bind(execution_id);

        self.update_one(execution_id, query).await
    }

    async fn find_by_id(&self, execution_id: i64) -> Result<Option<ExecutionRecord>> {
        let sql = self.select_executions("WHERE execution_id = $1");
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;

        match row {
            Some(row) => Ok(self.with_arguments(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_by_name(&self, task_name: &str, page: PageRequest) -> Result<Page<ExecutionRecord>> {
        validate_task_name(task_name)?;

        let sql = format!("{} LIMIT $2 OFFSET $3", self.select_executions("WHERE task_name = $1"));
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(task_name)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;

        let total = self.count_by_name(task_name).await?;

        Ok(Page {
            items: self.with_arguments(rows).await?,
            total,
            page: page.page(),
            page_size: page.page_size(),
        })
    }

    async fn find_all(&self, page: PageRequest) -> Result<Page<ExecutionRecord>> {
        let sql = format!("{} LIMIT $1 OFFSET $2", self.select_executions(""));
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;

        let total = self.count().await?;

        Ok(Page {
            items: self.with_arguments(rows).await?,
            total,
            page: page.page(),
            page_size: page.page_size(),
        })
    }

    async fn find_running(&self, task_name: &str) -> Result<Vec<ExecutionRecord>> {
        validate_task_name(task_name)?;
        let sql = self.select_executions("WHERE task_name = $1 AND end_time IS NULL");
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(task_name)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;

        self.with_arguments(rows).await
    }

    async fn find_children(&self, parent_execution_id: i64) -> Result<Vec<ExecutionRecord>> {
        let sql = self.select_executions("WHERE parent_execution_id = $1");
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(parent_execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;

        self.with_arguments(rows).await
    }

    async fn latest_by_name(&self, task_name: &str) -> Result<Option<ExecutionRecord>> {
        validate_task_name(task_name)?;
        let sql = format!("{} LIMIT 1", self.select_executions("WHERE task_name = $1"));
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(task_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;

        match row {
            Some(row) => Ok(self.with_arguments(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn count(&self) -> Result<i64> {
        self.count_where("", None).await
    }

    async fn count_by_name(&self, task_name: &str) -> Result<i64> {
        self.count_where("WHERE task_name = $1", Some(task_name)).await
    }

    async fn count_running_by_name(&self, task_name: &str) -> Result<i64> {
        self.count_where("WHERE task_name = $1 AND end_time IS NULL", Some(task_name))
            .await
    }

    async fn task_names(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT task_name FROM {} ORDER BY task_name",
            self.names.executions
        );
        sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)
    }

    async fn associate_batch_job(&self, execution_id: i64, batch_job_id: i64) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (execution_id, batch_job_id) VALUES ($1, $2)",
            self.names.batch_associations
        );
        sqlx::query(&sql)
            .bind(execution_id)
            .bind(batch_job_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(())
    }

    async fn batch_job_ids(&self, execution_id: i64) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT batch_job_id FROM {} WHERE execution_id = $1 ORDER BY id",
            self.names.batch_associations
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)
    }

    async fn execution_id_for_batch_job(&self, batch_job_id: i64) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT execution_id FROM {} WHERE batch_job_id = $1 ORDER BY id LIMIT 1",
            self.names.batch_associations
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(batch_job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)
    }
}
