use crate::execution::{ExecutionRecord, NewExecution, Page, PageRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence of execution records, their arguments and batch-job links.
///
/// None of these operations retry; store failures surface as
/// `Error::Transport`.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Allocate an identifier, write the record with no end time, then write
    /// its arguments in order. The writes are not transactional: a crash in
    /// between leaves a record with missing arguments.
    async fn create(&self, execution: NewExecution) -> crate::Result<ExecutionRecord>;

    /// Mark an execution finished. Fails with `NotFound` for an unknown id.
    /// A second call overwrites the first.
    async fn complete(
        &self,
        execution_id: i64,
        exit_code: i32,
        end_time: DateTime<Utc>,
        exit_message: Option<String>,
    ) -> crate::Result<()>;

    async fn update_error(&self, execution_id: i64, error_message: &str) -> crate::Result<()>;

    async fn update_external_execution_id(
        &self,
        execution_id: i64,
        external_execution_id: &str,
    ) -> crate::Result<()>;

    async fn find_by_id(&self, execution_id: i64) -> crate::Result<Option<ExecutionRecord>>;

    /// One page of a task's executions, newest first, with the total count.
    async fn find_by_name(
        &self,
        task_name: &str,
        page: PageRequest,
    ) -> crate::Result<Page<ExecutionRecord>>;

    async fn find_all(&self, page: PageRequest) -> crate::Result<Page<ExecutionRecord>>;

    /// Executions of `task_name` that have no end time yet. Includes orphans
    /// left behind by crashed instances; nothing here reaps them.
    async fn find_running(&self, task_name: &str) -> crate::Result<Vec<ExecutionRecord>>;

    async fn find_children(&self, parent_execution_id: i64) -> crate::Result<Vec<ExecutionRecord>>;

    async fn latest_by_name(&self, task_name: &str) -> crate::Result<Option<ExecutionRecord>>;

    async fn count(&self) -> crate::Result<i64>;

    async fn count_by_name(&self, task_name: &str) -> crate::Result<i64>;

    async fn count_running_by_name(&self, task_name: &str) -> crate::Result<i64>;

    /// Distinct task names, ascending.
    async fn task_names(&self) -> crate::Result<Vec<String>>;

    /// Link a batch job to an execution. Repeated calls insert repeated rows.
    async fn associate_batch_job(&self, execution_id: i64, batch_job_id: i64) -> crate::Result<()>;

    async fn batch_job_ids(&self, execution_id: i64) -> crate::Result<Vec<i64>>;

    async fn execution_id_for_batch_job(&self, batch_job_id: i64) -> crate::Result<Option<i64>>;
}
