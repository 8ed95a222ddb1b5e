use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted record of one run of a named task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: i64,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the execution is still running.
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub exit_message: Option<String>,
    pub error_message: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub external_execution_id: Option<String>,
    pub parent_execution_id: Option<i64>,
    /// Positional task arguments, in the order they were supplied.
    pub arguments: Vec<String>,
}

impl ExecutionRecord {
    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Input for `ExecutionRepository::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub arguments: Vec<String>,
    pub external_execution_id: Option<String>,
    pub parent_execution_id: Option<i64>,
}

impl NewExecution {
    pub fn new(task_name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            task_name: task_name.into(),
            start_time,
            arguments: Vec::new(),
            external_execution_id: None,
            parent_execution_id: None,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_external_execution_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_execution_id = Some(external_id.into());
        self
    }

    pub fn with_parent(mut self, parent_execution_id: i64) -> Self {
        self.parent_execution_id = Some(parent_execution_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_task_name(&self.task_name)
    }

    /// Materialize the record as it looks right after creation.
    pub fn into_record(self, execution_id: i64, now: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            execution_id,
            task_name: self.task_name,
            start_time: self.start_time,
            end_time: None,
            exit_code: None,
            exit_message: None,
            error_message: None,
            last_updated: now,
            external_execution_id: self.external_execution_id,
            parent_execution_id: self.parent_execution_id,
            arguments: self.arguments,
        }
    }
}

/// Task names are the only input the repositories check.
pub fn validate_task_name(task_name: &str) -> Result<()> {
    if task_name.is_empty() {
        return Err(Error::InvalidArgument("task name must not be empty".to_string()));
    }
    Ok(())
}

/// Zero-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidArgument("page size must be greater than zero".to_string()));
        }
        Ok(Self { page, page_size })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Saturates, so pages far beyond the data are simply empty.
    pub fn offset(&self) -> i64 {
        i64::from(self.page).saturating_mul(i64::from(self.page_size))
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matching items across all pages.
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> i64 {
        if self.page_size == 0 {
            return 0;
        }
        let size = i64::from(self.page_size);
        (self.total + size - 1) / size
    }
}
