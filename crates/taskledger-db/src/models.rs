use chrono::{DateTime, Utc};
use sqlx::FromRow;
use taskledger_core::{ExecutionRecord, LockRecord};

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub execution_id: i64,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub exit_message: Option<String>,
    pub error_message: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub external_execution_id: Option<String>,
    pub parent_execution_id: Option<i64>,
}

impl ExecutionRow {
    pub fn into_record(self, arguments: Vec<String>) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id,
            task_name: self.task_name,
            start_time: self.start_time,
            end_time: self.end_time,
            exit_code: self.exit_code,
            exit_message: self.exit_message,
            error_message: self.error_message,
            last_updated: self.last_updated,
            external_execution_id: self.external_execution_id,
            parent_execution_id: self.parent_execution_id,
            arguments,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ParameterRow {
    pub execution_id: i64,
    pub value: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct LockRow {
    pub lock_key: String,
    pub region: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<LockRow> for LockRecord {
    fn from(row: LockRow) -> Self {
        LockRecord {
            lock_key: row.lock_key,
            region: row.region,
            owner_id: row.owner_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}
