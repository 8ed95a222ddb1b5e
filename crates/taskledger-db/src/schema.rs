use crate::error::{is_duplicate_object, map_db_error};
use sqlx::{Pool, Postgres};
use taskledger_core::{CollectionNames, Result, SEQUENCE_KEY};

/// Creates the five task tables and their indexes. Safe to run from every
/// instance on every startup.
pub struct SchemaInitializer {
    pool: Pool<Postgres>,
    names: CollectionNames,
}

impl SchemaInitializer {
    pub fn new(pool: Pool<Postgres>, names: CollectionNames) -> Self {
        Self { pool, names }
    }

    /// Initialize database schema
    pub async fn initialize(&self) -> Result<()> {
        for statement in schema_statements(&self.names) {
            match sqlx::query(&statement).execute(&self.pool).await {
                Ok(_) => {}
                Err(err) if is_duplicate_object(&err) => {
                    tracing::debug!(error = %err, "Schema object already exists, skipping");
                }
                Err(err) => return Err(map_db_error(err)),
            }
        }

        let seed = format!(
            "INSERT INTO {} (id, value) VALUES ($1, 0) ON CONFLICT (id) DO NOTHING",
            self.names.sequence
        );
        sqlx::query(&seed)
            .bind(SEQUENCE_KEY)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;

        tracing::info!(executions = %self.names.executions, "Task schema initialized");
        Ok(())
    }
}

/// DDL for every table and index, in creation order.
pub fn schema_statements(names: &CollectionNames) -> Vec<String> {
    let executions = &names.executions;
    let parameters = &names.parameters;
    let associations = &names.batch_associations;
    let sequence = &names.sequence;
    let locks = &names.locks;

    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {executions} (
                execution_id BIGINT PRIMARY KEY,
                task_name VARCHAR(255) NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ,
                exit_code INTEGER,
                exit_message TEXT,
                error_message TEXT,
                last_updated TIMESTAMPTZ NOT NULL,
                external_execution_id VARCHAR(255),
                parent_execution_id BIGINT
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {parameters} (
                execution_id BIGINT NOT NULL,
                position INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (execution_id, position),
                FOREIGN KEY (execution_id) REFERENCES {executions}(execution_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {associations} (
                id BIGSERIAL PRIMARY KEY,
                execution_id BIGINT NOT NULL,
                batch_job_id BIGINT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES {executions}(execution_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {sequence} (
                id VARCHAR(64) PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {locks} (
                id TEXT PRIMARY KEY,
                lock_key TEXT NOT NULL,
                region TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#
        ),
        // Create indexes
        format!("CREATE INDEX IF NOT EXISTS idx_{executions}_task_name ON {executions}(task_name ASC)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{executions}_start_time ON {executions}(start_time DESC)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{executions}_end_time ON {executions}(end_time ASC)"),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{executions}_task_name_end_time ON {executions}(task_name, end_time)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{executions}_external_id ON {executions}(external_execution_id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{executions}_parent_id ON {executions}(parent_execution_id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{associations}_execution_id ON {associations}(execution_id)"
        ),
        // Makes insert-based lock acquisition race-free.
        format!("CREATE UNIQUE INDEX IF NOT EXISTS uq_{locks}_key_region ON {locks}(lock_key, region)"),
    ]
}
