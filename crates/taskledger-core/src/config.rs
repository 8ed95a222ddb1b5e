use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Fixed identifier of the singleton counter document.
pub const SEQUENCE_KEY: &str = "task_seq";

pub const DEFAULT_LOCK_REGION: &str = "DEFAULT";

/// Which storage backend the store is composed from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Process-local tables. Locks only exclude within one process.
    #[default]
    Memory,
    Postgres { url: String },
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub table_prefix: String,
    pub lease_ttl: Duration,
    pub retry_interval: Duration,
    /// Extra time a lease must be past expiry before a peer may take it over.
    pub clock_skew_tolerance: Duration,
    pub lock_region: String,
    /// How long `TaskLifecycle` waits for the single-instance lock.
    pub lock_wait: Duration,
    pub initialize_schema: bool,
    pub single_instance_enabled: bool,
    pub backend: StoreBackend,
    pub max_connections: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            lease_ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
            clock_skew_tolerance: Duration::ZERO,
            lock_region: DEFAULT_LOCK_REGION.to_string(),
            lock_wait: Duration::ZERO,
            initialize_schema: true,
            single_instance_enabled: false,
            backend: StoreBackend::Memory,
            max_connections: 5,
        }
    }
}

impl TaskConfig {
    /// Load configuration from `TASKLEDGER_*` environment variables.
    ///
    /// Durations are given in milliseconds (`TASKLEDGER_LEASE_TTL_MS=30000`).
    /// `TASKLEDGER_BACKEND` is `memory` or `postgres`; the latter requires
    /// `TASKLEDGER_DATABASE_URL`.
    pub fn from_env() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("TASKLEDGER").try_parsing(true))
            .build()?;

        let raw: EnvSettings = settings.try_deserialize()?;
        raw.into_config()
    }

    pub fn collection_names(&self) -> CollectionNames {
        CollectionNames::with_prefix(&self.table_prefix)
    }

    pub fn validate(&self) -> Result<()> {
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(format!(
                "table prefix may only contain ASCII letters, digits and '_': {:?}",
                self.table_prefix
            )));
        }

        if self.lease_ttl.is_zero() {
            return Err(Error::Config("lease TTL must be greater than zero".to_string()));
        }

        if self.retry_interval.is_zero() {
            return Err(Error::Config(
                "retry interval must be greater than zero".to_string(),
            ));
        }

        if self.retry_interval >= self.lease_ttl {
            return Err(Error::Config(format!(
                "retry interval ({:?}) must be shorter than lease TTL ({:?})",
                self.retry_interval, self.lease_ttl
            )));
        }

        if self.lock_region.is_empty() || self.lock_region.contains(':') {
            return Err(Error::Config(format!(
                "lock region must be non-empty and free of ':', got {:?}",
                self.lock_region
            )));
        }

        if let StoreBackend::Postgres { url } = &self.backend {
            if url.is_empty() {
                return Err(Error::Config("Postgres backend requires a database URL".to_string()));
            }
        }

        Ok(())
    }
}

/// Names of the five collections, each carrying the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub executions: String,
    pub parameters: String,
    pub batch_associations: String,
    pub sequence: String,
    pub locks: String,
}

impl CollectionNames {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            executions: format!("{}task_executions", prefix),
            parameters: format!("{}task_execution_parameters", prefix),
            batch_associations: format!("{}task_batch_associations", prefix),
            sequence: format!("{}task_sequence", prefix),
            locks: format!("{}task_locks", prefix),
        }
    }
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self::with_prefix("")
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EnvSettings {
    table_prefix: String,
    lease_ttl_ms: u64,
    retry_interval_ms: u64,
    clock_skew_tolerance_ms: u64,
    lock_region: String,
    lock_wait_ms: u64,
    initialize_schema: bool,
    single_instance_enabled: bool,
    backend: String,
    database_url: Option<String>,
    max_connections: u32,
}

impl Default for EnvSettings {
    fn default() -> Self {
        let defaults = TaskConfig::default();
        Self {
            table_prefix: defaults.table_prefix,
            lease_ttl_ms: defaults.lease_ttl.as_millis() as u64,
            retry_interval_ms: defaults.retry_interval.as_millis() as u64,
            clock_skew_tolerance_ms: 0,
            lock_region: defaults.lock_region,
            lock_wait_ms: 0,
            initialize_schema: defaults.initialize_schema,
            single_instance_enabled: defaults.single_instance_enabled,
            backend: "memory".to_string(),
            database_url: None,
            max_connections: defaults.max_connections,
        }
    }
}

impl EnvSettings {
    fn into_config(self) -> Result<TaskConfig> {
        let backend = match self.backend.to_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" | "postgresql" => StoreBackend::Postgres {
                url: self.database_url.unwrap_or_default(),
            },
            other => return Err(Error::Config(format!("Unknown store backend: {}", other))),
        };

        let config = TaskConfig {
            table_prefix: self.table_prefix,
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            clock_skew_tolerance: Duration::from_millis(self.clock_skew_tolerance_ms),
            lock_region: self.lock_region,
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            initialize_schema: self.initialize_schema,
            single_instance_enabled: self.single_instance_enabled,
            backend,
            max_connections: self.max_connections,
        };

        config.validate()?;
        Ok(config)
    }
}
