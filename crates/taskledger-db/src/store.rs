use crate::error::map_db_error;
use crate::lock_store::PgLockStore;
use crate::repository::PgExecutionRepository;
use crate::schema::SchemaInitializer;
use crate::sequence::PgSequenceGenerator;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::sync::Arc;
use taskledger_core::{
    Clock, ExecutionRepository, LockRegistry, LockStore, MemoryExecutionRepository,
    MemoryLockStore, MemorySequence, Result, SequenceGenerator, StoreBackend, SystemClock,
    TaskConfig, TaskLifecycle,
};

/// The repository, sequence and lock registry for one configured backend.
#[derive(Clone)]
pub struct TaskStore {
    pub executions: Arc<dyn ExecutionRepository>,
    pub sequence: Arc<dyn SequenceGenerator>,
    pub locks: Arc<LockRegistry>,
    pub clock: Arc<dyn Clock>,
    config: TaskConfig,
}

impl TaskStore {
    pub async fn open(config: TaskConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(config: TaskConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        match &config.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory task store, locks only exclude within this process");
                let sequence: Arc<dyn SequenceGenerator> = Arc::new(MemorySequence::new());
                let executions = Arc::new(MemoryExecutionRepository::new(sequence.clone(), clock.clone()));
                let lock_store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
                Ok(Self::assemble(config, executions, sequence, lock_store, clock))
            }
            StoreBackend::Postgres { url } => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(url)
                    .await
                    .map_err(map_db_error)?;
                Self::from_pool(pool, config, clock).await
            }
        }
    }

    /// Build a Postgres-backed store on an existing pool.
    pub async fn from_pool(pool: Pool<Postgres>, config: TaskConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let names = config.collection_names();

        if config.initialize_schema {
            SchemaInitializer::new(pool.clone(), names.clone())
                .initialize()
                .await?;
        }

        let sequence: Arc<dyn SequenceGenerator> =
            Arc::new(PgSequenceGenerator::new(pool.clone(), names.sequence.clone()));
        let executions = Arc::new(PgExecutionRepository::new(
            pool.clone(),
            names.clone(),
            sequence.clone(),
            clock.clone(),
        ));
        let lock_store: Arc<dyn LockStore> = Arc::new(PgLockStore::new(pool, names.locks));

        Ok(Self::assemble(config, executions, sequence, lock_store, clock))
    }

    fn assemble(
        config: TaskConfig,
        executions: Arc<dyn ExecutionRepository>,
        sequence: Arc<dyn SequenceGenerator>,
        lock_store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(LockRegistry::from_config(&config, lock_store, clock.clone()));
        Self {
            executions,
            sequence,
            locks,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Lifecycle runner honouring the single-instance flag.
    pub fn lifecycle(&self) -> TaskLifecycle {
        let lifecycle = TaskLifecycle::new(self.executions.clone(), self.clock.clone());
        if self.config.single_instance_enabled {
            lifecycle.with_single_instance(self.locks.clone(), self.config.lock_wait)
        } else {
            lifecycle
        }
    }
}
