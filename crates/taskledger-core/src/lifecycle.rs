use crate::clock::Clock;
use crate::execution::{ExecutionRecord, NewExecution};
use crate::lock::LeaseLock;
use crate::registry::LockRegistry;
use crate::repository::ExecutionRepository;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

/// Exit code recorded when the work fails or the lock cannot be obtained.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Single-instance claim on a task name: the local gate plus the lease.
struct Claim {
    lock: Arc<LeaseLock>,
    _local: OwnedMutexGuard<()>,
}

/// Records an execution around a unit of work, optionally allowing only one
/// instance of each task name to run at a time.
pub struct TaskLifecycle {
    repository: Arc<dyn ExecutionRepository>,
    locks: Option<Arc<LockRegistry>>,
    clock: Arc<dyn Clock>,
    lock_wait: Duration,
}

impl TaskLifecycle {
    pub fn new(repository: Arc<dyn ExecutionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            locks: None,
            clock,
            lock_wait: Duration::ZERO,
        }
    }

    /// Guard every run with the lock named after its task, waiting up to
    /// `lock_wait` for it.
    pub fn with_single_instance(mut self, locks: Arc<LockRegistry>, lock_wait: Duration) -> Self {
        self.locks = Some(locks);
        self.lock_wait = lock_wait;
        self
    }

    /// Create the execution record, run `work`, and complete the record with
    /// the exit code it returns. Returns the final record.
    ///
    /// If the single-instance lock is held elsewhere the execution is recorded
    /// as failed and `Error::LockUnavailable` is returned without running
    /// `work`.
    pub async fn run<F, Fut>(&self, execution: NewExecution, work: F) -> Result<ExecutionRecord>
    where
        F: FnOnce(ExecutionRecord) -> Fut,
        Fut: Future<Output = anyhow::Result<i32>>,
    {
        let record = self.repository.create(execution).await?;
        let execution_id = record.execution_id;

        let claim = match &self.locks {
            Some(registry) => {
                let claim = self.claim(registry, &record.task_name).await?;
                if claim.is_none() {
                    let message = Error::LockUnavailable(record.task_name.clone()).to_string();
                    tracing::warn!(execution_id, task_name = %record.task_name, "{}", message);

                    self.repository.update_error(execution_id, &message).await?;
                    self.repository
                        .complete(execution_id, FAILURE_EXIT_CODE, self.clock.now(), None)
                        .await?;
                    return Err(Error::LockUnavailable(record.task_name));
                }
                claim
            }
            None => None,
        };

        tracing::info!(execution_id, task_name = %record.task_name, "Task execution started");
        let outcome = work(record).await;

        let finished = self.finish(execution_id, outcome).await;
        let released = match claim {
            Some(claim) => claim.lock.release().await.map(|_| ()),
            None => Ok(()),
        };
        finished?;
        released?;

        self.repository
            .find_by_id(execution_id)
            .await?
            .ok_or(Error::NotFound(execution_id))
    }

    /// Take the local gate, then the lease, within `lock_wait` overall.
    async fn claim(&self, registry: &LockRegistry, task_name: &str) -> Result<Option<Claim>> {
        let started = Instant::now();
        let gate = registry.gate(task_name).await?;
        let local = match tokio::time::timeout(self.lock_wait, gate.lock_owned()).await {
            Ok(local) => local,
            Err(_) => {
                tracing::debug!(task_name, "Task already running in this process");
                return Ok(None);
            }
        };

        let lock = registry.obtain(task_name).await?;
        let remaining = self.lock_wait.saturating_sub(started.elapsed());
        if !lock.acquire(remaining).await? {
            return Ok(None);
        }

        Ok(Some(Claim { lock, _local: local }))
    }

    async fn finish(&self, execution_id: i64, outcome: anyhow::Result<i32>) -> Result<()> {
        let exit_code = match outcome {
            Ok(exit_code) => exit_code,
            Err(err) => {
                tracing::error!(execution_id, error = %err, "Task execution failed");
                self.repository
                    .update_error(execution_id, &format!("{:#}", err))
                    .await?;
                FAILURE_EXIT_CODE
            }
        };

        self.repository
            .complete(execution_id, exit_code, self.clock.now(), None)
            .await?;

        tracing::info!(execution_id, exit_code, "Task execution completed");
        Ok(())
    }
}
