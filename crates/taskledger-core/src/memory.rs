//! Process-local backend. Each table lives behind a `tokio::sync` lock, so
//! every operation is atomic with respect to other callers in the same
//! process. Nothing is shared across processes.

use crate::clock::Clock;
use crate::execution::{validate_task_name, ExecutionRecord, NewExecution, Page, PageRequest};
use crate::lock::{InsertOutcome, LockRecord, LockStore};
use crate::repository::ExecutionRepository;
use crate::sequence::SequenceGenerator;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
pub struct MemorySequence {
    value: AtomicI64,
}

impl MemorySequence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceGenerator for MemorySequence {
    async fn next(&self) -> Result<i64> {
        Ok(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Debug, Default)]
struct Tables {
    executions: BTreeMap<i64, ExecutionRecord>,
    batch_associations: Vec<(i64, i64)>,
}

pub struct MemoryExecutionRepository {
    tables: RwLock<Tables>,
    sequence: Arc<dyn SequenceGenerator>,
    clock: Arc<dyn Clock>,
}

impl MemoryExecutionRepository {
    pub fn new(sequence: Arc<dyn SequenceGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            sequence,
            clock,
        }
    }

    async fn update<F>(&self, execution_id: i64, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionRecord) + Send,
    {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        let record = tables
            .executions
            .get_mut(&execution_id)
            .ok_or(Error::NotFound(execution_id))?;

        apply(record);
        record.last_updated = now;
        Ok(())
    }

    async fn select<P>(&self, predicate: P) -> Vec<ExecutionRecord>
    where
        P: Fn(&ExecutionRecord) -> bool + Send,
    {
        let tables = self.tables.read().await;
        let mut records: Vec<ExecutionRecord> = tables
            .executions
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect();

        sort_newest_first(&mut records);
        records
    }
}

fn sort_newest_first(records: &mut [ExecutionRecord]) {
    records.sort_by_key(|record| Reverse((record.start_time, record.execution_id)));
}

fn paginate(records: Vec<ExecutionRecord>, page: PageRequest) -> Page<ExecutionRecord> {
    let total = records.len() as i64;
    let items = records
        .into_iter()
        .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
        .take(usize::try_from(page.limit()).unwrap_or(usize::MAX))
        .collect();

    Page {
        items,
        total,
        page: page.page(),
        page_size: page.page_size(),
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn create(&self, execution: NewExecution) -> Result<ExecutionRecord> {
        execution.validate()?;

        let execution_id = self.sequence.next().await?;
        let record = execution.into_record(execution_id, self.clock.now());

        let mut tables = self.tables.write().await;
        tables.executions.insert(execution_id, record.clone());

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
        self.update(execution_id, |record| {
            record.end_time = Some(end_time);
            record.exit_code = Some(exit_code);
            record.exit_message = exit_message;
        })
        .await
    }

    async fn update_error(&self, execution_id: i64, error_message: &str) -> Result<()> {
        let error_message = error_message.to_string();
        self.update(execution_id, |record| {
            record.error_message = Some(error_message);
        })
        .await
    }

    async fn update_external_execution_id(
        &self,
        execution_id: i64,
        external_execution_id: &str,
    ) -> Result<()> {
        let external_execution_id = external_execution_id.to_string();
        self.update(execution_id, |record| {
            record.external_execution_id = Some(external_execution_id);
        })
        .await
    }

    async fn find_by_id(&self, execution_id: i64) -> Result<Option<ExecutionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.executions.get(&execution_id).cloned())
    }

    async fn find_by_name(&self, task_name: &str, page: PageRequest) -> Result<Page<ExecutionRecord>> {
        validate_task_name(task_name)?;
        let records = self.select(|record| record.task_name == task_name).await;
        Ok(paginate(records, page))
    }

    async fn find_all(&self, page: PageRequest) -> Result<Page<ExecutionRecord>> {
        let records = self.select(|_| true).await;
        Ok(paginate(records, page))
    }

    async fn find_running(&self, task_name: &str) -> Result<Vec<ExecutionRecord>> {
        validate_task_name(task_name)?;
        Ok(self
            .select(|record| record.task_name == task_name && record.is_running())
            .await)
    }

    async fn find_children(&self, parent_execution_id: i64) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .select(|record| record.parent_execution_id == Some(parent_execution_id))
            .await)
    }

    async fn latest_by_name(&self, task_name: &str) -> Result<Option<ExecutionRecord>> {
        validate_task_name(task_name)?;
        Ok(self
            .select(|record| record.task_name == task_name)
            .await
            .into_iter()
            .next())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.tables.read().await.executions.len() as i64)
    }

    async fn count_by_name(&self, task_name: &str) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .values()
            .filter(|record| record.task_name == task_name)
            .count() as i64)
    }

    async fn count_running_by_name(&self, task_name: &str) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .values()
            .filter(|record| record.task_name == task_name && record.is_running())
            .count() as i64)
    }

    async fn task_names(&self) -> Result<Vec<String>> {
        let tables = self.tables.read().await;
        let names: BTreeSet<&String> = tables
            .executions
            .values()
            .map(|record| &record.task_name)
            .collect();
        Ok(names.into_iter().cloned().collect())
    }

    async fn associate_batch_job(&self, execution_id: i64, batch_job_id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.batch_associations.push((execution_id, batch_job_id));
        Ok(())
    }

    async fn batch_job_ids(&self, execution_id: i64) -> Result<Vec<i64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batch_associations
            .iter()
            .filter(|(execution, _)| *execution == execution_id)
            .map(|(_, job)| *job)
            .collect())
    }

    async fn execution_id_for_batch_job(&self, batch_job_id: i64) -> Result<Option<i64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batch_associations
            .iter()
            .find(|(_, job)| *job == batch_job_id)
            .map(|(execution, _)| *execution))
    }
}

/// Lock documents keyed by `(lock_key, region)`.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: Mutex<HashMap<(String, String), LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slot(lock_key: &str, region: &str) -> (String, String) {
    (lock_key.to_string(), region.to_string())
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn insert(&self, record: &LockRecord) -> Result<InsertOutcome> {
        let mut records = self.records.lock().await;
        let slot = slot(&record.lock_key, &record.region);
        if records.contains_key(&slot) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.insert(slot, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn take_over_stale(&self, candidate: &LockRecord, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&slot(&candidate.lock_key, &candidate.region)) {
            Some(existing) if existing.expires_at <= stale_before => {
                existing.owner_id = candidate.owner_id.clone();
                existing.created_at = candidate.created_at;
                existing.expires_at = candidate.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_owned(&self, candidate: &LockRecord) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&slot(&candidate.lock_key, &candidate.region)) {
            Some(existing) if existing.owner_id == candidate.owner_id => {
                existing.expires_at = candidate.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_owned(&self, lock_key: &str, region: &str, owner_id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        let slot = slot(lock_key, region);
        match records.get(&slot) {
            Some(existing) if existing.owner_id == owner_id => {
                records.remove(&slot);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(&self, lock_key: &str, region: &str) -> Result<Option<LockRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&slot(lock_key, region)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn repository(clock: Arc<ManualClock>) -> MemoryExecutionRepository {
        MemoryExecutionRepository::new(Arc::new(MemorySequence::new()), clock)
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one() {
        let sequence = MemorySequence::new();
        assert_eq!(sequence.next().await.unwrap(), 1);
        assert_eq!(sequence.next().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_sequence_values_are_distinct() {
        let sequence = Arc::new(MemorySequence::new());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let sequence = sequence.clone();
            handles.push(tokio::spawn(async move { sequence.next().await.unwrap() }));
        }

        let mut values = BTreeSet::new();
        for handle in handles {
            values.insert(handle.await.unwrap());
        }
        assert_eq!(values.len(), 100);
        assert_eq!(values.iter().next(), Some(&1));
        assert_eq!(values.iter().last(), Some(&100));
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());

        let created = repo
            .create(NewExecution::new("import", clock.now()).with_arguments(["a", "b", "c"]))
            .await
            .unwrap();

        let found = repo.find_by_id(created.execution_id).await.unwrap().unwrap();
        assert_eq!(found, created);
        assert!(found.end_time.is_none());
        assert_eq!(found.arguments, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_complete_sets_end_time_and_exit_code() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let created = repo.create(NewExecution::new("import", clock.now())).await.unwrap();

        clock.advance(Duration::seconds(10));
        let end = clock.now();
        repo.complete(created.execution_id, 0, end, Some("COMPLETED".to_string()))
            .await
            .unwrap();

        let found = repo.find_by_id(created.execution_id).await.unwrap().unwrap();
        assert_eq!(found.end_time, Some(end));
        assert_eq!(found.exit_code, Some(0));
        assert_eq!(found.exit_message.as_deref(), Some("COMPLETED"));
        assert_eq!(found.last_updated, end);
    }

    #[tokio::test]
    async fn test_complete_unknown_id_is_not_found() {
        let repo = repository(Arc::new(ManualClock::default()));
        let result = repo.complete(404, 0, Utc::now(), None).await;
        assert!(matches!(result, Err(Error::NotFound(404))));
    }

    #[tokio::test]
    async fn test_update_error_keeps_execution_running() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let created = repo.create(NewExecution::new("import", clock.now())).await.unwrap();

        repo.update_error(created.execution_id, "disk full").await.unwrap();
        repo.update_error(created.execution_id, "disk still full").await.unwrap();

        let found = repo.find_by_id(created.execution_id).await.unwrap().unwrap();
        assert_eq!(found.error_message.as_deref(), Some("disk still full"));
        assert!(found.is_running());
    }

    #[tokio::test]
    async fn test_running_and_counts() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());

        let first = repo.create(NewExecution::new("etl", clock.now())).await.unwrap();
        repo.create(NewExecution::new("etl", clock.now())).await.unwrap();
        repo.create(NewExecution::new("report", clock.now())).await.unwrap();
        repo.complete(first.execution_id, 1, clock.now(), None).await.unwrap();

        assert_eq!(repo.find_running("etl").await.unwrap().len(), 1);
        assert_eq!(repo.count().await.unwrap(), 3);
        assert_eq!(repo.count_by_name("etl").await.unwrap(), 2);
        assert_eq!(repo.count_running_by_name("etl").await.unwrap(), 1);
        assert_eq!(repo.task_names().await.unwrap(), vec!["etl", "report"]);
    }

    #[tokio::test]
    async fn test_latest_and_children() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());

        let parent = repo.create(NewExecution::new("composed", clock.now())).await.unwrap();
        clock.advance(Duration::seconds(1));
        let child = repo
            .create(NewExecution::new("composed", clock.now()).with_parent(parent.execution_id))
            .await
            .unwrap();

        let latest = repo.latest_by_name("composed").await.unwrap().unwrap();
        assert_eq!(latest.execution_id, child.execution_id);

        let children = repo.find_children(parent.execution_id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].execution_id, child.execution_id);
    }

    #[tokio::test]
    async fn test_batch_associations_allow_duplicates() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let created = repo.create(NewExecution::new("batch", clock.now())).await.unwrap();

        repo.associate_batch_job(created.execution_id, 77).await.unwrap();
        repo.associate_batch_job(created.execution_id, 77).await.unwrap();
        repo.associate_batch_job(created.execution_id, 78).await.unwrap();

        assert_eq!(repo.batch_job_ids(created.execution_id).await.unwrap(), vec![77, 77, 78]);
        assert_eq!(
            repo.execution_id_for_batch_job(78).await.unwrap(),
            Some(created.execution_id)
        );
        assert_eq!(repo.execution_id_for_batch_job(99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_duplicate_lock() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        let record = LockRecord {
            lock_key: "job".to_string(),
            region: "DEFAULT".to_string(),
            owner_id: "a".to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(5),
        };

        assert_eq!(store.insert(&record).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&record).await.unwrap(), InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_keys_containing_separator_do_not_collide() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        let record = |lock_key: &str, region: &str, owner_id: &str| LockRecord {
            lock_key: lock_key.to_string(),
            region: region.to_string(),
            owner_id: owner_id.to_string(),
            created_at: now,
            expires_at: now - Duration::seconds(1),
        };

        let first = record("a:b", "c", "first");
        let second = record("a", "b:c", "second");
        assert_eq!(first.id(), second.id());

        assert_eq!(store.insert(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&second).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.find("a:b", "c").await.unwrap().unwrap().owner_id, "first");
        assert_eq!(store.find("a", "b:c").await.unwrap().unwrap().owner_id, "second");
    }

    #[tokio::test]
    async fn test_page_far_beyond_data_is_empty() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        repo.create(NewExecution::new("job", clock.now())).await.unwrap();

        let page = repo
            .find_by_name("job", PageRequest::new(u32::MAX, u32::MAX).unwrap())
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 1);
    }
}
