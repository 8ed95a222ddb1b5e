use crate::clock::Clock;
use crate::config::TaskConfig;
use crate::lock::{LeaseLock, LeaseSettings, LockStore};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hands out one [`LeaseLock`] per key, so every caller in this process that
/// asks for the same key shares one owner token.
///
/// A shared owner token means the lease alone does not exclude callers within
/// this process. Each key also has a local gate for that.
pub struct LockRegistry {
    region: String,
    settings: LeaseSettings,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Entry>>,
}

#[derive(Clone)]
struct Entry {
    lock: Arc<LeaseLock>,
    gate: Arc<Mutex<()>>,
}

impl LockRegistry {
    pub fn new(
        region: impl Into<String>,
        settings: LeaseSettings,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            region: region.into(),
            settings,
            store,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &TaskConfig, store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        let settings = LeaseSettings {
            ttl: config.lease_ttl,
            retry_interval: config.retry_interval,
            clock_skew_tolerance: config.clock_skew_tolerance,
        };
        Self::new(config.lock_region.clone(), settings, store, clock)
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Lock for `key`, created on first request and cached afterwards.
    pub async fn obtain(&self, key: &str) -> Result<Arc<LeaseLock>> {
        Ok(self.entry(key).await?.lock)
    }

    /// In-process mutex for `key`. Hold it for as long as the lease is held
    /// to keep other callers of this registry out.
    pub async fn gate(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        Ok(self.entry(key).await?.gate)
    }

    async fn entry(&self, key: &str) -> Result<Entry> {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            return Ok(entry.clone());
        }

        let lock = Arc::new(LeaseLock::new(
            key,
            self.region.clone(),
            self.settings,
            self.store.clone(),
            self.clock.clone(),
        )?);
        let entry = Entry {
            lock,
            gate: Arc::new(Mutex::new(())),
        };
        locks.insert(key.to_string(), entry.clone());

        tracing::debug!(key, region = %self.region, owner = %entry.lock.owner_id(), "Created lease lock");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryLockStore;

    fn registry() -> LockRegistry {
        LockRegistry::from_config(
            &TaskConfig::default(),
            Arc::new(MemoryLockStore::new()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_same_key_reuses_lock() {
        let registry = registry();
        let first = registry.obtain("nightly-job").await.unwrap();
        let second = registry.obtain("nightly-job").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.owner_id(), second.owner_id());
        assert_eq!(first.region(), "DEFAULT");
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_owners() {
        let registry = registry();
        let a = registry.obtain("a").await.unwrap();
        let b = registry.obtain("b").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.owner_id(), b.owner_id());
    }

    #[tokio::test]
    async fn test_reused_lock_reacquires_as_renewal() {
        let registry = registry();
        let lock = registry.obtain("job").await.unwrap();
        assert!(lock.try_acquire_once().await.unwrap());

        let again = registry.obtain("job").await.unwrap();
        assert!(again.try_acquire_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_same_key_shares_gate() {
        let registry = registry();
        let first = registry.gate("job").await.unwrap();
        let second = registry.gate("job").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let _held = first.lock().await;
        assert!(second.try_lock().is_err());
        assert!(registry.gate("other").await.unwrap().try_lock().is_ok());
    }
}
