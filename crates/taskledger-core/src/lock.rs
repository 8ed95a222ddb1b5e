//! Lease-based mutual exclusion backed by a single lock document per
//! `(lock_key, region)`.
//!
//! The lock object holds no authoritative state. Whether a lock is held, and by
//! whom, is read from the stored [`LockRecord`]; a [`LeaseLock`] only carries
//! its owner token and timing configuration. Every state transition is one
//! conditional single-document operation on a [`LockStore`], and the store's
//! uniqueness constraint on the composite key is what serializes competing
//! inserts.
//!
//! Staleness is judged against the local clock. Peers whose clocks disagree by
//! more than `clock_skew_tolerance` can see a live lease as stale.

use crate::clock::Clock;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_key: String,
    pub region: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Primary key of the lock document.
    pub fn id(&self) -> String {
        lock_id(&self.lock_key, &self.region)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Regions may not contain `:`, which keeps `lock_key:region` unambiguous.
pub fn lock_id(lock_key: &str, region: &str) -> String {
    format!("{}:{}", lock_key, region)
}

pub fn validate_region(region: &str) -> Result<()> {
    if region.is_empty() || region.contains(':') {
        return Err(Error::InvalidArgument(format!(
            "lock region must be non-empty and free of ':', got {:?}",
            region
        )));
    }
    Ok(())
}

/// Result of inserting a lock document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A document with the same `(lock_key, region)` already exists.
    Duplicate,
}

/// Atomic single-document operations on the lock collection.
///
/// Every method is one match-then-mutate call against the store. The boolean
/// results report whether a document was modified.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn insert(&self, record: &LockRecord) -> Result<InsertOutcome>;

    /// Replace owner, creation and expiry of the document for the candidate's
    /// key, but only if its `expires_at <= stale_before`.
    async fn take_over_stale(&self, candidate: &LockRecord, stale_before: DateTime<Utc>) -> Result<bool>;

    /// Move the expiry of the document forward, but only if it is owned by
    /// `candidate.owner_id`.
    async fn renew_owned(&self, candidate: &LockRecord) -> Result<bool>;

    /// Delete the document only if it is owned by `owner_id`.
    async fn delete_owned(&self, lock_key: &str, region: &str, owner_id: &str) -> Result<bool>;

    async fn find(&self, lock_key: &str, region: &str) -> Result<Option<LockRecord>>;
}

/// Timing parameters shared by every lock a registry hands out.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    pub ttl: Duration,
    pub retry_interval: Duration,
    pub clock_skew_tolerance: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
            clock_skew_tolerance: Duration::ZERO,
        }
    }
}

/// One lock on a `(key, region)` pair with a stable random owner token.
///
/// Nothing renews the lease in the background. Work that may outlive the TTL
/// has to call [`LeaseLock::try_acquire_once`] again to extend it.
pub struct LeaseLock {
    key: String,
    region: String,
    owner_id: String,
    ttl: chrono::Duration,
    skew: chrono::Duration,
    retry_interval: Duration,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("key", &self.key)
            .field("region", &self.region)
            .field("owner_id", &self.owner_id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl LeaseLock {
    pub fn new(
        key: impl Into<String>,
        region: impl Into<String>,
        settings: LeaseSettings,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let region = region.into();
        validate_region(&region)?;

        let ttl = chrono::Duration::from_std(settings.ttl)
            .map_err(|e| Error::Config(format!("lease TTL out of range: {}", e)))?;
        let skew = chrono::Duration::from_std(settings.clock_skew_tolerance)
            .map_err(|e| Error::Config(format!("clock skew tolerance out of range: {}", e)))?;

        Ok(Self {
            key: key.into(),
            region,
            owner_id: Uuid::new_v4().to_string(),
            ttl,
            skew,
            retry_interval: settings.retry_interval,
            store,
            clock,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Single acquisition attempt: insert, else take over a stale lease, else
    /// extend a lease this lock already owns.
    pub async fn try_acquire_once(&self) -> Result<bool> {
        let now = self.clock.now();
        let candidate = LockRecord {
            lock_key: self.key.clone(),
            region: self.region.clone(),
            owner_id: self.owner_id.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        if self.store.insert(&candidate).await? == InsertOutcome::Inserted {
            tracing::info!(key = %self.key, region = %self.region, owner = %self.owner_id, "Lock acquired");
            return Ok(true);
        }

        if self.store.take_over_stale(&candidate, now - self.skew).await? {
            tracing::warn!(
                key = %self.key,
                region = %self.region,
                owner = %self.owner_id,
                "Lock acquired by taking over an expired lease"
            );
            return Ok(true);
        }

        if self.store.renew_owned(&candidate).await? {
            tracing::debug!(key = %self.key, region = %self.region, "Lease renewed");
            return Ok(true);
        }

        tracing::debug!(key = %self.key, region = %self.region, "Lock held by another owner");
        Ok(false)
    }

    /// Retry [`LeaseLock::try_acquire_once`] every retry interval until it
    /// succeeds or `timeout` elapses. A zero timeout makes one attempt.
    pub async fn acquire(&self, timeout: Duration) -> Result<bool> {
        self.acquire_with_cancel(timeout, &CancellationToken::new())
            .await
    }

    /// Like [`LeaseLock::acquire`], but returns `Ok(false)` once `cancel`
    /// fires. A store call already in flight is allowed to finish; if it
    /// acquired the lease after cancellation, the lease is released again.
    pub async fn acquire_with_cancel(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        // No deadline when the timeout does not fit in an Instant.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            if self.try_acquire_once().await? {
                if cancel.is_cancelled() {
                    tracing::debug!(key = %self.key, "Acquisition cancelled, releasing lease");
                    self.release().await?;
                    return Ok(false);
                }
                return Ok(true);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(key = %self.key, ?timeout, "Timed out waiting for lock");
                        return Ok(false);
                    }
                    self.retry_interval.min(deadline - now)
                }
                None => self.retry_interval,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Delete the lock document if this lock still owns it. Returns whether
    /// anything was deleted; releasing a lease someone else took over is a
    /// no-op.
    pub async fn release(&self) -> Result<bool> {
        let released = self
            .store
            .delete_owned(&self.key, &self.region, &self.owner_id)
            .await?;

        if released {
            tracing::info!(key = %self.key, region = %self.region, owner = %self.owner_id, "Lock released");
        } else {
            tracing::debug!(key = %self.key, region = %self.region, "Release skipped, lock not owned");
        }

        Ok(released)
    }

    /// Current lock document for this key, whoever owns it.
    pub async fn holder(&self) -> Result<Option<LockRecord>> {
        self.store.find(&self.key, &self.region).await
    }
}
