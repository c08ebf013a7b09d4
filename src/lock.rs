//! Advisory lock serializing collection runs across invocations.
//!
//! The lock is a single record `"<epoch-ms> <owner>"` in the admin store. A
//! record is held while its timestamp is within the staleness window; after
//! that anyone may take it over. Reading and then writing the record is not
//! atomic, so two invocations racing on an expired lock can both believe
//! they hold it. Overlapping runs only waste work.

use std::sync::Arc;

use crate::storage::BlobStore;
use crate::utils::now_ms;

/// Key of the collection lock record.
pub const COLLECT_LOCK_KEY: &str = "collect.lock";

const CLEARED: &str = "0 0";

/// Source of the current time, in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_ms()
    }
}

/// Owner token unique to this process and call.
///
/// Format: `<host>-<pid>-<random>`.
pub fn owner_token() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string());
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &random[..8])
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockRecord {
    acquired_at: i64,
    owner: String,
}

impl LockRecord {
    fn parse(text: &str) -> Option<Self> {
        let (at, owner) = text.trim().split_once(' ')?;
        Some(Self {
            acquired_at: at.parse().ok()?,
            owner: owner.to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("{} {}", self.acquired_at, self.owner)
    }
}

/// Best-effort mutual exclusion over a byte store record.
#[derive(Clone)]
pub struct AdvisoryLock {
    store: Arc<dyn BlobStore>,
    key: String,
    stale_after_ms: i64,
    clock: Arc<dyn Clock>,
}

impl AdvisoryLock {
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, stale_after_ms: u64) -> Self {
        Self {
            store,
            key: key.into(),
            stale_after_ms: i64::try_from(stale_after_ms).unwrap_or(i64::MAX),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stale_after_ms(&self) -> i64 {
        self.stale_after_ms
    }

    /// The record if it is still within the staleness window.
    async fn fresh_record(&self) -> Option<LockRecord> {
        let text = self.store.get_string(&self.key).await?;
        let record = LockRecord::parse(&text)?;
        let age = self.clock.now_ms() - record.acquired_at;
        (record.acquired_at > 0 && age < self.stale_after_ms).then_some(record)
    }

    async fn write(&self, text: &str) -> bool {
        match self
            .store
            .put(&self.key, "text/plain", text.as_bytes())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Writing lock {} failed: {}", self.key, e);
                false
            }
        }
    }

    /// Try to take the lock for `owner`.
    ///
    /// Returns whether `owner` holds the lock afterwards. A fresh lock held by
    /// someone else is left untouched.
    pub async fn acquire(&self, owner: &str) -> bool {
        match self.fresh_record().await {
            Some(record) if record.owner == owner => return true,
            Some(record) => {
                log::debug!("Lock {} held by {}", self.key, record.owner);
                return false;
            }
            None => {}
        }

        let record = LockRecord {
            acquired_at: self.clock.now_ms(),
            owner: owner.to_string(),
        };
        if !self.write(&record.encode()).await {
            return false;
        }
        self.is_held(owner).await
    }

    /// Clear the lock if `owner` holds it.
    pub async fn release(&self, owner: &str) {
        if self.is_held(owner).await {
            self.write(CLEARED).await;
            log::debug!("Released lock {}", self.key);
        }
    }

    /// Whether `owner` currently holds a fresh lock.
    pub async fn is_held(&self, owner: &str) -> bool {
        self.fresh_record()
            .await
            .is_some_and(|record| record.owner == owner)
    }

    /// Whether anyone currently holds a fresh lock.
    pub async fn is_locked(&self) -> bool {
        self.fresh_record().await.is_some()
    }

    /// Move the lock timestamp to now if `owner` holds it.
    ///
    /// Long runs call this periodically so the lock outlives the window.
    pub async fn refresh(&self, owner: &str) -> bool {
        if !self.is_held(owner).await {
            return false;
        }
        let record = LockRecord {
            acquired_at: self.clock.now_ms(),
            owner: owner.to_string(),
        };
        self.write(&record.encode()).await
    }
}
