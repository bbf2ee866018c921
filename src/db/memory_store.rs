//! In-memory [`PermissionStore`] with fault injection. Test double only; the
//! server and CLI always run against SQLite.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::PermissionStore;
use crate::errors::PermissionError;
use crate::models::permission::{PermissionKey, PermissionRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<PermissionKey, bool>>,
    failing: Mutex<HashSet<PermissionKey>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
    upserts: AtomicUsize,
    fetch_delay: Option<Duration>,
    write_delay: Option<Duration>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = PermissionRecord>) -> Self {
        let store = Self::default();
        for row in rows {
            store.insert(row);
        }
        store
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Write a row directly, bypassing fault injection and counters.
    pub fn insert(&self, record: PermissionRecord) {
        let allowed = record.allowed;
        locked(&self.rows).insert(record.key(), allowed);
    }

    /// Make every fetch and write fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes to `key` fail with `StoreUnavailable`.
    pub fn fail_on(&self, key: PermissionKey) {
        locked(&self.failing).insert(key);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        locked(&self.rows).len()
    }

    pub fn allowed(&self, key: &PermissionKey) -> Option<bool> {
        locked(&self.rows).get(key).copied()
    }

    fn check_available(&self) -> Result<(), PermissionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PermissionError::store_unavailable("store offline"));
        }
        Ok(())
    }

    fn records(&self, only_allowed: bool) -> Vec<PermissionRecord> {
        locked(&self.rows)
            .iter()
            .filter(|(_, allowed)| !only_allowed || **allowed)
            .map(|(key, allowed)| PermissionRecord {
                role_id: key.role_id.clone(),
                resource: key.resource.clone(),
                action: key.action.clone(),
                allowed: *allowed,
            })
            .collect()
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn fetch_allowed(&self) -> Result<Vec<PermissionRecord>, PermissionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        Ok(self.records(true))
    }

    async fn fetch_all(&self) -> Result<Vec<PermissionRecord>, PermissionError> {
        self.check_available()?;
        Ok(self.records(false))
    }

    async fn upsert(&self, record: &PermissionRecord) -> Result<(), PermissionError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;

        let key = record.key();
        if locked(&self.failing).contains(&key) {
            return Err(PermissionError::store_unavailable(format!("write rejected for {}", key)));
        }

        locked(&self.rows).insert(key, record.allowed);
        Ok(())
    }
}
