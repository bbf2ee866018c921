//! Memoized `role_id -> allowed action ids` view of the permission store.
//!
//! The whole view is built from one `fetch_allowed()` call and dropped as a
//! whole by [`PermissionCache::invalidate`]. Rebuilds are serialized behind an
//! async mutex so a cold cache under concurrent load issues a single fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use utoipa::ToSchema;

use super::canonicalizer::Canonicalizer;
use crate::db::PermissionStore;
use crate::errors::PermissionError;
use crate::models::permission::{CanonicalPermission, PermissionRecord};

pub type ActionSet = Arc<HashSet<String>>;
type RoleSets = HashMap<String, ActionSet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct CacheStats {
    pub warm: bool,
    pub roles: usize,
    /// Store fetches performed since construction
    pub fetches: u64,
    /// Bumped on every invalidation
    pub generation: u64,
}

pub struct PermissionCache {
    store: Arc<dyn PermissionStore>,
    canonicalizer: Canonicalizer,
    state: RwLock<Option<Arc<RoleSets>>>,
    generation: AtomicU64,
    fetches: AtomicU64,
    rebuild: tokio::sync::Mutex<()>,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn PermissionStore>, canonicalizer: Canonicalizer) -> Self {
        Self {
            store,
            canonicalizer,
            state: RwLock::new(None),
            generation: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Option<Arc<RoleSets>>> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<Arc<RoleSets>>> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> Option<Arc<RoleSets>> {
        self.read_state().clone()
    }

    fn lookup(sets: &RoleSets, role_id: &str) -> ActionSet {
        sets.get(role_id).cloned().unwrap_or_default()
    }

    /// Allowed action ids for `role_id`, rebuilding from the store when cold.
    /// Unknown roles yield an empty set.
    pub async fn get(&self, role_id: &str) -> Result<ActionSet, PermissionError> {
        if let Some(sets) = self.snapshot() {
            return Ok(Self::lookup(&sets, role_id));
        }

        let sets = self.load().await?;
        Ok(Self::lookup(&sets, role_id))
    }

    /// Memoized set for `role_id` without touching the store; `None` while cold.
    pub fn peek(&self, role_id: &str) -> Option<ActionSet> {
        self.snapshot().map(|sets| Self::lookup(&sets, role_id))
    }

    pub fn is_warm(&self) -> bool {
        self.read_state().is_some()
    }

    async fn load(&self) -> Result<Arc<RoleSets>, PermissionError> {
        let _guard = self.rebuild.lock().await;

        // Another caller may have finished a rebuild while we waited.
        if let Some(sets) = self.snapshot() {
            return Ok(sets);
        }

        let generation = self.generation.load(Ordering::Acquire);
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let rows = self.store.fetch_allowed().await.map_err(|err| {
            tracing::warn!(error = %err, "permission cache rebuild failed");
            err
        })?;

        let sets = Arc::new(self.build(rows));

        // Compare under the write lock so an invalidate cannot land between
        // the check and the install.
        let mut state = self.write_state();
        if self.generation.load(Ordering::Acquire) == generation {
            *state = Some(Arc::clone(&sets));
            drop(state);
            tracing::debug!(roles = sets.len(), "permission cache rebuilt");
        } else {
            drop(state);
            tracing::debug!("permission cache invalidated during rebuild, result not memoized");
        }

        Ok(sets)
    }

    fn build(&self, rows: Vec<PermissionRecord>) -> RoleSets {
        let mut grouped: HashMap<String, HashSet<String>> = HashMap::new();
        for row in rows.iter().filter(|row| row.allowed) {
            let action_id = self.canonicalizer.canonicalize(&row.resource, &row.action);
            grouped.entry(row.role_id.clone()).or_default().insert(action_id);
        }

        grouped
            .into_iter()
            .map(|(role, actions)| (role, Arc::new(actions)))
            .collect()
    }

    /// Canonical form of one row under this cache's rules. Unlike a rebuild,
    /// this does not report fallbacks to the observer.
    pub fn canonical(&self, record: &PermissionRecord) -> CanonicalPermission {
        CanonicalPermission {
            role_id: record.role_id.clone(),
            action_id: self.canonicalizer.resolve(&record.resource, &record.action).action_id,
            allowed: record.allowed,
        }
    }

    /// Drop the memoized view. The next `get` refetches.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.write_state() = None;
        tracing::debug!("permission cache invalidated");
    }

    /// Clear the cache when its owner shuts down, returning the final stats.
    pub fn teardown(&self) -> CacheStats {
        let stats = self.stats();
        self.invalidate();
        tracing::info!(fetches = stats.fetches, "permission cache torn down");
        stats
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.read_state();
        CacheStats {
            warm: state.is_some(),
            roles: state.as_ref().map(|s| s.len()).unwrap_or(0),
            fetches: self.fetches.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::UnmappedPairTracker;
    use crate::db::MemoryStore;
    use async_trait::async_trait;
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    fn cache_with(store: Arc<MemoryStore>) -> PermissionCache {
        PermissionCache::new(store, Canonicalizer::default())
    }

    #[tokio::test]
    async fn first_get_fetches_then_memoizes() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            PermissionRecord::new("it", "settings", "system", true),
            PermissionRecord::new("it", "logs", "audit", true),
        ]));
        let cache = cache_with(store.clone());

        let first = cache.get("it").await.unwrap();
        let second = cache.get("it").await.unwrap();

        assert!(first.contains("system-settings"));
        assert!(first.contains("audit-logs"));
        assert_eq!(first, second);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn denied_rows_are_excluded() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            PermissionRecord::new("sales", "settings", "system", false),
            PermissionRecord::new("sales", "case", "view-cases", true),
        ]));
        let cache = cache_with(store);

        let sales = cache.get("sales").await.unwrap();
        assert!(!sales.contains("system-settings"));
        assert!(sales.contains("view-cases"));
    }

    #[tokio::test]
    async fn unknown_role_is_empty() {
        let cache = cache_with(Arc::new(MemoryStore::default()));
        assert!(cache.get("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let store = Arc::new(MemoryStore::default());
        let cache = cache_with(store.clone());
        assert!(cache.get("it").await.unwrap().is_empty());

        store.insert(PermissionRecord::new("it", "settings", "email-config", true));
        assert!(cache.get("it").await.unwrap().is_empty());

        cache.invalidate();
        assert!(!cache.is_warm());
        assert!(cache.get("it").await.unwrap().contains("email-config"));
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn fetch_errors_are_not_memoized() {
        let store = Arc::new(MemoryStore::default());
        store.set_unavailable(true);
        let cache = cache_with(store.clone());

        let err = cache.get("it").await.unwrap_err();
        assert!(matches!(err, PermissionError::StoreUnavailable(_)));
        assert!(!cache.is_warm());

        store.set_unavailable(false);
        assert!(cache.get("it").await.is_ok());
        assert!(cache.is_warm());
    }

    #[tokio::test]
    async fn concurrent_cold_reads_share_one_fetch() {
        let store = Arc::new(
            MemoryStore::with_rows(vec![PermissionRecord::new("it", "settings", "system", true)])
                .with_fetch_delay(Duration::from_millis(50)),
        );
        let cache = Arc::new(cache_with(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get("it").await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().contains("system-settings"));
        }

        assert_eq!(store.fetch_count(), 1);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn invalidation_during_rebuild_is_not_lost() {
        let store = Arc::new(MemoryStore::default().with_fetch_delay(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(store.clone()));

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("it").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.insert(PermissionRecord::new("it", "settings", "system", true));
        cache.invalidate();

        reader.await.unwrap().unwrap();
        assert!(!cache.is_warm());
        assert!(cache.get("it").await.unwrap().contains("system-settings"));
    }

    /// Invalidates the cache from inside `fetch_allowed`, after the rows are read.
    struct InvalidatingStore {
        inner: MemoryStore,
        cache: OnceLock<Weak<PermissionCache>>,
    }

    #[async_trait]
    impl PermissionStore for InvalidatingStore {
        async fn fetch_allowed(&self) -> Result<Vec<PermissionRecord>, PermissionError> {
            let rows = self.inner.fetch_allowed().await?;
            if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
                cache.invalidate();
            }
            Ok(rows)
        }

        async fn fetch_all(&self) -> Result<Vec<PermissionRecord>, PermissionError> {
            self.inner.fetch_all().await
        }

        async fn upsert(&self, record: &PermissionRecord) -> Result<(), PermissionError> {
            self.inner.upsert(record).await
        }
    }

    #[tokio::test]
    async fn rebuild_overtaken_by_invalidate_is_not_installed() {
        let store = Arc::new(InvalidatingStore {
            inner: MemoryStore::with_rows(vec![PermissionRecord::new("it", "settings", "system", true)]),
            cache: OnceLock::new(),
        });
        let cache = Arc::new(PermissionCache::new(store.clone(), Canonicalizer::default()));
        let _ = store.cache.set(Arc::downgrade(&cache));

        let sets = cache.get("it").await.unwrap();

        assert!(sets.contains("system-settings"));
        assert!(!cache.is_warm());
        assert!(cache.peek("it").is_none());
        assert_eq!(cache.stats().generation, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invalidate_never_leaves_stale_view() {
        for _ in 0..200 {
            let store = Arc::new(MemoryStore::default());
            let cache = Arc::new(cache_with(store.clone()));

            let reader = {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get("it").await })
            };
            let writer = {
                let cache = Arc::clone(&cache);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.insert(PermissionRecord::new("it", "logs", "audit", true));
                    cache.invalidate();
                })
            };

            reader.await.unwrap().unwrap();
            writer.await.unwrap();

            // Whatever is memoized now must include the write that preceded the invalidate.
            if let Some(sets) = cache.peek("it") {
                assert!(sets.contains("audit-logs"));
            }
        }
    }

    #[test]
    fn matrix_view_canonicalization_is_not_counted() {
        let tracker = Arc::new(UnmappedPairTracker::new());
        let cache = PermissionCache::new(
            Arc::new(MemoryStore::default()),
            Canonicalizer::with_observer(tracker.clone()),
        );

        let view = cache.canonical(&PermissionRecord::new("sales", "widgets", "frobnicate", false));

        assert_eq!(view.action_id, "widgets-frobnicate");
        assert!(!view.allowed);
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test]
    async fn teardown_clears_and_reports() {
        let cache = cache_with(Arc::new(MemoryStore::default()));
        cache.get("it").await.unwrap();

        let stats = cache.teardown();
        assert!(stats.warm);
        assert_eq!(stats.fetches, 1);
        assert!(!cache.is_warm());
        assert!(cache.peek("it").is_none());
    }
}
