//! Bulk edits to the permission matrix.
//!
//! A batch is written through the store and then the cache is invalidated
//! exactly once, after every write has settled. Writes to distinct keys run
//! concurrently; writes to the same key run in submission order so the last
//! one wins. The batch runs on its own task, so a caller that stops waiting
//! does not stop the invalidation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::cache::PermissionCache;
use crate::db::PermissionStore;
use crate::events::{log_activity, CacheInvalidation, EventBus};
use crate::models::permission::{
    BatchResult, ErrorKind, FailedChange, PermissionChange, PermissionKey,
};

pub const DEFAULT_WRITE_CONCURRENCY: usize = 8;

type Outcome = Result<(), (ErrorKind, String)>;

#[derive(Clone)]
pub struct MatrixEditor {
    store: Arc<dyn PermissionStore>,
    cache: Arc<PermissionCache>,
    event_bus: Option<EventBus>,
    concurrency: usize,
}

impl MatrixEditor {
    pub fn new(store: Arc<dyn PermissionStore>, cache: Arc<PermissionCache>) -> Self {
        Self {
            store,
            cache,
            event_bus: None,
            concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn apply_changes(&self, changes: Vec<PermissionChange>) -> BatchResult {
        self.apply_changes_as(changes, None).await
    }

    /// Apply `changes`, attributing audit entries to `actor_id`.
    pub async fn apply_changes_as(
        &self,
        changes: Vec<PermissionChange>,
        actor_id: Option<Uuid>,
    ) -> BatchResult {
        let batch = self.clone();
        let handle = tokio::spawn(async move { batch.run(changes, actor_id).await });

        match handle.await {
            Ok(result) => result,
            Err(err) => {
                // `run` invalidates before returning; a panic skipped that.
                tracing::error!(error = %err, "matrix batch task failed");
                self.cache.invalidate();
                BatchResult::default()
            }
        }
    }

    async fn run(&self, changes: Vec<PermissionChange>, actor_id: Option<Uuid>) -> BatchResult {
        let total = changes.len();
        let mut outcomes: Vec<Option<Outcome>> = vec![None; total];

        // Group by key, keeping submission order inside each group.
        let mut groups: BTreeMap<PermissionKey, Vec<usize>> = BTreeMap::new();
        for (idx, change) in changes.iter().enumerate() {
            match validate(change) {
                Ok(()) => groups.entry(change.key()).or_default().push(idx),
                Err(message) => outcomes[idx] = Some(Err((ErrorKind::InvalidChange, message))),
            }
        }

        let changes = Arc::new(changes);
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut pending: HashSet<usize> = HashSet::new();
        let mut writers = JoinSet::new();

        for (group_id, indices) in groups.into_values().enumerate() {
            pending.insert(group_id);
            let store = Arc::clone(&self.store);
            let changes = Arc::clone(&changes);
            let permits = Arc::clone(&permits);
            writers.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let mut results = Vec::with_capacity(indices.len());
                for idx in indices {
                    let outcome = store
                        .upsert(&changes[idx])
                        .await
                        .map_err(|err| (ErrorKind::StoreUnavailable, err.to_string()));
                    results.push((idx, outcome));
                }
                (group_id, results)
            });
        }

        while let Some(joined) = writers.join_next().await {
            match joined {
                Ok((group_id, results)) => {
                    pending.remove(&group_id);
                    for (idx, outcome) in results {
                        outcomes[idx] = Some(outcome);
                    }
                }
                Err(err) => tracing::error!(error = %err, "permission write task failed"),
            }
        }

        // Every write has settled: safe to expose the batch.
        self.cache.invalidate();

        if !pending.is_empty() {
            tracing::warn!(groups = pending.len(), "permission writes aborted before reporting");
        }

        let mut result = BatchResult::default();
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            let change = &changes[idx];
            match outcome {
                Some(Ok(())) => {
                    result.succeeded.push(change.key());
                    if let Some(bus) = &self.event_bus {
                        let action = if change.allowed { "granted" } else { "revoked" };
                        log_activity(bus, action, actor_id, change);
                    }
                }
                Some(Err((error_kind, message))) => result.failed.push(FailedChange {
                    key: change.key(),
                    error_kind,
                    message,
                }),
                None => result.failed.push(FailedChange {
                    key: change.key(),
                    error_kind: ErrorKind::StoreUnavailable,
                    message: "write task aborted".to_string(),
                }),
            }
        }

        if let Some(bus) = &self.event_bus {
            let invalidation = CacheInvalidation { reason: "matrix edit".to_string() };
            log_activity(bus, "invalidated", actor_id, &invalidation);
        }

        if result.failed.is_empty() {
            tracing::info!(changes = total, "permission matrix updated");
        } else {
            tracing::warn!(
                changes = total,
                succeeded = result.succeeded.len(),
                failed = result.failed.len(),
                "permission matrix partially updated"
            );
        }

        result
    }
}

fn validate(change: &PermissionChange) -> Result<(), String> {
    let blank = [
        ("role_id", &change.role_id),
        ("resource", &change.resource),
        ("action", &change.action),
    ]
    .into_iter()
    .find(|(_, value)| value.trim().is_empty());

    match blank {
        Some((field, _)) => Err(format!("{field} must not be empty")),
        None => Ok(()),
    }
}

impl std::fmt::Debug for MatrixEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixEditor")
            .field("concurrency", &self.concurrency)
            .field("audited", &self.event_bus.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::Canonicalizer;
    use crate::db::MemoryStore;
    use crate::events::init_event_bus;
    use crate::models::permission::PermissionRecord;
    use std::time::Duration;

    fn setup(store: Arc<MemoryStore>) -> (MatrixEditor, Arc<PermissionCache>) {
        let cache = Arc::new(PermissionCache::new(store.clone(), Canonicalizer::default()));
        (MatrixEditor::new(store, cache.clone()), cache)
    }

    fn five_changes() -> Vec<PermissionChange> {
        vec![
            PermissionRecord::new("sales", "case", "create-case", true),
            PermissionRecord::new("sales", "case", "view-cases", true),
            PermissionRecord::new("it", "settings", "system", true),
            PermissionRecord::new("it", "settings", "email-config", true),
            PermissionRecord::new("driver", "status", "delivered-hospital", true),
        ]
    }

    #[tokio::test]
    async fn one_failing_write_does_not_stop_the_batch() {
        let store = Arc::new(MemoryStore::default());
        store.fail_on(PermissionRecord::new("it", "settings", "system", true).key());
        let (editor, cache) = setup(store.clone());
        let before = cache.stats().generation;

        let result = editor.apply_changes(five_changes()).await;

        assert_eq!(result.succeeded.len(), 4);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].key.action, "system");
        assert_eq!(result.failed[0].error_kind, ErrorKind::StoreUnavailable);
        assert_eq!(cache.stats().generation, before + 1);
        assert_eq!(store.row_count(), 4);
    }

    #[tokio::test]
    async fn results_follow_submission_order() {
        let (editor, _) = setup(Arc::new(MemoryStore::default()));
        let changes = five_changes();
        let expected: Vec<PermissionKey> = changes.iter().map(|c| c.key()).collect();

        let result = editor.apply_changes(changes).await;
        assert_eq!(result.succeeded, expected);
    }

    #[tokio::test]
    async fn reapplying_a_batch_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let (editor, _) = setup(store.clone());

        editor.apply_changes(five_changes()).await;
        let again = editor.apply_changes(five_changes()).await;

        assert!(again.is_complete());
        assert_eq!(store.row_count(), 5);
    }

    #[tokio::test]
    async fn batch_is_visible_on_next_read() {
        let store = Arc::new(MemoryStore::default());
        let (editor, cache) = setup(store);
        assert!(cache.get("sales").await.unwrap().is_empty());

        editor.apply_changes(five_changes()).await;

        assert!(!cache.is_warm());
        assert!(cache.get("sales").await.unwrap().contains("create-case"));
    }

    #[tokio::test]
    async fn blank_fields_are_rejected_without_a_write() {
        let store = Arc::new(MemoryStore::default());
        let (editor, cache) = setup(store.clone());
        let before = cache.stats().generation;

        let result = editor
            .apply_changes(vec![
                PermissionRecord::new("", "case", "create-case", true),
                PermissionRecord::new("sales", "case", " ", true),
            ])
            .await;

        assert_eq!(result.failed.len(), 2);
        assert!(result.failed.iter().all(|f| f.error_kind == ErrorKind::InvalidChange));
        assert_eq!(result.failed[0].message, "role_id must not be empty");
        assert_eq!(store.upsert_count(), 0);
        assert_eq!(cache.stats().generation, before + 1);
    }

    #[tokio::test]
    async fn same_key_last_write_wins() {
        let store = Arc::new(MemoryStore::default().with_write_delay(Duration::from_millis(5)));
        let (editor, _) = setup(store.clone());
        let grant = PermissionRecord::new("sales", "case", "delete-case", true);
        let revoke = PermissionRecord::new("sales", "case", "delete-case", false);

        let result = editor.apply_changes(vec![grant.clone(), revoke, grant.clone()]).await;

        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(store.allowed(&grant.key()), Some(true));
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn dropped_caller_still_invalidates() {
        let store = Arc::new(MemoryStore::default().with_write_delay(Duration::from_millis(30)));
        let (editor, cache) = setup(store.clone());
        cache.get("sales").await.unwrap();
        let before = cache.stats().generation;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            editor.apply_changes(five_changes()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.row_count(), 5);
        assert_eq!(cache.stats().generation, before + 1);
    }

    #[tokio::test]
    async fn successful_writes_are_audited() {
        let store = Arc::new(MemoryStore::default());
        let (bus, mut rx) = init_event_bus();
        let (editor, _) = setup(store);
        let editor = editor.with_event_bus(bus);

        editor
            .apply_changes(vec![
                PermissionRecord::new("sales", "case", "create-case", true),
                PermissionRecord::new("sales", "case", "delete-case", false),
            ])
            .await;

        let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e["name"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "permission.granted".to_string(),
                "permission.revoked".to_string(),
                "permission_cache.invalidated".to_string(),
            ]
        );
    }
}
