use std::sync::Arc;

use sqlx::SqlitePool;

use case_authz::authz::{AuthorizationEngine, Canonicalizer, MatrixEditor, PermissionCache, PolicyEvaluator};
use case_authz::db::{MemoryStore, PermissionStore, SqlitePermissionStore};
use case_authz::models::permission::{ErrorKind, PermissionRecord};

fn wire(store: Arc<dyn PermissionStore>) -> (MatrixEditor, AuthorizationEngine, Arc<PermissionCache>) {
    let cache = Arc::new(PermissionCache::new(Arc::clone(&store), Canonicalizer::default()));
    let editor = MatrixEditor::new(store, Arc::clone(&cache));
    (editor, AuthorizationEngine::new(Arc::clone(&cache)), cache)
}

fn batch() -> Vec<PermissionRecord> {
    vec![
        PermissionRecord::new("sales", "case", "create-case", true),
        PermissionRecord::new("sales-manager", "case", "amend-case", true),
        PermissionRecord::new("it", "settings", "email-configuration", true),
        PermissionRecord::new("operations", "case", "process-order", true),
        PermissionRecord::new("driver", "case", "cancel-case", false),
    ]
}

#[sqlx::test]
async fn reapplying_a_batch_leaves_one_row_per_key(pool: SqlitePool) {
    let store = SqlitePermissionStore::new(pool.clone());
    let (editor, _, _) = wire(Arc::new(store.clone()));

    let first = editor.apply_changes(batch()).await;
    let second = editor.apply_changes(batch()).await;
    assert!(first.is_complete());
    assert!(second.is_complete());

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM role_permissions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 5);
    for change in batch() {
        assert_eq!(store.count_rows(&change.key()).await.unwrap(), 1);
    }
}

#[sqlx::test]
async fn revocation_is_visible_on_the_next_check(pool: SqlitePool) {
    let (editor, engine, _) = wire(Arc::new(SqlitePermissionStore::new(pool)));

    editor.apply_changes(batch()).await;
    assert!(engine.has_permission("it", "email-config").await);
    assert!(!engine.has_permission("driver", "cancel-case").await);

    editor
        .apply_changes(vec![PermissionRecord::new("it", "settings", "email-configuration", false)])
        .await;
    assert!(!engine.has_permission("it", "email-config").await);
    assert!(engine.has_permission("sales", "create-case").await);
}

#[tokio::test]
async fn store_failure_is_reported_per_change() {
    let store = Arc::new(MemoryStore::new());
    store.fail_on(PermissionRecord::new("operations", "case", "process-order", true).key());
    let (editor, engine, cache) = wire(store.clone());
    let generation = cache.stats().generation;

    let result = editor.apply_changes(batch()).await;

    assert_eq!(result.succeeded.len(), 4);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].key.role_id, "operations");
    assert_eq!(result.failed[0].error_kind, ErrorKind::StoreUnavailable);
    assert_eq!(cache.stats().generation, generation + 1);

    assert!(engine.has_permission("sales", "create-case").await);
    assert!(!engine.has_permission("operations", "process-order").await);
}

#[tokio::test]
async fn unavailable_store_denies_everyone_but_admin() {
    let store = Arc::new(MemoryStore::with_rows(batch()));
    store.set_unavailable(true);
    let (_, engine, cache) = wire(store);

    assert!(!engine.has_permission("sales", "create-case").await);
    assert!(engine.has_permission("admin", "create-case").await);
    assert!(!cache.is_warm());
}
