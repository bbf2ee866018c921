use std::sync::Arc;

use async_trait::async_trait;

use super::cache::PermissionCache;
use super::registry;
use super::roles;

/// The one place the admin bypass is decided. Every authorization check goes
/// through here before any matrix data is consulted.
pub fn is_admin_bypass(role_id: &str) -> bool {
    role_id == roles::ADMIN
}

/// Policy evaluator trait for pluggable authorization logic
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Whether `role_id` may perform `action_id`. Never fails; unknown means no.
    async fn has_permission(&self, role_id: &str, action_id: &str) -> bool;

    /// Every action id granted to `role_id`, sorted.
    async fn permitted_actions(&self, role_id: &str) -> Vec<String>;
}

/// Default evaluator backed by the permission cache.
///
/// Evaluation order:
/// 1. admin role -> allow
/// 2. canonical action id present in the role's cached set -> allow
/// 3. deny (including when the cache cannot be rebuilt)
#[derive(Debug, Clone)]
pub struct AuthorizationEngine {
    cache: Arc<PermissionCache>,
}

impl AuthorizationEngine {
    pub fn new(cache: Arc<PermissionCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PolicyEvaluator for AuthorizationEngine {
    async fn has_permission(&self, role_id: &str, action_id: &str) -> bool {
        if is_admin_bypass(role_id) {
            tracing::debug!(role_id = %role_id, action_id = %action_id, "admin bypass");
            return true;
        }

        match self.cache.get(role_id).await {
            Ok(actions) => {
                let allowed = actions.contains(action_id);
                tracing::debug!(
                    role_id = %role_id,
                    action_id = %action_id,
                    allowed,
                    "permission decision"
                );
                allowed
            }
            Err(err) => {
                tracing::warn!(
                    role_id = %role_id,
                    action_id = %action_id,
                    error = %err,
                    "permission data unavailable, denying"
                );
                false
            }
        }
    }

    async fn permitted_actions(&self, role_id: &str) -> Vec<String> {
        if is_admin_bypass(role_id) {
            let mut actions: Vec<String> = registry::all_action_ids().map(String::from).collect();
            actions.sort();
            return actions;
        }

        match self.cache.get(role_id).await {
            Ok(actions) => {
                let mut actions: Vec<String> = actions.iter().cloned().collect();
                actions.sort();
                actions
            }
            Err(err) => {
                tracing::warn!(role_id = %role_id, error = %err, "permission data unavailable, no actions granted");
                Vec::new()
            }
        }
    }
}
