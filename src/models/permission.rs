use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::events::{Loggable, Severity};

// =============================================================================
// PERMISSION RECORD
// =============================================================================

/// One persisted row of the permission table, keyed by `(role_id, resource, action)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PermissionRecord {
    #[schema(example = "it")]
    pub role_id: String,
    #[schema(example = "settings")]
    pub resource: String,
    #[schema(example = "email-config")]
    pub action: String,
    pub allowed: bool,
}

impl PermissionRecord {
    pub fn new(
        role_id: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        allowed: bool,
    ) -> Self {
        Self {
            role_id: role_id.into(),
            resource: resource.into(),
            action: action.into(),
            allowed,
        }
    }

    pub fn key(&self) -> PermissionKey {
        PermissionKey {
            role_id: self.role_id.clone(),
            resource: self.resource.clone(),
            action: self.action.clone(),
        }
    }
}

impl Loggable for PermissionRecord {
    fn entity_type() -> &'static str { "permission" }
    fn subject_id(&self) -> String { self.role_id.clone() }
    fn severity(&self) -> Severity { Severity::Critical }

    fn severity_for_action(&self, _action: &str) -> Severity {
        Severity::Critical
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct PermissionKey {
    pub role_id: String,
    pub resource: String,
    pub action: String,
}

impl std::fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.role_id, self.resource, self.action)
    }
}

/// A record after its `(resource, action)` pair has been canonicalized. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CanonicalPermission {
    pub role_id: String,
    #[schema(example = "email-config")]
    pub action_id: String,
    pub allowed: bool,
}

// =============================================================================
// MATRIX EDITS
// =============================================================================

pub type PermissionChange = PermissionRecord;

#[derive(Debug, Deserialize, ToSchema)]
pub struct MatrixUpdateRequest {
    pub changes: Vec<PermissionChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The store could not be reached or rejected the write.
    StoreUnavailable,
    /// The change was malformed and never sent to the store.
    InvalidChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct FailedChange {
    pub key: PermissionKey,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Outcome of a bulk matrix edit. Every submitted change lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct BatchResult {
    pub succeeded: Vec<PermissionKey>,
    pub failed: Vec<FailedChange>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// MATRIX VIEW
// =============================================================================

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoleMatrix {
    pub role_id: String,
    /// Canonical action ids granted to the role, sorted
    pub granted: Vec<String>,
    /// Canonical action ids with a persisted `allowed = false` row, sorted
    pub denied: Vec<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatrixView {
    pub roles: Vec<RoleMatrix>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionCheck {
    pub role_id: String,
    pub action_id: String,
    pub allowed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RolePermissions {
    pub role_id: String,
    pub actions: Vec<String>,
}
