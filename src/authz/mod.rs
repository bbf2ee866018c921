//! Authorization module - permission resolution engine
//!
//! This module implements role-based permission resolution with:
//! - Canonicalization of persisted `(resource, action)` pairs into action ids
//! - A memoized per-role view of the permission table
//! - Admin bypass decided in a single policy function
//! - Bulk matrix edits with per-item failure reporting
//! - Configurable HTTP enforcement modes (off/advisory/strict)

mod cache;
mod canonicalizer;
mod editor;
mod engine;
pub mod registry;

pub use cache::{ActionSet, CacheStats, PermissionCache};
pub use canonicalizer::{
    canonicalize, resolve, Canonicalizer, MappingObserver, Resolution, Rule, UnmappedPair,
    UnmappedPairTracker, DEFAULT_RULES,
};
pub use editor::{MatrixEditor, DEFAULT_WRITE_CONCURRENCY};
pub use engine::{is_admin_bypass, AuthorizationEngine, PolicyEvaluator};
pub use registry::actions;

use crate::errors::AppError;

/// Authorization enforcement mode for HTTP handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzMode {
    /// No permission checks (development mode)
    Off,
    /// Log denials but allow requests (testing mode)
    Advisory,
    /// Enforce 403 on denied requests (production mode)
    Strict,
}

impl AuthzMode {
    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_lowercase().as_str() {
            "" | "strict" => Ok(AuthzMode::Strict),
            "advisory" => Ok(AuthzMode::Advisory),
            "off" => Ok(AuthzMode::Off),
            other => Err(AppError::configuration(format!(
                "AUTHZ_MODE must be one of off, advisory, strict (got {other})"
            ))),
        }
    }
}

/// Well-known role names
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const IT: &str = "it";
    pub const OPERATIONS: &str = "operations";
    pub const OPERATIONS_MANAGER: &str = "operations-manager";
    pub const SALES: &str = "sales";
    pub const SALES_MANAGER: &str = "sales-manager";
    pub const DRIVER: &str = "driver";
}
