//! Maps persisted `(resource, action)` pairs onto canonical action ids.
//!
//! Resolution order:
//! 1. exact rules, in table order (first match wins)
//! 2. pass-through: the persisted action already is a registered action id
//! 3. fallback: `"{resource}-{action}"`, reported to the [`MappingObserver`]
//!
//! The function is total. Blank inputs are read as `"unknown"`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use utoipa::ToSchema;

use super::registry::{self, actions};

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Literal `(resource, action)` match
    Exact {
        resource: &'static str,
        action: &'static str,
        action_id: &'static str,
    },
    /// Matches when the persisted action is itself a registered action id
    RegisteredAction,
}

const fn exact(resource: &'static str, action: &'static str, action_id: &'static str) -> Rule {
    Rule::Exact { resource, action, action_id }
}

pub static DEFAULT_RULES: &[Rule] = &[
    exact("settings", "system", actions::SYSTEM_SETTINGS),
    exact("settings", "system-settings", actions::SYSTEM_SETTINGS),
    exact("settings", "email-config", actions::EMAIL_CONFIG),
    exact("settings", "email-configuration", actions::EMAIL_CONFIG),
    exact("settings", "permission-matrix", actions::PERMISSION_MATRIX),
    exact("settings", "permissions", actions::PERMISSION_MATRIX),
    exact("settings", "code-table-setup", actions::CODE_TABLE_SETUP),
    exact("settings", "code-tables", actions::CODE_TABLE_SETUP),
    exact("settings", "backup", actions::BACKUP_RESTORE),
    exact("logs", "audit", actions::AUDIT_LOGS),
    exact("logs", "audit-logs", actions::AUDIT_LOGS),
    exact("data", "export", actions::EXPORT_DATA),
    exact("data", "import", actions::IMPORT_DATA),
    exact("reports", "view", actions::VIEW_REPORTS),
    Rule::RegisteredAction,
];

impl Rule {
    fn apply(&self, resource: &str, action: &str) -> Option<String> {
        match self {
            Rule::Exact { resource: r, action: a, action_id } if *r == resource && *a == action => {
                Some((*action_id).to_string())
            }
            Rule::Exact { .. } => None,
            Rule::RegisteredAction => registry::is_registered(action).then(|| action.to_string()),
        }
    }
}

fn normalize(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNKNOWN
    } else {
        trimmed
    }
}

/// Result of resolving one pair against a rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub action_id: String,
    /// Index of the rule that matched, `None` for the fallback composition
    pub rule: Option<usize>,
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        self.rule.is_none()
    }
}

pub fn resolve(rules: &[Rule], resource: &str, action: &str) -> Resolution {
    let resource = normalize(resource);
    let action = normalize(action);

    for (idx, rule) in rules.iter().enumerate() {
        if let Some(action_id) = rule.apply(resource, action) {
            return Resolution { action_id, rule: Some(idx) };
        }
    }

    Resolution {
        action_id: format!("{}-{}", resource, action),
        rule: None,
    }
}

/// Canonical id for a pair using [`DEFAULT_RULES`]. No observer is notified.
pub fn canonicalize(resource: &str, action: &str) -> String {
    resolve(DEFAULT_RULES, resource, action).action_id
}

/// Receives fallback resolutions so unmapped pairs can be curated into rules.
pub trait MappingObserver: Send + Sync {
    fn unmapped(&self, resource: &str, action: &str, action_id: &str);
}

/// One fallback pair as seen by [`UnmappedPairTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct UnmappedPair {
    pub resource: String,
    pub action: String,
    /// Fallback id the pair resolved to
    pub action_id: String,
    pub hits: u64,
}

/// Default observer: warns the first time a pair falls back and counts every hit.
#[derive(Debug, Default)]
pub struct UnmappedPairTracker {
    seen: Mutex<BTreeMap<(String, String), UnmappedPair>>,
}

impl UnmappedPairTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pair seen so far, sorted by `(resource, action)`.
    pub fn snapshot(&self) -> Vec<UnmappedPair> {
        let seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.values().cloned().collect()
    }
}

impl MappingObserver for UnmappedPairTracker {
    fn unmapped(&self, resource: &str, action: &str, action_id: &str) {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = seen
            .entry((resource.to_string(), action.to_string()))
            .or_insert_with(|| UnmappedPair {
                resource: resource.to_string(),
                action: action.to_string(),
                action_id: action_id.to_string(),
                hits: 0,
            });
        entry.hits += 1;
        if entry.hits == 1 {
            tracing::warn!(
                resource = %resource,
                action = %action,
                action_id = %action_id,
                "unmapped permission pair, using fallback id"
            );
        }
    }
}

/// A rule table bound to an observer.
#[derive(Clone)]
pub struct Canonicalizer {
    rules: Arc<[Rule]>,
    observer: Arc<dyn MappingObserver>,
}

impl Canonicalizer {
    pub fn new(rules: impl Into<Arc<[Rule]>>, observer: Arc<dyn MappingObserver>) -> Self {
        Self {
            rules: rules.into(),
            observer,
        }
    }

    pub fn with_observer(observer: Arc<dyn MappingObserver>) -> Self {
        Self::new(DEFAULT_RULES, observer)
    }

    /// Resolve without notifying the observer.
    pub fn resolve(&self, resource: &str, action: &str) -> Resolution {
        resolve(&self.rules, resource, action)
    }

    pub fn canonicalize(&self, resource: &str, action: &str) -> String {
        let resolution = self.resolve(resource, action);
        if resolution.is_fallback() {
            self.observer
                .unmapped(normalize(resource), normalize(action), &resolution.action_id);
        }
        resolution.action_id
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::with_observer(Arc::new(UnmappedPairTracker::new()))
    }
}

impl std::fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}
