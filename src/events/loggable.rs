use serde::{Deserialize, Serialize};

/// Severity levels for audit entries.
/// Controls retention policies and log filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Critical events: long-term retention, never auto-delete
    Critical,
    /// Important events: medium-term retention (default)
    #[default]
    Important,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
        }
    }
}

/// Trait for entities that can be written to the audit trail.
pub trait Loggable: Serialize + Send + Sync {
    /// The entity type name, prefix of event names like "permission.granted"
    fn entity_type() -> &'static str;

    /// The subject the event is about (a role id for permission rows)
    fn subject_id(&self) -> String;

    fn severity(&self) -> Severity {
        Severity::Important
    }

    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "revoked" | "invalidated" => Severity::Critical,
            _ => self.severity(),
        }
    }
}
