//! Canonical action ids, grouped by feature area.
//!
//! The registry is shared vocabulary for the matrix UI and the canonicalizer's
//! rule targets. The engine never consults it to deny anything: an id missing
//! from here is simply never granted to a non-admin role.

use serde::Serialize;
use utoipa::ToSchema;

/// Well-known action ids
pub mod actions {
    // Case management
    pub const CREATE_CASE: &str = "create-case";
    pub const VIEW_CASES: &str = "view-cases";
    pub const EDIT_CASE: &str = "edit-case";
    pub const AMEND_CASE: &str = "amend-case";
    pub const CANCEL_CASE: &str = "cancel-case";
    pub const DELETE_CASE: &str = "delete-case";
    pub const BOOKING_CALENDAR: &str = "booking-calendar";

    // Status transitions
    pub const PROCESS_ORDER: &str = "process-order";
    pub const ORDER_PROCESSED: &str = "order-processed";
    pub const PENDING_DELIVERY_HOSPITAL: &str = "pending-delivery-hospital";
    pub const DELIVERED_HOSPITAL: &str = "delivered-hospital";
    pub const CASE_COMPLETED: &str = "case-completed";
    pub const PENDING_DELIVERY_OFFICE: &str = "pending-delivery-office";
    pub const DELIVERED_OFFICE: &str = "delivered-office";
    pub const TO_BE_BILLED: &str = "to-be-billed";
    pub const CASE_CLOSED: &str = "case-closed";

    // User management
    pub const VIEW_USERS: &str = "view-users";
    pub const CREATE_USER: &str = "create-user";
    pub const EDIT_USER: &str = "edit-user";
    pub const DELETE_USER: &str = "delete-user";
    pub const ENABLE_DISABLE_USER: &str = "enable-disable-user";

    // Settings
    pub const SYSTEM_SETTINGS: &str = "system-settings";
    pub const EMAIL_CONFIG: &str = "email-config";
    pub const PERMISSION_MATRIX: &str = "permission-matrix";
    pub const CODE_TABLE_SETUP: &str = "code-table-setup";
    pub const AUDIT_LOGS: &str = "audit-logs";
    pub const BACKUP_RESTORE: &str = "backup-restore";

    // Data operations
    pub const VIEW_REPORTS: &str = "view-reports";
    pub const EXPORT_DATA: &str = "export-data";
    pub const IMPORT_DATA: &str = "import-data";

    // File operations
    pub const UPLOAD_FILES: &str = "upload-files";
    pub const DOWNLOAD_FILES: &str = "download-files";
    pub const DELETE_FILES: &str = "delete-files";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeatureArea {
    CaseManagement,
    StatusTransitions,
    UserManagement,
    Settings,
    DataOperations,
    FileOperations,
}

impl FeatureArea {
    pub const ALL: [FeatureArea; 6] = [
        FeatureArea::CaseManagement,
        FeatureArea::StatusTransitions,
        FeatureArea::UserManagement,
        FeatureArea::Settings,
        FeatureArea::DataOperations,
        FeatureArea::FileOperations,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            FeatureArea::CaseManagement => "Case Management",
            FeatureArea::StatusTransitions => "Status Transitions",
            FeatureArea::UserManagement => "User Management",
            FeatureArea::Settings => "Settings",
            FeatureArea::DataOperations => "Data Operations",
            FeatureArea::FileOperations => "File Operations",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct ActionDef {
    #[schema(value_type = String)]
    pub id: &'static str,
    pub area: FeatureArea,
    #[schema(value_type = String)]
    pub description: &'static str,
}

const fn def(id: &'static str, area: FeatureArea, description: &'static str) -> ActionDef {
    ActionDef { id, area, description }
}

use actions::*;
use FeatureArea::*;

pub static REGISTRY: &[ActionDef] = &[
    def(CREATE_CASE, CaseManagement, "Book a new case"),
    def(VIEW_CASES, CaseManagement, "Browse and search cases"),
    def(EDIT_CASE, CaseManagement, "Edit case details"),
    def(AMEND_CASE, CaseManagement, "Amend a submitted case"),
    def(CANCEL_CASE, CaseManagement, "Cancel a case"),
    def(DELETE_CASE, CaseManagement, "Delete a case"),
    def(BOOKING_CALENDAR, CaseManagement, "View the booking calendar"),
    def(PROCESS_ORDER, StatusTransitions, "Start processing an order"),
    def(ORDER_PROCESSED, StatusTransitions, "Mark an order as processed"),
    def(PENDING_DELIVERY_HOSPITAL, StatusTransitions, "Mark pending delivery to hospital"),
    def(DELIVERED_HOSPITAL, StatusTransitions, "Mark delivered to hospital"),
    def(CASE_COMPLETED, StatusTransitions, "Mark a case as completed"),
    def(PENDING_DELIVERY_OFFICE, StatusTransitions, "Mark pending return to office"),
    def(DELIVERED_OFFICE, StatusTransitions, "Mark returned to office"),
    def(TO_BE_BILLED, StatusTransitions, "Mark ready for billing"),
    def(CASE_CLOSED, StatusTransitions, "Close a case"),
    def(VIEW_USERS, UserManagement, "List users"),
    def(CREATE_USER, UserManagement, "Create users"),
    def(EDIT_USER, UserManagement, "Edit users"),
    def(DELETE_USER, UserManagement, "Delete users"),
    def(ENABLE_DISABLE_USER, UserManagement, "Enable or disable accounts"),
    def(SYSTEM_SETTINGS, Settings, "Change system settings"),
    def(EMAIL_CONFIG, Settings, "Configure email notifications"),
    def(PERMISSION_MATRIX, Settings, "Edit the permission matrix"),
    def(CODE_TABLE_SETUP, Settings, "Maintain code tables"),
    def(AUDIT_LOGS, Settings, "Read audit logs"),
    def(BACKUP_RESTORE, Settings, "Back up and restore data"),
    def(VIEW_REPORTS, DataOperations, "View reports"),
    def(EXPORT_DATA, DataOperations, "Export data"),
    def(IMPORT_DATA, DataOperations, "Import data"),
    def(UPLOAD_FILES, FileOperations, "Upload attachments"),
    def(DOWNLOAD_FILES, FileOperations, "Download attachments"),
    def(DELETE_FILES, FileOperations, "Delete attachments"),
];

pub fn is_registered(action_id: &str) -> bool {
    REGISTRY.iter().any(|a| a.id == action_id)
}

pub fn lookup(action_id: &str) -> Option<&'static ActionDef> {
    REGISTRY.iter().find(|a| a.id == action_id)
}

pub fn all_action_ids() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|a| a.id)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FeatureGroup {
    pub area: FeatureArea,
    #[schema(value_type = String)]
    pub label: &'static str,
    pub actions: Vec<ActionDef>,
}

/// The registry grouped by area, in display order.
pub fn grouped() -> Vec<FeatureGroup> {
    FeatureArea::ALL
        .iter()
        .map(|area| FeatureGroup {
            area: *area,
            label: area.label(),
            actions: REGISTRY.iter().filter(|a| a.area == *area).copied().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<&str> = all_action_ids().collect();
        assert_eq!(ids.len(), REGISTRY.len());
    }

    #[test]
    fn every_area_is_populated() {
        let groups = grouped();
        assert_eq!(groups.len(), FeatureArea::ALL.len());
        assert!(groups.iter().all(|g| !g.actions.is_empty()));
        let total: usize = groups.iter().map(|g| g.actions.len()).sum();
        assert_eq!(total, REGISTRY.len());
    }

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(lookup("audit-logs").map(|a| a.area), Some(FeatureArea::Settings));
        assert!(!is_registered("foo-bar"));
    }
}
