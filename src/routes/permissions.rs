//! Permission API Routes
//!
//! Authorization queries for the UI plus the administrative matrix editor.
//! Matrix edits and manual cache invalidations are written to the audit log.

use std::collections::{BTreeMap, BTreeSet};

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use crate::app::AppState;
use crate::authz::registry::{self, FeatureGroup};
use crate::authz::{actions, CacheStats, UnmappedPair};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, CacheInvalidation, RequestContext};
use crate::jwt::AuthUser;
use crate::models::permission::*;

// =============================================================================
// AUTHORIZATION QUERIES
// =============================================================================

/// Action registry grouped by feature area
#[utoipa::path(
    get,
    path = "/permissions/registry",
    tag = "Permissions",
    responses(
        (status = 200, description = "Known action ids by feature area", body = Vec<FeatureGroup>),
    ),
    security(("bearerAuth" = []))
)]
pub async fn action_registry(_auth: AuthUser) -> Json<Vec<FeatureGroup>> {
    Json(registry::grouped())
}

/// Actions granted to the caller's role
#[utoipa::path(
    get,
    path = "/permissions/me",
    tag = "Permissions",
    responses(
        (status = 200, description = "Permitted action ids", body = RolePermissions),
    ),
    security(("bearerAuth" = []))
)]
pub async fn my_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Json<RolePermissions> {
    let actions = state.evaluator.permitted_actions(&auth.role_id).await;
    Json(RolePermissions {
        role_id: auth.role_id,
        actions,
    })
}

/// Check one action for the caller's role
#[utoipa::path(
    get,
    path = "/permissions/check/{action_id}",
    tag = "Permissions",
    params(
        ("action_id" = String, Path, description = "Canonical action id"),
    ),
    responses(
        (status = 200, description = "Authorization decision", body = PermissionCheck),
    ),
    security(("bearerAuth" = []))
)]
pub async fn check(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(action_id): Path<String>,
) -> Json<PermissionCheck> {
    let allowed = state.evaluator.has_permission(&auth.role_id, &action_id).await;
    Json(PermissionCheck {
        role_id: auth.role_id,
        action_id,
        allowed,
    })
}

// =============================================================================
// MATRIX
// =============================================================================

/// Current permission matrix, canonicalized and grouped by role
#[utoipa::path(
    get,
    path = "/permissions/matrix",
    tag = "Permissions",
    responses(
        (status = 200, description = "Permission matrix", body = MatrixView),
        (status = 403, description = "Caller may not view the matrix"),
        (status = 503, description = "Permission store unavailable"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_matrix(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<MatrixView>> {
    state.authorize(&auth, actions::PERMISSION_MATRIX).await?;

    let rows = state.store.fetch_all().await?;
    Ok(Json(build_matrix(&state, &rows)))
}

/// Apply a batch of matrix edits
#[utoipa::path(
    put,
    path = "/permissions/matrix",
    tag = "Permissions",
    request_body = MatrixUpdateRequest,
    responses(
        (status = 200, description = "Per-change outcome, including partial failures", body = BatchResult),
        (status = 400, description = "Empty batch"),
        (status = 403, description = "Caller may not edit the matrix"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_matrix(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<MatrixUpdateRequest>,
) -> AppResult<Json<BatchResult>> {
    state.authorize(&auth, actions::PERMISSION_MATRIX).await?;

    if req.changes.is_empty() {
        return Err(AppError::bad_request("changes must not be empty"));
    }

    let result = state
        .editor
        .apply_changes_as(req.changes, Some(auth.user_id))
        .await;

    Ok(Json(result))
}

fn build_matrix(state: &AppState, rows: &[PermissionRecord]) -> MatrixView {
    let mut by_role: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();

    for row in rows {
        let permission = state.cache.canonical(row);
        let (granted, denied) = by_role.entry(permission.role_id).or_default();
        if permission.allowed {
            granted.insert(permission.action_id);
        } else {
            denied.insert(permission.action_id);
        }
    }

    let roles = by_role
        .into_iter()
        .map(|(role_id, (granted, denied))| RoleMatrix {
            role_id,
            // Two spellings of one action may disagree; a grant wins, matching the cache.
            denied: denied.difference(&granted).cloned().collect(),
            granted: granted.into_iter().collect(),
        })
        .collect();

    MatrixView { roles }
}

// =============================================================================
// CACHE
// =============================================================================

/// Permission cache statistics
#[utoipa::path(
    get,
    path = "/permissions/cache",
    tag = "Permissions",
    responses(
        (status = 200, description = "Cache statistics", body = CacheStats),
    ),
    security(("bearerAuth" = []))
)]
pub async fn cache_stats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<CacheStats>> {
    state.authorize(&auth, actions::PERMISSION_MATRIX).await?;
    Ok(Json(state.cache.stats()))
}

/// Drop the permission cache after an out-of-band change to the table
#[utoipa::path(
    post,
    path = "/permissions/cache/invalidate",
    tag = "Permissions",
    responses(
        (status = 200, description = "Cache invalidated", body = CacheStats),
        (status = 403, description = "Caller may not manage permissions"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
) -> AppResult<Json<CacheStats>> {
    state.authorize(&auth, actions::PERMISSION_MATRIX).await?;

    state.cache.invalidate();

    log_activity_with_context(
        &state.event_bus,
        "invalidated",
        Some(auth.user_id),
        &CacheInvalidation { reason: "manual".to_string() },
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(state.cache.stats()))
}

/// Persisted pairs that fell back to composed ids, for curation into rules
#[utoipa::path(
    get,
    path = "/permissions/unmapped",
    tag = "Permissions",
    responses(
        (status = 200, description = "Unmapped resource/action pairs", body = Vec<UnmappedPair>),
    ),
    security(("bearerAuth" = []))
)]
pub async fn unmapped_pairs(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<UnmappedPair>>> {
    state.authorize(&auth, actions::PERMISSION_MATRIX).await?;

    let pairs = state.unmapped.snapshot();

    Ok(Json(pairs))
}
