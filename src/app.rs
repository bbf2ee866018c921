use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{
    AuthorizationEngine, AuthzMode, Canonicalizer, MatrixEditor, PermissionCache, PolicyEvaluator,
    UnmappedPairTracker,
};
use crate::config::AuthzConfig;
use crate::db::{PermissionStore, SqlitePermissionStore};
use crate::errors::AppError;
use crate::events::{init_event_bus, start_activity_listener, EventBus};
use crate::jwt::{AuthUser, JwtConfig};
use crate::routes::{health, permissions};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub config: AuthzConfig,
    pub store: Arc<dyn PermissionStore>,
    pub cache: Arc<PermissionCache>,
    pub evaluator: Arc<dyn PolicyEvaluator>,
    pub editor: MatrixEditor,
    pub unmapped: Arc<UnmappedPairTracker>,
    pub event_bus: EventBus,
}

impl AppState {
    /// Wire the permission engine over the SQLite store.
    pub fn new(pool: SqlitePool, jwt: JwtConfig, config: AuthzConfig, event_bus: EventBus) -> Self {
        let store: Arc<dyn PermissionStore> = Arc::new(SqlitePermissionStore::new(pool.clone()));
        let unmapped = Arc::new(UnmappedPairTracker::new());
        let canonicalizer = Canonicalizer::with_observer(unmapped.clone());
        let cache = Arc::new(PermissionCache::new(Arc::clone(&store), canonicalizer));
        let evaluator: Arc<dyn PolicyEvaluator> = Arc::new(AuthorizationEngine::new(Arc::clone(&cache)));
        let editor = MatrixEditor::new(Arc::clone(&store), Arc::clone(&cache))
            .with_event_bus(event_bus.clone())
            .with_concurrency(config.write_concurrency);

        Self {
            pool,
            jwt: Arc::new(jwt),
            config,
            store,
            cache,
            evaluator,
            editor,
            unmapped,
            event_bus,
        }
    }

    /// Gate a handler on `action_id` according to the configured enforcement mode.
    pub async fn authorize(&self, auth: &AuthUser, action_id: &str) -> Result<(), AppError> {
        if self.config.mode == AuthzMode::Off {
            return Ok(());
        }

        if self.evaluator.has_permission(&auth.role_id, action_id).await {
            return Ok(());
        }

        match self.config.mode {
            AuthzMode::Advisory => {
                tracing::warn!(
                    user_id = %auth.user_id,
                    role_id = %auth.role_id,
                    action_id = %action_id,
                    "advisory mode: permission denied but request allowed"
                );
                Ok(())
            }
            _ => Err(AppError::forbidden(format!("missing permission: {action_id}"))),
        }
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let authz_config = AuthzConfig::from_env()?;

    let (event_bus, rx) = init_event_bus();
    tokio::spawn(start_activity_listener(rx, pool.clone()));

    let state = AppState::new(pool, jwt_config, authz_config, event_bus);
    Ok(router(state))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let permission_routes = Router::new()
        .route("/registry", get(permissions::action_registry))
        .route("/me", get(permissions::my_permissions))
        .route("/check/:action_id", get(permissions::check))
        .route("/matrix", get(permissions::get_matrix).put(permissions::update_matrix))
        .route("/cache", get(permissions::cache_stats))
        .route("/cache/invalidate", post(permissions::invalidate_cache))
        .route("/unmapped", get(permissions::unmapped_pairs));

    Router::new()
        .route("/api/health", get(health::health))
        .nest("/permissions", permission_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
