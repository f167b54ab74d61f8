//! Operator endpoints: statistics, runtime settings, maintenance mode and
//! manual invalidation.
//!
//! Settings changes apply to the node that receives them.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::config::RuntimeSettings;
use crate::error::{AppError, AppResult, PermissionError};
use crate::invalidation::{BatchReport, InvalidationTask};
use crate::resolver::{L2, ResolverStats};
use crate::state::AppState;

/// Create the ops router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ops/stats", get(stats))
        .route("/ops/config", get(get_config).put(put_config))
        .route("/ops/maintenance", post(set_maintenance))
        .route("/ops/invalidate", post(invalidate))
        .route("/ops/dead-letters", get(dead_letters))
}

async fn stats(State(state): State<AppState>) -> Json<ResolverStats> {
    Json(state.resolver().stats().await)
}

async fn get_config(State(state): State<AppState>) -> Json<RuntimeSettings> {
    Json(state.resolver().settings())
}

async fn put_config(
    State(state): State<AppState>,
    Json(settings): Json<RuntimeSettings>,
) -> AppResult<Json<RuntimeSettings>> {
    validate(&settings).map_err(AppError::BadRequest)?;
    state.resolver().set_settings(settings);
    info!("runtime settings replaced via ops API");
    Ok(Json(state.resolver().settings()))
}

#[derive(Debug, Deserialize)]
struct MaintenanceRequest {
    enabled: bool,
}

async fn set_maintenance(
    State(state): State<AppState>,
    Json(request): Json<MaintenanceRequest>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .resolver()
        .resilience()
        .set_maintenance(request.enabled)
        .await
        .map_err(|e| PermissionError::unavailable(L2, e))?;
    Ok(Json(serde_json::json!({ "maintenance": request.enabled })))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
enum InvalidateRequest {
    User(String),
    Role(String),
    Scope(String),
}

async fn invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> AppResult<Json<BatchReport>> {
    let resolver = state.resolver();
    let report = match &request {
        InvalidateRequest::User(id) => resolver.invalidate_user(id).await?,
        InvalidateRequest::Role(id) => resolver.invalidate_role(id).await?,
        InvalidateRequest::Scope(id) => resolver.invalidate_scope(id).await?,
    };
    info!(request = ?request, keys_removed = report.keys_removed, "manual invalidation");
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    limit: Option<usize>,
}

async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> AppResult<Json<Vec<InvalidationTask>>> {
    let tasks = state
        .resolver()
        .coordinator()
        .dead_letters(query.limit.unwrap_or(100).min(1_000))
        .await
        .map_err(|e| PermissionError::unavailable(L2, e))?;
    Ok(Json(tasks))
}

/// Reject settings no component can run with.
fn validate(settings: &RuntimeSettings) -> Result<(), String> {
    if settings.resolver.deadline_ms == 0 {
        return Err("resolver.deadline_ms must be positive".into());
    }
    if settings.cache.capacity == 0 || settings.cache.capacity > settings.cache.max_capacity {
        return Err("cache.capacity must be between 1 and cache.max_capacity".into());
    }
    if settings.invalidation.max_attempts == 0 {
        return Err("invalidation.max_attempts must be at least 1".into());
    }
    let guards =
        std::iter::once(&settings.resilience.default).chain(settings.resilience.overrides.values());
    for guard in guards {
        if guard.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".into());
        }
        if guard.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be positive".into());
        }
    }
    Ok(())
}
