//! Combines every module router into the application surface, plus the
//! health endpoint the deployment probes hit.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(crate::auth::configure())
        .merge(crate::directory::configure())
        .merge(crate::chat::configure())
        .merge(crate::attendance::configure())
        .merge(crate::llm::orchestrator::configure())
        .merge(crate::kb::configure())
        .merge(crate::notifications::configure())
        .merge(crate::analytics::configure())
        .merge(crate::billing::configure())
        .merge(crate::workflows::configure())
        .route("/health", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let conn = state.conn.clone();
    let database = tokio::task::spawn_blocking(move || conn.get().is_ok())
        .await
        .unwrap_or(false);

    let cache = match &state.cache {
        Some(client) => client.get_multiplexed_async_connection().await.is_ok(),
        None => false,
    };

    Json(serde_json::json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "cache": cache,
        "llm_provider": state.llm_provider.name(),
        "hub_groups": state.hub.group_count().await,
    }))
}
