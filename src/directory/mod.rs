pub mod tenants;
pub mod users;

use crate::shared::state::AppState;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tenants/current", get(tenants::get_current))
        .route("/api/tenants/current", put(tenants::update_current))
        .route("/api/tenants/current/members", get(tenants::list_members))
        .route("/api/tenants/current/members", post(tenants::add_member))
        .route(
            "/api/tenants/current/members/:user_id",
            delete(tenants::remove_member),
        )
        .route("/api/users", get(users::list_users))
        .route("/api/users/:id", get(users::get_user))
        .route("/api/users/:id", put(users::update_user))
}
