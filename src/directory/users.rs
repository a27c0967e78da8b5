use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::models::schema::{user_tenants, users};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub is_active: bool,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub is_active: Option<bool>,
}

/// Users are listed through the membership table so one tenant never sees
/// another tenant's users.
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<UserProfile>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        let rows: Vec<(Uuid, String, String, bool, DateTime<Utc>, String)> = users::table
            .inner_join(user_tenants::table)
            .filter(user_tenants::tenant_id.eq(ctx.tenant_id))
            .select((
                users::id,
                users::email,
                users::display_name,
                users::is_active,
                users::created_at,
                user_tenants::role,
            ))
            .order(users::created_at.asc())
            .load(&mut db)?;
        Ok(rows
            .into_iter()
            .map(|(id, email, display_name, is_active, created_at, role)| UserProfile {
                id,
                email,
                display_name,
                is_active,
                role,
                created_at,
            })
            .collect())
    })
    .await?;
    Ok(Json(list))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<UserProfile>, ServiceError> {
    let conn = state.conn.clone();
    let profile = run_blocking(move || {
        let mut db = conn.get()?;
        load_profile(&mut db, ctx.tenant_id, id)
    })
    .await?;
    Ok(Json(profile))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserProfile>, ServiceError> {
    if id != ctx.user_id {
        ctx.require_tenant_admin()?;
    }

    let conn = state.conn.clone();
    let profile = run_blocking(move || {
        let mut db = conn.get()?;

        // Membership check before any write: cross-tenant ids read as absent.
        let member: i64 = user_tenants::table
            .filter(user_tenants::user_id.eq(id))
            .filter(user_tenants::tenant_id.eq(ctx.tenant_id))
            .count()
            .get_result(&mut db)?;
        if member == 0 {
            return Err(ServiceError::NotFound);
        }

        if let Some(display_name) = &req.display_name {
            if display_name.trim().is_empty() {
                return Err(ServiceError::Validation("display name cannot be empty".into()));
            }
            diesel::update(users::table.filter(users::id.eq(id)))
                .set((
                    users::display_name.eq(display_name),
                    users::updated_at.eq(Utc::now()),
                ))
                .execute(&mut db)?;
        }
        if let Some(is_active) = req.is_active {
            diesel::update(users::table.filter(users::id.eq(id)))
                .set((
                    users::is_active.eq(is_active),
                    users::updated_at.eq(Utc::now()),
                ))
                .execute(&mut db)?;
        }

        load_profile(&mut db, ctx.tenant_id, id)
    })
    .await?;

    Ok(Json(profile))
}

fn load_profile(
    db: &mut PgConnection,
    tenant_id: Uuid,
    user_id: Uuid,
) -> Result<UserProfile, ServiceError> {
    let row: Option<(Uuid, String, String, bool, DateTime<Utc>, String)> = users::table
        .inner_join(user_tenants::table)
        .filter(users::id.eq(user_id))
        .filter(user_tenants::tenant_id.eq(tenant_id))
        .select((
            users::id,
            users::email,
            users::display_name,
            users::is_active,
            users::created_at,
            user_tenants::role,
        ))
        .first(db)
        .optional()?;

    let (id, email, display_name, is_active, created_at, role) =
        row.ok_or(ServiceError::NotFound)?;
    Ok(UserProfile {
        id,
        email,
        display_name,
        is_active,
        role,
        created_at,
    })
}
