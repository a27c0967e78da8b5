use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::models::schema::{tenants, user_tenants, users};
use crate::shared::models::{Role, Tenant, TenantStatus};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub branding: Option<serde_json::Value>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub email: String,
    pub role: String,
}

pub async fn get_current(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Tenant>, ServiceError> {
    let conn = state.conn.clone();
    let tenant = run_blocking(move || {
        let mut db = conn.get()?;
        let tenant: Tenant = tenants::table
            .filter(tenants::id.eq(ctx.tenant_id))
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::NotFound)?;
        Ok(tenant)
    })
    .await?;
    Ok(Json(tenant))
}

pub async fn update_current(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<UpdateTenantRequest>,
) -> Result<Json<Tenant>, ServiceError> {
    ctx.require_tenant_admin()?;

    if let Some(status) = &req.status {
        if TenantStatus::parse(status).is_none() {
            return Err(ServiceError::Validation(format!(
                "unknown tenant status: {}",
                status
            )));
        }
    }

    let conn = state.conn.clone();
    let tenant = run_blocking(move || {
        let mut db = conn.get()?;

        db.transaction::<Tenant, ServiceError, _>(|db| {
            let mut tenant: Tenant = tenants::table
                .filter(tenants::id.eq(ctx.tenant_id))
                .first(db)
                .optional()?
                .ok_or(ServiceError::NotFound)?;

            if let Some(name) = req.name {
                tenant.name = name;
            }
            if let Some(branding) = req.branding {
                tenant.branding = branding;
            }
            if let Some(status) = req.status {
                tenant.status = status;
            }
            tenant.updated_at = Utc::now();

            diesel::update(tenants::table.filter(tenants::id.eq(ctx.tenant_id)))
                .set((
                    tenants::name.eq(&tenant.name),
                    tenants::branding.eq(&tenant.branding),
                    tenants::status.eq(&tenant.status),
                    tenants::updated_at.eq(tenant.updated_at),
                ))
                .execute(db)?;

            Ok(tenant)
        })
    })
    .await?;

    info!("tenant {} updated", tenant.id);
    Ok(Json(tenant))
}

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<MemberInfo>>, ServiceError> {
    let conn = state.conn.clone();
    let members = run_blocking(move || {
        let mut db = conn.get()?;
        let rows: Vec<(Uuid, String, String, String)> = user_tenants::table
            .inner_join(users::table)
            .filter(user_tenants::tenant_id.eq(ctx.tenant_id))
            .select((
                users::id,
                users::email,
                users::display_name,
                user_tenants::role,
            ))
            .load(&mut db)?;
        Ok(rows
            .into_iter()
            .map(|(user_id, email, display_name, role)| MemberInfo {
                user_id,
                email,
                display_name,
                role,
            })
            .collect())
    })
    .await?;
    Ok(Json(members))
}

pub async fn add_member(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<MemberInfo>, ServiceError> {
    ctx.require_tenant_admin()?;

    let role = Role::parse(&req.role)
        .ok_or_else(|| ServiceError::Validation(format!("unknown role: {}", req.role)))?;

    let conn = state.conn.clone();
    let member = run_blocking(move || {
        let mut db = conn.get()?;

        let (user_id, email, display_name): (Uuid, String, String) = users::table
            .filter(users::email.eq(req.email.to_lowercase()))
            .select((users::id, users::email, users::display_name))
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::NotFound)?;

        let already: i64 = user_tenants::table
            .filter(user_tenants::user_id.eq(user_id))
            .filter(user_tenants::tenant_id.eq(ctx.tenant_id))
            .count()
            .get_result(&mut db)?;
        if already > 0 {
            return Err(ServiceError::Conflict("user is already a member".into()));
        }

        diesel::insert_into(user_tenants::table)
            .values((
                user_tenants::id.eq(Uuid::new_v4()),
                user_tenants::user_id.eq(user_id),
                user_tenants::tenant_id.eq(ctx.tenant_id),
                user_tenants::role.eq(role.as_str()),
                user_tenants::created_at.eq(Utc::now()),
            ))
            .execute(&mut db)?;

        Ok(MemberInfo {
            user_id,
            email,
            display_name,
            role: role.as_str().to_string(),
        })
    })
    .await?;

    Ok(Json(member))
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    ctx.require_tenant_admin()?;

    if user_id == ctx.user_id {
        return Err(ServiceError::Validation(
            "cannot remove your own membership".into(),
        ));
    }

    let conn = state.conn.clone();
    run_blocking(move || {
        let mut db = conn.get()?;
        let deleted = diesel::delete(
            user_tenants::table
                .filter(user_tenants::user_id.eq(user_id))
                .filter(user_tenants::tenant_id.eq(ctx.tenant_id)),
        )
        .execute(&mut db)?;
        if deleted == 0 {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    })
    .await?;

    Ok(Json(serde_json::json!({ "removed": user_id })))
}
