pub mod stripe_integration;
pub mod usage;

use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::models::schema::{plans, subscriptions, tenants, usage_records, users};
use crate::shared::models::{Plan, Subscription, UsageRecord};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use diesel::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use self::stripe_integration::{verify_signature, StripeClient, SIGNATURE_TOLERANCE_SECS};
use uuid::Uuid;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/billing/plans", get(list_plans))
        .route("/api/billing/plans", post(create_plan))
        .route("/api/billing/subscription", get(get_subscription))
        .route("/api/billing/checkout", post(create_checkout))
        .route("/api/billing/cancel", post(cancel_subscription))
        .route("/api/billing/usage", get(get_usage))
        .route("/webhooks/stripe", post(stripe_webhook))
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    pub price_cents: i32,
    pub max_agents: i32,
    pub max_conversations_month: i32,
    pub max_documents: i32,
    pub stripe_price_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub subscription: Option<Subscription>,
    pub plan: Option<Plan>,
}

async fn list_plans(
    State(state): State<Arc<AppState>>,
    _ctx: TenantContext,
) -> Result<Json<Vec<Plan>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        let list = plans::table.order(plans::price_cents.asc()).load::<Plan>(&mut db)?;
        Ok(list)
    })
    .await?;
    Ok(Json(list))
}

async fn create_plan(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<Plan>), ServiceError> {
    ctx.require_tenant_admin()?;
    if req.price_cents < 0 || req.max_agents < 1 || req.max_conversations_month < 1 {
        return Err(ServiceError::Validation("plan limits must be positive".into()));
    }

    let conn = state.conn.clone();
    let plan = run_blocking(move || {
        let mut db = conn.get()?;
        let plan = Plan {
            id: Uuid::new_v4(),
            name: req.name,
            price_cents: req.price_cents,
            max_agents: req.max_agents,
            max_conversations_month: req.max_conversations_month,
            max_documents: req.max_documents,
            stripe_price_id: req.stripe_price_id,
        };
        diesel::insert_into(plans::table).values(&plan).execute(&mut db)?;
        Ok(plan)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(plan)))
}

async fn get_subscription(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<SubscriptionView>, ServiceError> {
    let conn = state.conn.clone();
    let view = run_blocking(move || {
        let mut db = conn.get()?;
        let subscription: Option<Subscription> = subscriptions::table
            .filter(subscriptions::tenant_id.eq(ctx.tenant_id))
            .order(subscriptions::created_at.desc())
            .first(&mut db)
            .optional()?;
        let plan = match &subscription {
            Some(sub) => plans::table
                .filter(plans::id.eq(sub.plan_id))
                .first::<Plan>(&mut db)
                .optional()?,
            None => None,
        };
        Ok(SubscriptionView { subscription, plan })
    })
    .await?;
    Ok(Json(view))
}

async fn create_checkout(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ServiceError> {
    ctx.require_tenant_admin()?;

    let stripe = StripeClient::new(&state.config.stripe);
    if !stripe.is_configured() {
        return Err(ServiceError::Upstream("stripe is not configured".into()));
    }

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let plan_id = req.plan_id;
    let user_id = ctx.user_id;
    let (price_id, tenant_name, admin_email) = run_blocking(move || {
        let mut db = conn.get()?;
        let plan: Plan = plans::table
            .filter(plans::id.eq(plan_id))
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::NotFound)?;
        let price_id = plan.stripe_price_id.ok_or_else(|| {
            ServiceError::Validation("plan has no stripe price configured".into())
        })?;
        let tenant_name: String = tenants::table
            .filter(tenants::id.eq(tenant_id))
            .select(tenants::name)
            .first(&mut db)?;
        let admin_email: String = users::table
            .filter(users::id.eq(user_id))
            .select(users::email)
            .first(&mut db)?;
        Ok((price_id, tenant_name, admin_email))
    })
    .await?;

    let customer = stripe
        .create_customer(&admin_email, &tenant_name, tenant_id)
        .await?;
    let session = stripe
        .create_checkout_session(
            &customer.id,
            &price_id,
            tenant_id,
            req.plan_id,
            &req.success_url,
            &req.cancel_url,
        )
        .await?;

    let checkout_url = session
        .url
        .ok_or_else(|| ServiceError::Upstream("stripe returned no checkout url".into()))?;
    info!("checkout session {} created for tenant {}", session.id, tenant_id);
    Ok(Json(CheckoutResponse { checkout_url }))
}

async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Subscription>, ServiceError> {
    ctx.require_tenant_admin()?;

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let subscription = run_blocking(move || {
        let mut db = conn.get()?;
        let subscription: Subscription = subscriptions::table
            .filter(subscriptions::tenant_id.eq(tenant_id))
            .filter(subscriptions::status.eq_any(["active", "trialing"]))
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::NotFound)?;
        Ok(subscription)
    })
    .await?;

    if let Some(stripe_id) = &subscription.stripe_subscription_id {
        let stripe = StripeClient::new(&state.config.stripe);
        if stripe.is_configured() {
            stripe.cancel_at_period_end(stripe_id).await?;
        }
    }

    let conn = state.conn.clone();
    let id = subscription.id;
    let updated = run_blocking(move || {
        let mut db = conn.get()?;
        diesel::update(subscriptions::table.filter(subscriptions::id.eq(id)))
            .set((
                subscriptions::cancel_at_period_end.eq(true),
                subscriptions::updated_at.eq(Utc::now()),
            ))
            .execute(&mut db)?;
        let updated: Subscription = subscriptions::table
            .filter(subscriptions::id.eq(id))
            .first(&mut db)?;
        Ok(updated)
    })
    .await?;

    Ok(Json(updated))
}

async fn get_usage(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<UsageRecord>>, ServiceError> {
    let conn = state.conn.clone();
    let rows = run_blocking(move || {
        let mut db = conn.get()?;
        let period = usage::period_start(Utc::now());
        let rows = usage_records::table
            .filter(usage_records::tenant_id.eq(ctx.tenant_id))
            .filter(usage_records::period_start.eq(period))
            .load::<UsageRecord>(&mut db)?;
        Ok(rows)
    })
    .await?;
    Ok(Json(rows))
}

// ===== webhook =====

async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Validation("missing Stripe-Signature header".into()))?;

    verify_signature(
        &body,
        signature,
        &state.config.stripe.webhook_secret,
        Utc::now().timestamp(),
        SIGNATURE_TOLERANCE_SECS,
    )?;

    let event: serde_json::Value = serde_json::from_slice(&body)?;
    let event_type = event["type"].as_str().unwrap_or_default().to_string();
    let object = event["data"]["object"].clone();

    info!("stripe webhook: {}", event_type);

    let conn = state.conn.clone();
    run_blocking(move || {
        let mut db = conn.get()?;
        match event_type.as_str() {
            "checkout.session.completed" => handle_checkout_completed(&mut db, &object),
            "customer.subscription.updated" => handle_subscription_updated(&mut db, &object),
            "customer.subscription.deleted" => handle_subscription_deleted(&mut db, &object),
            "invoice.paid" => handle_invoice_paid(&mut db, &object),
            other => {
                // Unknown event types are acknowledged so Stripe stops
                // retrying them.
                warn!("ignoring stripe event type {}", other);
                Ok(())
            }
        }
    })
    .await?;

    Ok(Json(serde_json::json!({ "received": true })))
}

fn metadata_uuid(object: &serde_json::Value, key: &str) -> Option<Uuid> {
    object["metadata"][key]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn unix_ts(value: &serde_json::Value) -> DateTime<Utc> {
    value
        .as_i64()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

fn handle_checkout_completed(
    db: &mut PgConnection,
    object: &serde_json::Value,
) -> Result<(), ServiceError> {
    let tenant_id = metadata_uuid(object, "tenant_id")
        .ok_or_else(|| ServiceError::Validation("checkout session missing tenant metadata".into()))?;
    let plan_id = metadata_uuid(object, "plan_id")
        .ok_or_else(|| ServiceError::Validation("checkout session missing plan metadata".into()))?;
    let stripe_subscription_id = object["subscription"].as_str().map(|s| s.to_string());

    let now = Utc::now();
    let existing: Option<Uuid> = subscriptions::table
        .filter(subscriptions::tenant_id.eq(tenant_id))
        .select(subscriptions::id)
        .first(db)
        .optional()?;

    match existing {
        Some(id) => {
            diesel::update(subscriptions::table.filter(subscriptions::id.eq(id)))
                .set((
                    subscriptions::plan_id.eq(plan_id),
                    subscriptions::stripe_subscription_id.eq(&stripe_subscription_id),
                    subscriptions::status.eq("active"),
                    subscriptions::cancel_at_period_end.eq(false),
                    subscriptions::updated_at.eq(now),
                ))
                .execute(db)?;
        }
        None => {
            let row = Subscription {
                id: Uuid::new_v4(),
                tenant_id,
                plan_id,
                stripe_subscription_id,
                status: "active".into(),
                current_period_start: now,
                current_period_end: now + chrono::Duration::days(30),
                cancel_at_period_end: false,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(subscriptions::table)
                .values(&row)
                .execute(db)?;
        }
    }
    Ok(())
}

fn handle_subscription_updated(
    db: &mut PgConnection,
    object: &serde_json::Value,
) -> Result<(), ServiceError> {
    let stripe_id = object["id"]
        .as_str()
        .ok_or_else(|| ServiceError::Validation("subscription event missing id".into()))?;
    let status = object["status"].as_str().unwrap_or("active").to_string();

    diesel::update(
        subscriptions::table.filter(subscriptions::stripe_subscription_id.eq(stripe_id)),
    )
    .set((
        subscriptions::status.eq(status),
        subscriptions::current_period_start.eq(unix_ts(&object["current_period_start"])),
        subscriptions::current_period_end.eq(unix_ts(&object["current_period_end"])),
        subscriptions::cancel_at_period_end
            .eq(object["cancel_at_period_end"].as_bool().unwrap_or(false)),
        subscriptions::updated_at.eq(Utc::now()),
    ))
    .execute(db)?;
    Ok(())
}

fn handle_subscription_deleted(
    db: &mut PgConnection,
    object: &serde_json::Value,
) -> Result<(), ServiceError> {
    let stripe_id = object["id"]
        .as_str()
        .ok_or_else(|| ServiceError::Validation("subscription event missing id".into()))?;
    diesel::update(
        subscriptions::table.filter(subscriptions::stripe_subscription_id.eq(stripe_id)),
    )
    .set((
        subscriptions::status.eq("canceled"),
        subscriptions::updated_at.eq(Utc::now()),
    ))
    .execute(db)?;
    Ok(())
}

fn handle_invoice_paid(
    db: &mut PgConnection,
    object: &serde_json::Value,
) -> Result<(), ServiceError> {
    let Some(stripe_id) = object["subscription"].as_str() else {
        return Ok(());
    };
    diesel::update(
        subscriptions::table.filter(subscriptions::stripe_subscription_id.eq(stripe_id)),
    )
    .set((
        subscriptions::status.eq("active"),
        subscriptions::updated_at.eq(Utc::now()),
    ))
    .execute(db)?;
    Ok(())
}
