use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::events::DomainEvent;
use crate::shared::models::schema::workflow_rules;
use crate::shared::models::{Priority, TriggerKind, WorkflowRule};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use cron::Schedule;
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

pub const ACTION_KINDS: [&str; 3] = ["notify", "set_priority", "auto_route"];

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/workflows", get(list_rules))
        .route("/api/workflows", post(create_rule))
        .route("/api/workflows/:id", put(update_rule))
        .route("/api/workflows/:id", delete(delete_rule))
}

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub name: String,
    pub trigger_kind: i32,
    pub schedule: Option<String>,
    pub action_kind: String,
    pub action_params: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

fn validate_rule(req: &RuleRequest) -> Result<TriggerKind, ServiceError> {
    let kind = TriggerKind::from_i32(req.trigger_kind)
        .ok_or_else(|| ServiceError::Validation(format!("unknown trigger kind: {}", req.trigger_kind)))?;
    if !ACTION_KINDS.contains(&req.action_kind.as_str()) {
        return Err(ServiceError::Validation(format!(
            "unknown action kind: {}; supported: {}",
            req.action_kind,
            ACTION_KINDS.join(", ")
        )));
    }
    match kind {
        TriggerKind::Scheduled => {
            let schedule = req
                .schedule
                .as_deref()
                .ok_or_else(|| ServiceError::Validation("scheduled rules need a cron schedule".into()))?;
            Schedule::from_str(schedule).map_err(|e| {
                ServiceError::Validation(format!("invalid cron expression: {}", e))
            })?;
        }
        _ => {
            if req.schedule.is_some() {
                return Err(ServiceError::Validation(
                    "event rules must not carry a schedule".into(),
                ));
            }
        }
    }
    if req.action_kind == "set_priority" {
        let priority = req
            .action_params
            .as_ref()
            .and_then(|p| p["priority"].as_i64());
        match priority {
            Some(p) if Priority::from_i32(p as i32).is_some() => {}
            _ => {
                return Err(ServiceError::Validation(
                    "set_priority needs action_params.priority in 0..=3".into(),
                ))
            }
        }
    }
    Ok(kind)
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<WorkflowRule>>, ServiceError> {
    let conn = state.conn.clone();
    let rules = run_blocking(move || {
        let mut db = conn.get()?;
        let rules = workflow_rules::table
            .filter(workflow_rules::tenant_id.eq(ctx.tenant_id))
            .order(workflow_rules::created_at.asc())
            .load::<WorkflowRule>(&mut db)?;
        Ok(rules)
    })
    .await?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<RuleRequest>,
) -> Result<(StatusCode, Json<WorkflowRule>), ServiceError> {
    ctx.require_tenant_admin()?;
    validate_rule(&req)?;

    let conn = state.conn.clone();
    let rule = run_blocking(move || {
        let mut db = conn.get()?;
        let rule = WorkflowRule {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            name: req.name,
            trigger_kind: req.trigger_kind,
            schedule: req.schedule,
            action_kind: req.action_kind,
            action_params: req.action_params.unwrap_or(serde_json::json!({})),
            is_active: req.is_active.unwrap_or(true),
            last_triggered: None,
            created_at: Utc::now(),
        };
        diesel::insert_into(workflow_rules::table)
            .values(&rule)
            .execute(&mut db)?;
        Ok(rule)
    })
    .await?;

    info!("workflow rule {} created", rule.id);
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<RuleRequest>,
) -> Result<Json<WorkflowRule>, ServiceError> {
    ctx.require_tenant_admin()?;
    validate_rule(&req)?;

    let conn = state.conn.clone();
    let rule = run_blocking(move || {
        let mut db = conn.get()?;
        let updated = diesel::update(
            workflow_rules::table
                .filter(workflow_rules::id.eq(id))
                .filter(workflow_rules::tenant_id.eq(ctx.tenant_id)),
        )
        .set((
            workflow_rules::name.eq(req.name),
            workflow_rules::trigger_kind.eq(req.trigger_kind),
            workflow_rules::schedule.eq(req.schedule),
            workflow_rules::action_kind.eq(req.action_kind),
            workflow_rules::action_params.eq(req.action_params.unwrap_or(serde_json::json!({}))),
            workflow_rules::is_active.eq(req.is_active.unwrap_or(true)),
        ))
        .execute(&mut db)?;
        if updated == 0 {
            return Err(ServiceError::NotFound);
        }
        let rule: WorkflowRule = workflow_rules::table
            .filter(workflow_rules::id.eq(id))
            .first(&mut db)?;
        Ok(rule)
    })
    .await?;

    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    ctx.require_tenant_admin()?;
    let conn = state.conn.clone();
    run_blocking(move || {
        let mut db = conn.get()?;
        let deleted = diesel::delete(
            workflow_rules::table
                .filter(workflow_rules::id.eq(id))
                .filter(workflow_rules::tenant_id.eq(ctx.tenant_id)),
        )
        .execute(&mut db)?;
        if deleted == 0 {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    })
    .await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Runs one event-triggered pass: every active rule of the tenant matching
/// the trigger kind executes exactly once for this event.
pub async fn fire_event_triggers(
    state: Arc<AppState>,
    tenant_id: Uuid,
    kind: TriggerKind,
    conversation_id: Option<Uuid>,
) {
    let conn = state.conn.clone();
    let rules = run_blocking(move || {
        let mut db = conn.get()?;
        let rules: Vec<WorkflowRule> = workflow_rules::table
            .filter(workflow_rules::tenant_id.eq(tenant_id))
            .filter(workflow_rules::is_active.eq(true))
            .filter(workflow_rules::trigger_kind.eq(kind as i32))
            .load(&mut db)?;
        Ok(rules)
    })
    .await;

    let rules = match rules {
        Ok(rules) => rules,
        Err(e) => {
            error!("loading workflow rules failed: {}", e);
            return;
        }
    };

    for rule in rules {
        if let Err(e) = execute_action(&state, &rule, conversation_id).await {
            warn!("workflow rule {} failed: {}", rule.id, e);
        }
        stamp_triggered(&state, rule.id).await;
    }
}

async fn stamp_triggered(state: &Arc<AppState>, rule_id: Uuid) {
    let conn = state.conn.clone();
    let _ = run_blocking(move || {
        let mut db = conn.get()?;
        diesel::update(workflow_rules::table.filter(workflow_rules::id.eq(rule_id)))
            .set(workflow_rules::last_triggered.eq(Some(Utc::now())))
            .execute(&mut db)
            .map_err(ServiceError::from)
    })
    .await;
}

async fn execute_action(
    state: &Arc<AppState>,
    rule: &WorkflowRule,
    conversation_id: Option<Uuid>,
) -> Result<(), ServiceError> {
    info!("executing workflow rule {} ({})", rule.name, rule.action_kind);

    match rule.action_kind.as_str() {
        "notify" => {
            let user_id = rule.action_params["user_id"]
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| {
                    ServiceError::Validation("notify action needs action_params.user_id".into())
                })?;
            let title = rule.action_params["title"]
                .as_str()
                .unwrap_or("Workflow alert")
                .to_string();
            let body = rule.action_params["body"]
                .as_str()
                .unwrap_or(&rule.name)
                .to_string();
            state.emit(DomainEvent::SystemAlert {
                tenant_id: rule.tenant_id,
                user_id,
                title,
                body,
                occurred_at: Utc::now(),
            });
            Ok(())
        }
        "set_priority" => {
            use crate::shared::models::schema::conversations;
            let conversation_id = conversation_id.ok_or_else(|| {
                ServiceError::Validation("set_priority only applies to conversation triggers".into())
            })?;
            let priority = rule.action_params["priority"].as_i64().unwrap_or(1) as i32;
            let conn = state.conn.clone();
            let tenant_id = rule.tenant_id;
            run_blocking(move || {
                let mut db = conn.get()?;
                diesel::update(
                    conversations::table
                        .filter(conversations::id.eq(conversation_id))
                        .filter(conversations::tenant_id.eq(tenant_id)),
                )
                .set((
                    conversations::priority.eq(priority),
                    conversations::updated_at.eq(Utc::now()),
                ))
                .execute(&mut db)?;
                Ok(())
            })
            .await
        }
        "auto_route" => {
            let conversation_id = conversation_id.ok_or_else(|| {
                ServiceError::Validation("auto_route only applies to conversation triggers".into())
            })?;
            let conn = state.conn.clone();
            let tenant_id = rule.tenant_id;
            let outcome = run_blocking(move || {
                let mut db = conn.get()?;
                crate::attendance::queue::route_conversation(&mut db, tenant_id, conversation_id)
            })
            .await;
            match outcome {
                Ok(outcome) if outcome.agent_id.is_some() => {
                    let conn = state.conn.clone();
                    if let Ok(conversation) = run_blocking(move || {
                        let mut db = conn.get()?;
                        crate::chat::load_conversation(&mut db, tenant_id, conversation_id)
                    })
                    .await
                    {
                        crate::attendance::queue::publish_assignment(state, &conversation).await;
                    }
                    Ok(())
                }
                Ok(_) => Ok(()),
                // Already assigned is a no-op for routing rules.
                Err(ServiceError::Conflict(_)) => Ok(()),
                Err(e) => Err(e),
            }
        }
        other => Err(ServiceError::Validation(format!(
            "unknown action kind: {}",
            other
        ))),
    }
}

pub struct WorkflowService {
    state: Arc<AppState>,
}

impl WorkflowService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Scheduler loop: fires scheduled rules whose next cron occurrence is
    /// within the next tick, guarded by last_triggered so a rule fires at
    /// most once per minute.
    pub async fn spawn(self) {
        info!("workflow scheduler started");
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if let Err(e) = self.check_scheduled_rules().await {
                error!("scheduled workflow sweep failed: {}", e);
            }
        }
    }

    async fn check_scheduled_rules(&self) -> Result<(), ServiceError> {
        let conn = self.state.conn.clone();
        let rules = run_blocking(move || {
            let mut db = conn.get()?;
            let rules: Vec<WorkflowRule> = workflow_rules::table
                .filter(workflow_rules::is_active.eq(true))
                .filter(workflow_rules::trigger_kind.eq(TriggerKind::Scheduled as i32))
                .load(&mut db)?;
            Ok(rules)
        })
        .await?;

        for rule in rules {
            let Some(schedule_str) = &rule.schedule else {
                continue;
            };
            let Ok(parsed) = Schedule::from_str(schedule_str) else {
                warn!("rule {} has an unparsable schedule", rule.id);
                continue;
            };

            let now = Utc::now();
            if let Some(next_time) = parsed.upcoming(Utc).next() {
                if (next_time - now).num_minutes() < 1 {
                    if let Some(last) = rule.last_triggered {
                        if (now - last).num_minutes() < 1 {
                            continue;
                        }
                    }
                    if let Err(e) = execute_action(&self.state, &rule, None).await {
                        warn!("scheduled rule {} failed: {}", rule.id, e);
                    }
                    stamp_triggered(&self.state, rule.id).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_request(trigger: i32, action: &str) -> RuleRequest {
        RuleRequest {
            name: "r".into(),
            trigger_kind: trigger,
            schedule: None,
            action_kind: action.into(),
            action_params: None,
            is_active: None,
        }
    }

    #[test]
    fn scheduled_rules_require_valid_cron() {
        let mut req = rule_request(TriggerKind::Scheduled as i32, "notify");
        assert!(validate_rule(&req).is_err());

        req.schedule = Some("not a cron".into());
        assert!(validate_rule(&req).is_err());

        req.schedule = Some("0 0 9 * * Mon-Fri *".into());
        assert!(validate_rule(&req).is_ok());
    }

    #[test]
    fn event_rules_reject_schedules() {
        let mut req = rule_request(TriggerKind::ConversationCreated as i32, "auto_route");
        assert!(validate_rule(&req).is_ok());
        req.schedule = Some("0 * * * * * *".into());
        assert!(validate_rule(&req).is_err());
    }

    #[test]
    fn set_priority_needs_valid_priority() {
        let mut req = rule_request(TriggerKind::ConversationCreated as i32, "set_priority");
        assert!(validate_rule(&req).is_err());
        req.action_params = Some(serde_json::json!({ "priority": 9 }));
        assert!(validate_rule(&req).is_err());
        req.action_params = Some(serde_json::json!({ "priority": 2 }));
        assert!(validate_rule(&req).is_ok());
    }

    #[test]
    fn unknown_action_is_rejected() {
        let req = rule_request(TriggerKind::ConversationCreated as i32, "explode");
        assert!(validate_rule(&req).is_err());
    }
}
