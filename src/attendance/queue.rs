use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::events::DomainEvent;
use crate::shared::hub::{agent_group, queue_group};
use crate::shared::models::schema::{agent_status, conversations};
use crate::shared::models::{AgentStatus, Availability, Conversation, ConversationStatus};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub conversation_id: Uuid,
    pub customer_name: String,
    pub channel: String,
    pub priority: i32,
    pub department: Option<String>,
    pub queued_at: String,
    pub waiting_seconds: i64,
    pub position: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignRequest {
    pub conversation_id: Uuid,
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalateRequest {
    pub conversation_id: Uuid,
    pub to_agent_id: Option<Uuid>,
    pub department: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub conversation_id: Uuid,
    pub outcome: &'static str,
    pub agent_id: Option<Uuid>,
}

/// Statuses a conversation can be assigned from.
const ASSIGNABLE: [&str; 3] = ["active", "waiting", "queued"];

pub fn is_eligible(agent: &AgentStatus, conversation: &Conversation) -> bool {
    if Availability::parse(&agent.availability) != Some(Availability::Online) {
        return false;
    }
    if agent.active_conversations >= agent.max_conversations {
        return false;
    }
    if let Some(dept) = &conversation.department {
        match &agent.department {
            Some(d) if d.eq_ignore_ascii_case(dept) => {}
            _ => return false,
        }
    }
    if let Some(lang) = &conversation.language {
        match &agent.language {
            Some(l) if l.eq_ignore_ascii_case(lang) => {}
            _ => return false,
        }
    }
    true
}

/// Tie-break among eligible agents: lowest current load, then idle-longest.
/// This is the intended policy, not a contractual ordering; it lives in one
/// place so product can swap it.
pub fn pick_agent<'a>(
    agents: &'a [AgentStatus],
    conversation: &Conversation,
) -> Option<&'a AgentStatus> {
    agents
        .iter()
        .filter(|a| is_eligible(a, conversation))
        .min_by(|a, b| {
            a.active_conversations
                .cmp(&b.active_conversations)
                .then(a.last_activity.cmp(&b.last_activity))
        })
}

/// Queue ordering: priority descending, then queued_at ascending. Entries
/// without a queued_at stamp sort last.
pub fn queue_order(a: &Conversation, b: &Conversation) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| match (a.queued_at, b.queued_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}

/// Conditionally takes one workload slot. Zero affected rows means the agent
/// is at capacity (or gone); the caller decides which.
fn take_agent_slot(
    db: &mut PgConnection,
    tenant_id: Uuid,
    agent_id: Uuid,
) -> Result<bool, ServiceError> {
    let claimed = diesel::update(
        agent_status::table
            .filter(agent_status::user_id.eq(agent_id))
            .filter(agent_status::tenant_id.eq(tenant_id))
            .filter(agent_status::active_conversations.lt(agent_status::max_conversations)),
    )
    .set((
        agent_status::active_conversations.eq(agent_status::active_conversations + 1),
        agent_status::last_activity.eq(Utc::now()),
    ))
    .execute(db)?;
    Ok(claimed == 1)
}

/// Returns a workload slot, clamped at zero.
pub fn release_agent_slot(
    db: &mut PgConnection,
    tenant_id: Uuid,
    agent_id: Uuid,
) -> Result<(), ServiceError> {
    diesel::update(
        agent_status::table
            .filter(agent_status::user_id.eq(agent_id))
            .filter(agent_status::tenant_id.eq(tenant_id))
            .filter(agent_status::active_conversations.gt(0)),
    )
    .set(agent_status::active_conversations.eq(agent_status::active_conversations - 1))
    .execute(db)?;
    Ok(())
}

/// Assigns a conversation to an agent. Both guards are conditional updates
/// inside one transaction: losing either one aborts and rolls the other
/// back, so two racing requests can never both succeed and a full agent is
/// never over-committed.
pub fn assign_conversation(
    db: &mut PgConnection,
    tenant_id: Uuid,
    conversation_id: Uuid,
    agent_id: Uuid,
) -> Result<Conversation, ServiceError> {
    db.transaction::<Conversation, ServiceError, _>(|db| {
        let agent_exists: i64 = agent_status::table
            .filter(agent_status::user_id.eq(agent_id))
            .filter(agent_status::tenant_id.eq(tenant_id))
            .count()
            .get_result(db)?;
        if agent_exists == 0 {
            return Err(ServiceError::NotFound);
        }

        if !take_agent_slot(db, tenant_id, agent_id)? {
            return Err(ServiceError::Conflict("agent is at capacity".into()));
        }

        let now = Utc::now();
        let claimed = diesel::update(
            conversations::table
                .filter(conversations::id.eq(conversation_id))
                .filter(conversations::tenant_id.eq(tenant_id))
                .filter(conversations::assigned_agent_id.is_null())
                .filter(conversations::status.eq_any(ASSIGNABLE)),
        )
        .set((
            conversations::assigned_agent_id.eq(Some(agent_id)),
            conversations::status.eq(ConversationStatus::Assigned.as_str()),
            conversations::assigned_at.eq(Some(now)),
            conversations::updated_at.eq(now),
        ))
        .execute(db)?;

        if claimed == 0 {
            let exists: i64 = conversations::table
                .filter(conversations::id.eq(conversation_id))
                .filter(conversations::tenant_id.eq(tenant_id))
                .count()
                .get_result(db)?;
            // Err return aborts the transaction, undoing the slot we took.
            return Err(if exists == 0 {
                ServiceError::NotFound
            } else {
                ServiceError::Conflict("conversation is already assigned".into())
            });
        }

        let conversation: Conversation = conversations::table
            .filter(conversations::id.eq(conversation_id))
            .first(db)?;
        Ok(conversation)
    })
}

/// Picks the best eligible agent for a conversation, or parks it in the
/// queue when nobody can take it. Queueing is a success, not an error.
pub fn route_conversation(
    db: &mut PgConnection,
    tenant_id: Uuid,
    conversation_id: Uuid,
) -> Result<RouteOutcome, ServiceError> {
    db.transaction::<RouteOutcome, ServiceError, _>(|db| {
        let conversation: Conversation = conversations::table
            .filter(conversations::id.eq(conversation_id))
            .filter(conversations::tenant_id.eq(tenant_id))
            .for_update()
            .first(db)
            .optional()?
            .ok_or(ServiceError::NotFound)?;

        if conversation.assigned_agent_id.is_some() {
            return Err(ServiceError::Conflict(
                "conversation is already assigned".into(),
            ));
        }
        let status = ConversationStatus::parse(&conversation.status)
            .ok_or_else(|| ServiceError::Internal("corrupt status".into()))?;
        if status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "conversation is {}",
                conversation.status
            )));
        }

        let agents: Vec<AgentStatus> = agent_status::table
            .filter(agent_status::tenant_id.eq(tenant_id))
            .filter(agent_status::availability.eq(Availability::Online.as_str()))
            .load(db)?;

        let now = Utc::now();
        let keep_queued_at = conversation.queued_at;
        match pick_agent(&agents, &conversation).map(|a| a.user_id) {
            Some(agent_id) => {
                if !take_agent_slot(db, tenant_id, agent_id)? {
                    // Another router grabbed the last slot between the load
                    // and the update; park the conversation instead.
                    park_in_queue(db, conversation_id, keep_queued_at, now)?;
                    return Ok(RouteOutcome {
                        conversation_id,
                        outcome: "queued",
                        agent_id: None,
                    });
                }
                diesel::update(conversations::table.filter(conversations::id.eq(conversation_id)))
                    .set((
                        conversations::assigned_agent_id.eq(Some(agent_id)),
                        conversations::status.eq(ConversationStatus::Assigned.as_str()),
                        conversations::assigned_at.eq(Some(now)),
                        conversations::updated_at.eq(now),
                    ))
                    .execute(db)?;
                Ok(RouteOutcome {
                    conversation_id,
                    outcome: "assigned",
                    agent_id: Some(agent_id),
                })
            }
            None => {
                park_in_queue(db, conversation_id, keep_queued_at, now)?;
                Ok(RouteOutcome {
                    conversation_id,
                    outcome: "queued",
                    agent_id: None,
                })
            }
        }
    })
}

fn park_in_queue(
    db: &mut PgConnection,
    conversation_id: Uuid,
    existing_queued_at: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> Result<(), ServiceError> {
    diesel::update(conversations::table.filter(conversations::id.eq(conversation_id)))
        .set((
            conversations::status.eq(ConversationStatus::Queued.as_str()),
            // Keep the original stamp if the conversation was already queued.
            conversations::queued_at.eq(Some(existing_queued_at.unwrap_or(now))),
            conversations::updated_at.eq(now),
        ))
        .execute(db)?;
    Ok(())
}

/// Moves a conversation away from its current agent: to a named agent, or
/// back into the queue (optionally retargeting a department).
pub fn escalate_conversation(
    db: &mut PgConnection,
    tenant_id: Uuid,
    req: &EscalateRequest,
) -> Result<(Conversation, Option<Uuid>, i64), ServiceError> {
    db.transaction::<(Conversation, Option<Uuid>, i64), ServiceError, _>(|db| {
        let conversation: Conversation = conversations::table
            .filter(conversations::id.eq(req.conversation_id))
            .filter(conversations::tenant_id.eq(tenant_id))
            .for_update()
            .first(db)
            .optional()?
            .ok_or(ServiceError::NotFound)?;

        let status = ConversationStatus::parse(&conversation.status)
            .ok_or_else(|| ServiceError::Internal("corrupt status".into()))?;
        if status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "conversation is {}",
                conversation.status
            )));
        }

        let now = Utc::now();
        let from_agent = conversation.assigned_agent_id;
        let held_since = conversation.assigned_at.unwrap_or(conversation.created_at);
        let seconds_before_escalation = (now - held_since).num_seconds();

        if let Some(to_agent) = req.to_agent_id {
            if Some(to_agent) == from_agent {
                return Err(ServiceError::Validation(
                    "conversation is already with that agent".into(),
                ));
            }
            let target_exists: i64 = agent_status::table
                .filter(agent_status::user_id.eq(to_agent))
                .filter(agent_status::tenant_id.eq(tenant_id))
                .count()
                .get_result(db)?;
            if target_exists == 0 {
                return Err(ServiceError::NotFound);
            }
            if !take_agent_slot(db, tenant_id, to_agent)? {
                return Err(ServiceError::Conflict("target agent is at capacity".into()));
            }
        }

        if let Some(old_agent) = from_agent {
            release_agent_slot(db, tenant_id, old_agent)?;
        }

        let (new_status, assigned_agent, assigned_at, queued_at) = match req.to_agent_id {
            Some(agent) => (
                ConversationStatus::Assigned.as_str(),
                Some(agent),
                Some(now),
                conversation.queued_at,
            ),
            None => (
                ConversationStatus::Queued.as_str(),
                None,
                None,
                Some(now),
            ),
        };

        diesel::update(conversations::table.filter(conversations::id.eq(req.conversation_id)))
            .set((
                conversations::assigned_agent_id.eq(assigned_agent),
                conversations::status.eq(new_status),
                conversations::assigned_at.eq(assigned_at),
                conversations::queued_at.eq(queued_at),
                conversations::department.eq(req
                    .department
                    .clone()
                    .or(conversation.department.clone())),
                conversations::escalation_reason.eq(Some(req.reason.clone())),
                conversations::updated_at.eq(now),
            ))
            .execute(db)?;

        let updated: Conversation = conversations::table
            .filter(conversations::id.eq(req.conversation_id))
            .first(db)?;
        Ok((updated, from_agent, seconds_before_escalation))
    })
}

/// Builds the live queue view: position by priority desc / queued_at asc,
/// wait time computed on read.
pub fn queue_snapshot(
    db: &mut PgConnection,
    tenant_id: Uuid,
) -> Result<Vec<QueueItem>, ServiceError> {
    let mut queued: Vec<Conversation> = conversations::table
        .filter(conversations::tenant_id.eq(tenant_id))
        .filter(conversations::status.eq(ConversationStatus::Queued.as_str()))
        .load(db)?;

    queued.sort_by(queue_order);

    let now = Utc::now();
    Ok(queued
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let queued_at = c.queued_at.unwrap_or(c.created_at);
            QueueItem {
                conversation_id: c.id,
                customer_name: c.customer_name,
                channel: c.channel,
                priority: c.priority,
                department: c.department,
                queued_at: queued_at.to_rfc3339(),
                waiting_seconds: (now - queued_at).num_seconds(),
                position: i + 1,
            }
        })
        .collect())
}

// ===== HTTP handlers =====

pub async fn list_queue(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<QueueItem>>, ServiceError> {
    ctx.require_agent()?;
    let conn = state.conn.clone();
    let items = run_blocking(move || {
        let mut db = conn.get()?;
        queue_snapshot(&mut db, ctx.tenant_id)
    })
    .await?;
    Ok(Json(items))
}

pub async fn assign(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<AssignRequest>,
) -> Result<Json<Conversation>, ServiceError> {
    ctx.require_agent()?;
    info!(
        "assigning conversation {} to agent {}",
        req.conversation_id, req.agent_id
    );

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let conversation = run_blocking(move || {
        let mut db = conn.get()?;
        assign_conversation(&mut db, tenant_id, req.conversation_id, req.agent_id)
    })
    .await?;

    publish_assignment(&state, &conversation).await;
    Ok(Json(conversation))
}

pub async fn route(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<RouteOutcome>, ServiceError> {
    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let outcome = run_blocking(move || {
        let mut db = conn.get()?;
        route_conversation(&mut db, tenant_id, conversation_id)
    })
    .await?;

    if outcome.agent_id.is_some() {
        let conn = state.conn.clone();
        let conversation = run_blocking(move || {
            let mut db = conn.get()?;
            crate::chat::load_conversation(&mut db, tenant_id, conversation_id)
        })
        .await?;
        publish_assignment(&state, &conversation).await;
    } else {
        state
            .hub
            .publish(
                &queue_group(tenant_id),
                &serde_json::json!({ "type": "queue_changed" }),
            )
            .await;
    }

    Ok(Json(outcome))
}

pub async fn escalate(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<EscalateRequest>,
) -> Result<Json<Conversation>, ServiceError> {
    ctx.require_agent()?;
    if req.reason.trim().is_empty() {
        return Err(ServiceError::Validation("escalation reason is required".into()));
    }

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let request = req.clone();
    let (conversation, from_agent, seconds) = run_blocking(move || {
        let mut db = conn.get()?;
        escalate_conversation(&mut db, tenant_id, &request)
    })
    .await?;

    info!(
        "conversation {} escalated after {}s ({})",
        conversation.id, seconds, req.reason
    );

    state.emit(DomainEvent::ConversationEscalated {
        tenant_id,
        conversation_id: conversation.id,
        from_agent_id: from_agent,
        to_agent_id: conversation.assigned_agent_id,
        reason: req.reason.clone(),
        seconds_before_escalation: seconds,
        occurred_at: Utc::now(),
    });

    if let Some(agent_id) = conversation.assigned_agent_id {
        state
            .hub
            .publish(
                &agent_group(agent_id),
                &serde_json::json!({
                    "type": "conversation_assigned",
                    "conversation_id": conversation.id,
                    "escalated": true,
                }),
            )
            .await;
    } else {
        state
            .hub
            .publish(
                &queue_group(tenant_id),
                &serde_json::json!({ "type": "queue_changed" }),
            )
            .await;
    }

    Ok(Json(conversation))
}

pub async fn publish_assignment(state: &Arc<AppState>, conversation: &Conversation) {
    let Some(agent_id) = conversation.assigned_agent_id else {
        return;
    };

    state
        .hub
        .publish(
            &agent_group(agent_id),
            &serde_json::json!({
                "type": "conversation_assigned",
                "conversation_id": conversation.id,
                "customer_name": conversation.customer_name,
                "channel": conversation.channel,
                "priority": conversation.priority,
            }),
        )
        .await;
    state
        .hub
        .publish(
            &queue_group(conversation.tenant_id),
            &serde_json::json!({ "type": "queue_changed" }),
        )
        .await;

    state.emit(DomainEvent::ConversationAssigned {
        tenant_id: conversation.tenant_id,
        conversation_id: conversation.id,
        agent_id,
        customer_name: conversation.customer_name.clone(),
        occurred_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn agent(active: i32, max: i32, idle_minutes: i64) -> AgentStatus {
        AgentStatus {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            availability: "online".into(),
            department: None,
            language: None,
            active_conversations: active,
            max_conversations: max,
            last_activity: Utc::now() - Duration::minutes(idle_minutes),
        }
    }

    fn conversation(priority: i32, queued_minutes_ago: i64) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            customer_name: "customer".into(),
            customer_email: None,
            channel: "widget".into(),
            status: "queued".into(),
            priority,
            department: None,
            language: None,
            assigned_agent_id: None,
            queued_at: Some(now - Duration::minutes(queued_minutes_ago)),
            assigned_at: None,
            resolved_at: None,
            escalation_reason: None,
            satisfaction_rating: None,
            created_at: now - Duration::minutes(queued_minutes_ago),
            updated_at: now,
        }
    }

    #[test]
    fn offline_and_full_agents_are_ineligible() {
        let conv = conversation(1, 0);

        let mut offline = agent(0, 5, 0);
        offline.availability = "offline".into();
        assert!(!is_eligible(&offline, &conv));

        let full = agent(5, 5, 0);
        assert!(!is_eligible(&full, &conv));

        let open = agent(4, 5, 0);
        assert!(is_eligible(&open, &conv));
    }

    #[test]
    fn department_and_language_must_match_when_specified() {
        let mut conv = conversation(1, 0);
        conv.department = Some("billing".into());

        let mut wrong_dept = agent(0, 5, 0);
        wrong_dept.department = Some("support".into());
        assert!(!is_eligible(&wrong_dept, &conv));

        let mut no_dept = agent(0, 5, 0);
        no_dept.department = None;
        assert!(!is_eligible(&no_dept, &conv));

        let mut right_dept = agent(0, 5, 0);
        right_dept.department = Some("Billing".into());
        assert!(is_eligible(&right_dept, &conv));

        conv.language = Some("pt".into());
        assert!(!is_eligible(&right_dept, &conv));
        right_dept.language = Some("PT".into());
        assert!(is_eligible(&right_dept, &conv));
    }

    #[test]
    fn pick_agent_prefers_lowest_load_then_longest_idle() {
        let conv = conversation(1, 0);
        let busy = agent(3, 5, 60);
        let light_recent = agent(1, 5, 1);
        let light_idle = agent(1, 5, 45);

        let agents = vec![busy.clone(), light_recent.clone(), light_idle.clone()];
        let picked = pick_agent(&agents, &conv).expect("someone is eligible");
        assert_eq!(picked.user_id, light_idle.user_id);
    }

    #[test]
    fn pick_agent_none_when_all_full() {
        let conv = conversation(1, 0);
        let agents = vec![agent(5, 5, 10), agent(2, 2, 99)];
        assert!(pick_agent(&agents, &conv).is_none());
    }

    #[test]
    fn queue_orders_by_priority_then_age() {
        // High priority queued later still beats normal priority queued
        // earlier.
        let high_late = conversation(2, 0);
        let normal_early = conversation(1, 5);

        let mut queue = vec![normal_early.clone(), high_late.clone()];
        queue.sort_by(queue_order);
        assert_eq!(queue[0].id, high_late.id);
        assert_eq!(queue[1].id, normal_early.id);
    }

    #[test]
    fn queue_breaks_priority_ties_by_queued_at() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut older = conversation(1, 0);
        older.queued_at = Some(t0);
        let mut newer = conversation(1, 0);
        newer.queued_at = Some(t0 + Duration::minutes(3));

        let mut queue = vec![newer.clone(), older.clone()];
        queue.sort_by(queue_order);
        assert_eq!(queue[0].id, older.id);
    }

    #[test]
    fn unstamped_entries_sort_last() {
        let mut unstamped = conversation(1, 0);
        unstamped.queued_at = None;
        let stamped = conversation(1, 10);

        let mut queue = vec![unstamped.clone(), stamped.clone()];
        queue.sort_by(queue_order);
        assert_eq!(queue[0].id, stamped.id);
    }
}
