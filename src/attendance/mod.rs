pub mod queue;

use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::hub::{agent_group, queue_group};
use crate::shared::models::schema::{agent_status, users};
use crate::shared::models::{AgentStatus, Availability};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/attendance/queue", get(queue::list_queue))
        .route("/api/attendance/assign", post(queue::assign))
        .route("/api/attendance/route/:conversation_id", post(queue::route))
        .route("/api/attendance/escalate", post(queue::escalate))
        .route("/api/attendance/agents", get(list_agents))
        .route("/api/attendance/agents/:user_id", put(update_agent))
        .route("/ws/attendant", get(attendant_websocket_handler))
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendantStats {
    pub user_id: Uuid,
    pub display_name: String,
    pub availability: String,
    pub department: Option<String>,
    pub language: Option<String>,
    pub active_conversations: i32,
    pub max_conversations: i32,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentRequest {
    pub availability: Option<String>,
    pub department: Option<String>,
    pub language: Option<String>,
    pub max_conversations: Option<i32>,
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<AttendantStats>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        let rows: Vec<(AgentStatus, String)> = agent_status::table
            .inner_join(users::table)
            .filter(agent_status::tenant_id.eq(ctx.tenant_id))
            .select((AgentStatus::as_select(), users::display_name))
            .order(agent_status::last_activity.desc())
            .load(&mut db)?;
        Ok(rows
            .into_iter()
            .map(|(a, display_name)| AttendantStats {
                user_id: a.user_id,
                display_name,
                availability: a.availability,
                department: a.department,
                language: a.language,
                active_conversations: a.active_conversations,
                max_conversations: a.max_conversations,
                last_activity: a.last_activity,
            })
            .collect())
    })
    .await?;
    Ok(Json(list))
}

/// Upserts an agent's presence row. Agents update themselves; anything else
/// requires tenant admin.
pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<Json<AgentStatus>, ServiceError> {
    if user_id == ctx.user_id {
        ctx.require_agent()?;
    } else {
        ctx.require_tenant_admin()?;
    }

    let availability = match &req.availability {
        Some(raw) => Some(
            Availability::parse(raw)
                .ok_or_else(|| ServiceError::Validation(format!("unknown availability: {}", raw)))?,
        ),
        None => None,
    };
    if let Some(max) = req.max_conversations {
        if max < 1 {
            return Err(ServiceError::Validation(
                "max_conversations must be at least 1".into(),
            ));
        }
    }

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let status = run_blocking(move || {
        let mut db = conn.get()?;
        let now = Utc::now();

        let existing: Option<AgentStatus> = agent_status::table
            .filter(agent_status::user_id.eq(user_id))
            .filter(agent_status::tenant_id.eq(tenant_id))
            .first(&mut db)
            .optional()?;

        let status = match existing {
            Some(mut current) => {
                if let Some(a) = availability {
                    current.availability = a.as_str().to_string();
                }
                if let Some(dept) = req.department {
                    current.department = Some(dept);
                }
                if let Some(lang) = req.language {
                    current.language = Some(lang);
                }
                if let Some(max) = req.max_conversations {
                    current.max_conversations = max;
                }
                current.last_activity = now;

                diesel::update(agent_status::table.filter(agent_status::id.eq(current.id)))
                    .set((
                        agent_status::availability.eq(&current.availability),
                        agent_status::department.eq(&current.department),
                        agent_status::language.eq(&current.language),
                        agent_status::max_conversations.eq(current.max_conversations),
                        agent_status::last_activity.eq(now),
                    ))
                    .execute(&mut db)?;
                current
            }
            None => {
                let status = AgentStatus {
                    id: Uuid::new_v4(),
                    user_id,
                    tenant_id,
                    availability: availability
                        .unwrap_or(Availability::Offline)
                        .as_str()
                        .to_string(),
                    department: req.department,
                    language: req.language,
                    active_conversations: 0,
                    max_conversations: req.max_conversations.unwrap_or(5),
                    last_activity: now,
                };
                diesel::insert_into(agent_status::table)
                    .values(&status)
                    .execute(&mut db)?;
                status
            }
        };
        Ok(status)
    })
    .await?;

    info!(
        "agent {} now {} ({}/{})",
        status.user_id, status.availability, status.active_conversations, status.max_conversations
    );
    Ok(Json(status))
}

// ===== attendant WebSocket =====

pub async fn attendant_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let agent_id = params.get("agent_id").and_then(|v| Uuid::parse_str(v).ok());
    let tenant_id = params.get("tenant_id").and_then(|v| Uuid::parse_str(v).ok());

    let (Some(agent_id), Some(tenant_id)) = (agent_id, tenant_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "agent_id and tenant_id are required" })),
        )
            .into_response();
    };

    info!("attendant socket request from {}", agent_id);
    ws.on_upgrade(move |socket| handle_attendant_socket(socket, state, tenant_id, agent_id))
        .into_response()
}

async fn handle_attendant_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    tenant_id: Uuid,
    agent_id: Uuid,
) {
    let mut agent_rx = state.hub.subscribe(&agent_group(agent_id)).await;
    let mut queue_rx = state.hub.subscribe(&queue_group(tenant_id)).await;
    let (mut sender, mut receiver) = socket.split();

    let welcome = serde_json::json!({
        "type": "connected",
        "agent_id": agent_id,
    });
    if let Ok(frame) = serde_json::to_string(&welcome) {
        if sender.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            pushed = agent_rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if sender.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("attendant socket lagged {} frames", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            pushed = queue_rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if sender.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("attendant socket lagged {} queue frames", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) =
                            handle_attendant_frame(&state, tenant_id, agent_id, &text).await
                        {
                            if let Ok(frame) = serde_json::to_string(&reply) {
                                if sender.send(WsMessage::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("attendant socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!("attendant socket closed for {}", agent_id);
}

/// Client-invokable hub methods. Mutations run through the same service
/// functions as the REST endpoints.
async fn handle_attendant_frame(
    state: &Arc<AppState>,
    tenant_id: Uuid,
    agent_id: Uuid,
    text: &str,
) -> Option<serde_json::Value> {
    let frame: serde_json::Value = serde_json::from_str(text).ok()?;
    match frame.get("type").and_then(|t| t.as_str())? {
        "update_status" => {
            let availability = frame.get("availability").and_then(|v| v.as_str())?;
            let availability = Availability::parse(availability)?;
            let conn = state.conn.clone();
            let result = run_blocking(move || {
                let mut db = conn.get()?;
                diesel::update(
                    agent_status::table
                        .filter(agent_status::user_id.eq(agent_id))
                        .filter(agent_status::tenant_id.eq(tenant_id)),
                )
                .set((
                    agent_status::availability.eq(availability.as_str()),
                    agent_status::last_activity.eq(Utc::now()),
                ))
                .execute(&mut db)?;
                Ok(())
            })
            .await;
            match result {
                Ok(()) => Some(serde_json::json!({
                    "type": "status_updated",
                    "availability": availability.as_str(),
                })),
                Err(e) => {
                    warn!("status update over socket failed: {}", e);
                    Some(serde_json::json!({ "type": "error", "error": e.to_string() }))
                }
            }
        }
        "accept_conversation" => {
            let conversation_id = frame
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())?;
            let conn = state.conn.clone();
            let result = run_blocking(move || {
                let mut db = conn.get()?;
                queue::assign_conversation(&mut db, tenant_id, conversation_id, agent_id)
            })
            .await;
            match result {
                Ok(conversation) => {
                    queue::publish_assignment(state, &conversation).await;
                    Some(serde_json::json!({
                        "type": "conversation_accepted",
                        "conversation_id": conversation.id,
                    }))
                }
                Err(e) => Some(serde_json::json!({
                    "type": "error",
                    "error": e.to_string(),
                })),
            }
        }
        other => {
            debug!("ignoring unknown attendant frame type {}", other);
            None
        }
    }
}
