pub mod dispatch;

use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::hub::user_group;
use crate::shared::models::schema::notifications;
use crate::shared::models::{Notification, NotificationStatus};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// One variant per notification kind; the dispatcher is the single handler
/// for all of them. Recipients and channels are decided here, not by the
/// callers.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Welcome {
        tenant_id: Uuid,
        user_id: Uuid,
        display_name: String,
    },
    ConversationAssigned {
        tenant_id: Uuid,
        agent_id: Uuid,
        conversation_id: Uuid,
        customer_name: String,
    },
    ConversationEscalated {
        tenant_id: Uuid,
        agent_id: Option<Uuid>,
        conversation_id: Uuid,
        reason: String,
    },
    NewMessage {
        tenant_id: Uuid,
        agent_id: Uuid,
        conversation_id: Uuid,
    },
    SystemAlert {
        tenant_id: Uuid,
        user_id: Uuid,
        title: String,
        body: String,
    },
    Bulk {
        tenant_id: Uuid,
        user_ids: Vec<Uuid>,
        title: String,
        body: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::ConversationAssigned { .. } => "conversation_assigned",
            Self::ConversationEscalated { .. } => "conversation_escalated",
            Self::NewMessage { .. } => "new_message",
            Self::SystemAlert { .. } => "system_alert",
            Self::Bulk { .. } => "bulk",
        }
    }

    fn channels(&self) -> &'static [&'static str] {
        match self {
            Self::Welcome { .. } => &["in_app", "email"],
            Self::ConversationAssigned { .. } => &["in_app", "push"],
            Self::ConversationEscalated { .. } => &["in_app", "email"],
            Self::NewMessage { .. } => &["in_app"],
            Self::SystemAlert { .. } => &["in_app", "email"],
            Self::Bulk { .. } => &["in_app"],
        }
    }

    fn recipients(&self) -> Vec<Uuid> {
        match self {
            Self::Welcome { user_id, .. } | Self::SystemAlert { user_id, .. } => vec![*user_id],
            Self::ConversationAssigned { agent_id, .. } | Self::NewMessage { agent_id, .. } => {
                vec![*agent_id]
            }
            Self::ConversationEscalated { agent_id, .. } => agent_id.iter().copied().collect(),
            Self::Bulk { user_ids, .. } => user_ids.clone(),
        }
    }

    fn title_body(&self) -> (String, String) {
        match self {
            Self::Welcome { display_name, .. } => (
                "Welcome".to_string(),
                format!("Hi {}, your workspace is ready.", display_name),
            ),
            Self::ConversationAssigned { customer_name, .. } => (
                "Conversation assigned".to_string(),
                format!("You have been assigned a conversation with {}.", customer_name),
            ),
            Self::ConversationEscalated { reason, .. } => (
                "Conversation escalated".to_string(),
                format!("A conversation was escalated to you: {}", reason),
            ),
            Self::NewMessage { .. } => (
                "New message".to_string(),
                "A customer replied in one of your conversations.".to_string(),
            ),
            Self::SystemAlert { title, body, .. } | Self::Bulk { title, body, .. } => {
                (title.clone(), body.clone())
            }
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            Self::Welcome { tenant_id, .. }
            | Self::ConversationAssigned { tenant_id, .. }
            | Self::ConversationEscalated { tenant_id, .. }
            | Self::NewMessage { tenant_id, .. }
            | Self::SystemAlert { tenant_id, .. }
            | Self::Bulk { tenant_id, .. } => *tenant_id,
        }
    }

    /// Expands the event into one pending row per (recipient, channel).
    pub fn rows(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let (title, body) = self.title_body();
        let mut rows = Vec::new();
        for recipient in self.recipients() {
            for channel in self.channels() {
                rows.push(Notification {
                    id: Uuid::new_v4(),
                    tenant_id: self.tenant_id(),
                    user_id: recipient,
                    kind: self.kind().to_string(),
                    title: title.clone(),
                    body: body.clone(),
                    channel: (*channel).to_string(),
                    status: NotificationStatus::Pending.as_str().to_string(),
                    retry_count: 0,
                    delivered_at: None,
                    read_at: None,
                    created_at: now,
                });
            }
        }
        rows
    }
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/unread_count", get(unread_count))
        .route("/api/notifications/:id/read", post(mark_read))
        .route("/ws/notifications", get(notifications_websocket_handler))
}

#[derive(Debug, Serialize)]
pub struct UnreadCount {
    pub unread: i64,
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<Notification>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        let list = notifications::table
            .filter(notifications::tenant_id.eq(ctx.tenant_id))
            .filter(notifications::user_id.eq(ctx.user_id))
            .filter(notifications::channel.eq("in_app"))
            .order(notifications::created_at.desc())
            .limit(50)
            .load::<Notification>(&mut db)?;
        Ok(list)
    })
    .await?;
    Ok(Json(list))
}

/// Reconnect snapshot for hub clients.
async fn unread_count(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<UnreadCount>, ServiceError> {
    let conn = state.conn.clone();
    let unread = run_blocking(move || {
        let mut db = conn.get()?;
        let unread: i64 = notifications::table
            .filter(notifications::tenant_id.eq(ctx.tenant_id))
            .filter(notifications::user_id.eq(ctx.user_id))
            .filter(notifications::channel.eq("in_app"))
            .filter(notifications::read_at.is_null())
            .count()
            .get_result(&mut db)?;
        Ok(unread)
    })
    .await?;
    Ok(Json(UnreadCount { unread }))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let conn = state.conn.clone();
    let user_id = ctx.user_id;
    run_blocking(move || {
        let mut db = conn.get()?;
        let updated = diesel::update(
            notifications::table
                .filter(notifications::id.eq(id))
                .filter(notifications::tenant_id.eq(ctx.tenant_id))
                .filter(notifications::user_id.eq(user_id)),
        )
        .set((
            notifications::status.eq(NotificationStatus::Read.as_str()),
            notifications::read_at.eq(Some(Utc::now())),
        ))
        .execute(&mut db)?;
        if updated == 0 {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    })
    .await?;

    state
        .hub
        .publish(
            &user_group(user_id),
            &serde_json::json!({
                "type": "notification_read",
                "notification_id": id,
            }),
        )
        .await;

    info!("notification {} marked read", id);
    Ok(Json(serde_json::json!({ "read": id })))
}

pub async fn notifications_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let user_id = match params.get("user_id").and_then(|v| Uuid::parse_str(v).ok()) {
        Some(id) => id,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "user_id is required" })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_notification_socket(socket, state, user_id))
        .into_response()
}

async fn handle_notification_socket(socket: WebSocket, state: Arc<AppState>, user_id: Uuid) {
    let mut rx = state.hub.subscribe(&user_group(user_id)).await;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            pushed = rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if sender.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("notification socket lagged {} frames", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("notification socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigned_event_targets_agent_on_two_channels() {
        let agent = Uuid::new_v4();
        let event = NotificationEvent::ConversationAssigned {
            tenant_id: Uuid::new_v4(),
            agent_id: agent,
            conversation_id: Uuid::new_v4(),
            customer_name: "Ada".into(),
        };
        let rows = event.rows(Utc::now());
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.user_id == agent));
        assert!(rows.iter().any(|r| r.channel == "in_app"));
        assert!(rows.iter().any(|r| r.channel == "push"));
        assert!(rows.iter().all(|r| r.status == "pending" && r.retry_count == 0));
    }

    #[test]
    fn escalation_without_target_agent_produces_no_rows() {
        let event = NotificationEvent::ConversationEscalated {
            tenant_id: Uuid::new_v4(),
            agent_id: None,
            conversation_id: Uuid::new_v4(),
            reason: "needs a specialist".into(),
        };
        assert!(event.rows(Utc::now()).is_empty());
    }

    #[test]
    fn bulk_fans_out_per_recipient() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let event = NotificationEvent::Bulk {
            tenant_id: Uuid::new_v4(),
            user_ids: ids.clone(),
            title: "Maintenance".into(),
            body: "Saturday 02:00 UTC".into(),
        };
        let rows = event.rows(Utc::now());
        assert_eq!(rows.len(), 3);
        for id in ids {
            assert!(rows.iter().any(|r| r.user_id == id));
        }
    }
}
