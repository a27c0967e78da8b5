pub mod hub;

use crate::billing::usage::{self, Metric};
use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::events::DomainEvent;
use crate::shared::hub::conversation_group;
use crate::shared::models::schema::{conversations, messages};
use crate::shared::models::{
    Channel, Conversation, ConversationStatus, Message, Priority, SenderKind,
};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/messages", post(post_message))
        .route("/api/conversations/:id/messages", get(list_messages))
        .route("/api/conversations/:id/resolve", post(resolve_conversation))
        .route("/api/conversations/:id/close", post(close_conversation))
        .route("/api/conversations/:id/rate", post(rate_conversation))
        .route("/ws/chat", get(hub::chat_websocket_handler))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub channel: String,
    pub priority: Option<i32>,
    pub department: Option<String>,
    pub language: Option<String>,
    pub initial_message: String,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub sender: i32,
    pub content: String,
    pub message_type: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationFilters {
    pub status: Option<String>,
    pub channel: Option<String>,
    pub assigned_agent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rating: i32,
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ServiceError> {
    let channel = Channel::parse(&req.channel)
        .ok_or_else(|| ServiceError::Validation(format!("unknown channel: {}", req.channel)))?;
    let priority = match req.priority {
        Some(p) => Priority::from_i32(p)
            .ok_or_else(|| ServiceError::Validation(format!("unknown priority: {}", p)))?,
        None => Priority::Normal,
    };
    if req.initial_message.trim().is_empty() {
        return Err(ServiceError::Validation("initial message is required".into()));
    }

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let conversation = run_blocking(move || {
        let mut db = conn.get()?;

        usage::check_quota(&mut db, tenant_id, Metric::Conversations)?;

        db.transaction::<Conversation, ServiceError, _>(|db| {
            let now = Utc::now();
            let conversation = Conversation {
                id: Uuid::new_v4(),
                tenant_id,
                customer_name: req.customer_name.clone(),
                customer_email: req.customer_email.clone(),
                channel: channel.as_str().to_string(),
                status: ConversationStatus::Active.as_str().to_string(),
                priority: priority as i32,
                department: req.department.clone(),
                language: req.language.clone(),
                assigned_agent_id: None,
                queued_at: None,
                assigned_at: None,
                resolved_at: None,
                escalation_reason: None,
                satisfaction_rating: None,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(conversations::table)
                .values(&conversation)
                .execute(db)?;

            let message = Message {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                tenant_id,
                sender: SenderKind::Customer as i32,
                message_type: 0,
                content: req.initial_message.clone(),
                message_index: 0,
                created_at: now,
            };
            diesel::insert_into(messages::table)
                .values(&message)
                .execute(db)?;

            usage::record_usage(db, tenant_id, Metric::Conversations)?;

            Ok(conversation)
        })
    })
    .await?;

    info!(
        "conversation {} opened on {} for tenant {}",
        conversation.id, conversation.channel, conversation.tenant_id
    );

    state.emit(DomainEvent::ConversationStarted {
        tenant_id: conversation.tenant_id,
        conversation_id: conversation.id,
        channel: conversation.channel.clone(),
        occurred_at: conversation.created_at,
    });

    Ok(Json(conversation))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, ServiceError> {
    let conn = state.conn.clone();
    let conversation = run_blocking(move || {
        let mut db = conn.get()?;
        load_conversation(&mut db, ctx.tenant_id, id)
    })
    .await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(filters): Query<ConversationFilters>,
) -> Result<Json<Vec<Conversation>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        let mut query = conversations::table
            .filter(conversations::tenant_id.eq(ctx.tenant_id))
            .into_boxed();
        if let Some(status) = &filters.status {
            query = query.filter(conversations::status.eq(status.clone()));
        }
        if let Some(channel) = &filters.channel {
            query = query.filter(conversations::channel.eq(channel.clone()));
        }
        if let Some(agent) = filters.assigned_agent_id {
            query = query.filter(conversations::assigned_agent_id.eq(agent));
        }
        let list = query
            .order(conversations::updated_at.desc())
            .limit(100)
            .load::<Conversation>(&mut db)?;
        Ok(list)
    })
    .await?;
    Ok(Json(list))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<Message>, ServiceError> {
    let sender = SenderKind::from_i32(req.sender)
        .ok_or_else(|| ServiceError::Validation(format!("unknown sender kind: {}", req.sender)))?;
    if req.content.trim().is_empty() {
        return Err(ServiceError::Validation("message content is required".into()));
    }

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let message_type = req.message_type.unwrap_or(0);
    let content = req.content.clone();
    let message = run_blocking(move || {
        let mut db = conn.get()?;
        append_message(&mut db, tenant_id, id, sender, &content, message_type)
    })
    .await?;

    state
        .hub
        .publish(
            &conversation_group(id),
            &serde_json::json!({
                "type": "new_message",
                "conversation_id": id,
                "message_id": message.id,
                "sender": message.sender,
                "content": message.content,
                "message_index": message.message_index,
                "created_at": message.created_at.to_rfc3339(),
            }),
        )
        .await;

    state.emit(DomainEvent::MessageAdded {
        tenant_id,
        conversation_id: id,
        sender: message.sender,
        message_index: message.message_index,
        occurred_at: message.created_at,
    });

    Ok(Json(message))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        // Tenant check first so cross-tenant ids read as absent.
        load_conversation(&mut db, ctx.tenant_id, id)?;
        let list = messages::table
            .filter(messages::conversation_id.eq(id))
            .order(messages::message_index.asc())
            .load::<Message>(&mut db)?;
        Ok(list)
    })
    .await?;
    Ok(Json(list))
}

async fn resolve_conversation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, ServiceError> {
    ctx.require_agent()?;
    finish_conversation(state, ctx, id, ConversationStatus::Resolved).await
}

async fn close_conversation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, ServiceError> {
    finish_conversation(state, ctx, id, ConversationStatus::Closed).await
}

async fn finish_conversation(
    state: Arc<AppState>,
    ctx: TenantContext,
    id: Uuid,
    target: ConversationStatus,
) -> Result<Json<Conversation>, ServiceError> {
    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let conversation = run_blocking(move || {
        let mut db = conn.get()?;

        db.transaction::<Conversation, ServiceError, _>(|db| {
            let conversation: Conversation = conversations::table
                .filter(conversations::id.eq(id))
                .filter(conversations::tenant_id.eq(tenant_id))
                .for_update()
                .first(db)
                .optional()?
                .ok_or(ServiceError::NotFound)?;

            let status = ConversationStatus::parse(&conversation.status)
                .ok_or_else(|| ServiceError::Internal("corrupt status".into()))?;
            if status.is_terminal() {
                return Err(ServiceError::Conflict(format!(
                    "conversation already {}",
                    conversation.status
                )));
            }

            let now = Utc::now();
            diesel::update(conversations::table.filter(conversations::id.eq(id)))
                .set((
                    conversations::status.eq(target.as_str()),
                    conversations::resolved_at.eq(Some(now)),
                    conversations::updated_at.eq(now),
                ))
                .execute(db)?;

            if let Some(agent_id) = conversation.assigned_agent_id {
                crate::attendance::queue::release_agent_slot(db, tenant_id, agent_id)?;
            }

            let mut finished = conversation;
            finished.status = target.as_str().to_string();
            finished.resolved_at = Some(now);
            finished.updated_at = now;
            Ok(finished)
        })
    })
    .await?;

    state
        .hub
        .publish(
            &conversation_group(id),
            &serde_json::json!({
                "type": "status_changed",
                "conversation_id": id,
                "status": conversation.status,
            }),
        )
        .await;

    state.emit(DomainEvent::ConversationResolved {
        tenant_id: conversation.tenant_id,
        conversation_id: conversation.id,
        agent_id: conversation.assigned_agent_id,
        occurred_at: Utc::now(),
    });

    Ok(Json(conversation))
}

async fn rate_conversation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<RateRequest>,
) -> Result<Json<Conversation>, ServiceError> {
    if !(1..=5).contains(&req.rating) {
        return Err(ServiceError::Validation(
            "rating must be between 1 and 5".into(),
        ));
    }

    let conn = state.conn.clone();
    let conversation = run_blocking(move || {
        let mut db = conn.get()?;
        let conversation = load_conversation(&mut db, ctx.tenant_id, id)?;
        let status = ConversationStatus::parse(&conversation.status)
            .ok_or_else(|| ServiceError::Internal("corrupt status".into()))?;
        if !status.is_terminal() {
            return Err(ServiceError::Validation(
                "only resolved or closed conversations can be rated".into(),
            ));
        }

        diesel::update(conversations::table.filter(conversations::id.eq(id)))
            .set((
                conversations::satisfaction_rating.eq(Some(req.rating)),
                conversations::updated_at.eq(Utc::now()),
            ))
            .execute(&mut db)?;

        let mut rated = conversation;
        rated.satisfaction_rating = Some(req.rating);
        Ok(rated)
    })
    .await?;

    Ok(Json(conversation))
}

pub fn load_conversation(
    db: &mut PgConnection,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Conversation, ServiceError> {
    conversations::table
        .filter(conversations::id.eq(id))
        .filter(conversations::tenant_id.eq(tenant_id))
        .first(db)
        .optional()?
        .ok_or(ServiceError::NotFound)
}

/// Appends a message to a conversation. The conversation row is locked for
/// the duration of the transaction so the (message_index, created_at) pair
/// is allocated serially per conversation; indices stay dense and
/// created_at never decreases in index order.
pub fn append_message(
    db: &mut PgConnection,
    tenant_id: Uuid,
    conversation_id: Uuid,
    sender: SenderKind,
    content: &str,
    message_type: i32,
) -> Result<Message, ServiceError> {
    db.transaction::<Message, ServiceError, _>(|db| {
        let conversation: Conversation = conversations::table
            .filter(conversations::id.eq(conversation_id))
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

        let next_index: i64 = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .select(diesel::dsl::max(messages::message_index))
            .first::<Option<i64>>(db)?
            .map(|max| max + 1)
            .unwrap_or(0);

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            tenant_id,
            sender: sender as i32,
            message_type,
            content: content.to_string(),
            message_index: next_index,
            created_at: now,
        };
        diesel::insert_into(messages::table)
            .values(&message)
            .execute(db)?;

        // First agent reply moves an assigned conversation to active.
        let new_status = if sender == SenderKind::Agent && status == ConversationStatus::Assigned {
            ConversationStatus::Active.as_str()
        } else {
            conversation.status.as_str()
        };
        diesel::update(conversations::table.filter(conversations::id.eq(conversation_id)))
            .set((
                conversations::status.eq(new_status),
                conversations::updated_at.eq(now),
            ))
            .execute(db)?;

        Ok(message)
    })
}
