use crate::billing::usage::{self, Metric};
use crate::kb;
use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::hub::conversation_group;
use crate::shared::models::schema::messages;
use crate::shared::models::{ConversationStatus, Message, SenderKind};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use diesel::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const HISTORY_TURNS: i64 = 10;
const MAX_SNIPPETS: usize = 5;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new().route("/api/ai/chat", post(ai_chat))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: Uuid,
    pub reply: String,
    pub intents: Vec<String>,
    pub confidence: f32,
    pub is_successful: bool,
    pub error_message: Option<String>,
    pub snippets_used: usize,
}

impl ChatResponse {
    fn failed(conversation_id: Uuid, intents: Vec<String>, error: String) -> Self {
        Self {
            conversation_id,
            reply: String::new(),
            intents,
            confidence: 0.0,
            is_successful: false,
            error_message: Some(error),
            snippets_used: 0,
        }
    }
}

/// Keyword intent heuristics. Deliberately cheap; the detected intents feed
/// routing hints, not automation that could misfire.
pub fn detect_intents(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    let mut intents = Vec::new();

    let handoff = ["human", "agent", "representative", "real person", "speak to someone"];
    if handoff.iter().any(|kw| lower.contains(kw)) {
        intents.push("human_handoff".to_string());
    }
    if lower.contains("cancel") {
        intents.push("cancellation".to_string());
    }
    if ["refund", "charge", "invoice", "billing", "payment"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        intents.push("billing".to_string());
    }
    if ["bug", "error", "broken", "not working", "crash"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        intents.push("technical_issue".to_string());
    }

    intents
}

pub fn build_prompt(history: &[Message], snippets: &[String], user_message: &str) -> String {
    let mut prompt = String::from(
        "You are a support assistant. Answer concisely and only from the \
         provided context when it is relevant.\n",
    );

    if !snippets.is_empty() {
        prompt.push_str("\nKnowledge base context:\n");
        for (i, snippet) in snippets.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i + 1, snippet));
        }
    }

    if !history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for message in history {
            let speaker = match SenderKind::from_i32(message.sender) {
                Some(SenderKind::Customer) => "Customer",
                Some(SenderKind::Bot) => "Assistant",
                Some(SenderKind::Agent) => "Agent",
                _ => "System",
            };
            prompt.push_str(&format!("{}: {}\n", speaker, message.content));
        }
    }

    prompt.push_str(&format!("\nCustomer: {}\nAssistant:", user_message));
    prompt
}

fn confidence_for(intents: &[String], snippets_used: usize) -> f32 {
    let base = 0.55_f32;
    let context_bonus = 0.07 * snippets_used as f32;
    let intent_bonus = if intents.is_empty() { 0.0 } else { 0.05 };
    (base + context_bonus + intent_bonus).min(0.95)
}

pub async fn ai_chat(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<ChatRequest>,
) -> Result<(StatusCode, Json<ChatResponse>), ServiceError> {
    if req.message.trim().is_empty() {
        return Err(ServiceError::Validation("message is required".into()));
    }

    if state.ai_limiter.check_key(&ctx.tenant_id).is_err() {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ChatResponse::failed(
                req.conversation_id,
                vec![],
                "rate limit exceeded, retry shortly".into(),
            )),
        ));
    }

    let tenant_id = ctx.tenant_id;
    let conversation_id = req.conversation_id;
    let intents = detect_intents(&req.message);

    // Persist the inbound turn and pull history in one round-trip.
    let conn = state.conn.clone();
    let user_message = req.message.clone();
    let history = run_blocking(move || {
        let mut db = conn.get()?;
        usage::check_quota(&mut db, tenant_id, Metric::AiReplies)?;
        crate::chat::append_message(
            &mut db,
            tenant_id,
            conversation_id,
            SenderKind::Customer,
            &user_message,
            0,
        )?;

        let mut recent: Vec<Message> = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .order(messages::message_index.desc())
            .limit(HISTORY_TURNS)
            .load(&mut db)?;
        recent.reverse();
        Ok(recent)
    })
    .await?;

    // Retrieval is non-essential: a failed lookup degrades to an
    // uncontextualized answer.
    let snippets = {
        let conn = state.conn.clone();
        let query = req.message.clone();
        match run_blocking(move || {
            let mut db = conn.get()?;
            kb::search_chunks(&mut db, tenant_id, &query, MAX_SNIPPETS)
        })
        .await
        {
            Ok(hits) => hits.into_iter().map(|h| h.content).collect::<Vec<_>>(),
            Err(e) => {
                warn!("context retrieval failed, continuing without: {}", e);
                Vec::new()
            }
        }
    };

    let prompt = build_prompt(&history, &snippets, &req.message);
    let generated = state
        .llm_provider
        .generate(&prompt, &serde_json::json!({ "max_tokens": 1000 }))
        .await;

    match generated {
        Ok(reply) => {
            let conn = state.conn.clone();
            let bot_reply = reply.clone();
            let stored = run_blocking(move || {
                let mut db = conn.get()?;
                let message = crate::chat::append_message(
                    &mut db,
                    tenant_id,
                    conversation_id,
                    SenderKind::Bot,
                    &bot_reply,
                    0,
                )?;
                usage::record_usage(&mut db, tenant_id, Metric::AiReplies)?;
                Ok(message)
            })
            .await?;

            state
                .hub
                .publish(
                    &conversation_group(conversation_id),
                    &serde_json::json!({
                        "type": "new_message",
                        "conversation_id": conversation_id,
                        "message_id": stored.id,
                        "sender": stored.sender,
                        "content": stored.content,
                        "message_index": stored.message_index,
                        "created_at": stored.created_at.to_rfc3339(),
                    }),
                )
                .await;

            if intents.iter().any(|i| i == "human_handoff") {
                request_handoff(&state, tenant_id, conversation_id).await;
            }

            let confidence = confidence_for(&intents, snippets.len());
            Ok((
                StatusCode::OK,
                Json(ChatResponse {
                    conversation_id,
                    reply,
                    intents,
                    confidence,
                    is_successful: true,
                    error_message: None,
                    snippets_used: snippets.len(),
                }),
            ))
        }
        Err(e) => {
            // Essential upstream call: surface the failure as a response
            // object with a 500, never as a bare error page.
            warn!("{} generation failed: {}", state.llm_provider.name(), e);
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatResponse::failed(
                    conversation_id,
                    intents,
                    format!("generation failed: {}", e),
                )),
            ))
        }
    }
}

/// Flips the conversation to waiting and tries to route it to a human.
async fn request_handoff(state: &Arc<AppState>, tenant_id: Uuid, conversation_id: Uuid) {
    use crate::shared::models::schema::conversations;

    let conn = state.conn.clone();
    let flipped = run_blocking(move || {
        let mut db = conn.get()?;
        diesel::update(
            conversations::table
                .filter(conversations::id.eq(conversation_id))
                .filter(conversations::tenant_id.eq(tenant_id))
                .filter(conversations::assigned_agent_id.is_null())
                .filter(conversations::status.eq(ConversationStatus::Active.as_str())),
        )
        .set(conversations::status.eq(ConversationStatus::Waiting.as_str()))
        .execute(&mut db)
        .map_err(ServiceError::from)
    })
    .await;

    match flipped {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }

    let conn = state.conn.clone();
    let routed = run_blocking(move || {
        let mut db = conn.get()?;
        crate::attendance::queue::route_conversation(&mut db, tenant_id, conversation_id)
    })
    .await;

    match routed {
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
        }
        Ok(_) => {
            info!("conversation {} queued for a human", conversation_id);
        }
        Err(e) => {
            warn!("handoff routing failed for {}: {}", conversation_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(sender: SenderKind, content: &str, index: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            sender: sender as i32,
            message_type: 0,
            content: content.to_string(),
            message_index: index,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn detects_handoff_and_billing() {
        let intents = detect_intents("I want to talk to a REAL PERSON about a refund");
        assert!(intents.contains(&"human_handoff".to_string()));
        assert!(intents.contains(&"billing".to_string()));
    }

    #[test]
    fn no_intents_on_plain_question() {
        assert!(detect_intents("what are your opening hours?").is_empty());
    }

    #[test]
    fn prompt_includes_snippets_and_history_in_order() {
        let history = vec![
            msg(SenderKind::Customer, "hi", 0),
            msg(SenderKind::Bot, "hello, how can I help?", 1),
        ];
        let snippets = vec!["Opening hours are 9-17 CET.".to_string()];
        let prompt = build_prompt(&history, &snippets, "when do you open?");

        let ctx_pos = prompt.find("Opening hours are").unwrap();
        let hist_pos = prompt.find("Customer: hi").unwrap();
        let question_pos = prompt.find("when do you open?").unwrap();
        assert!(ctx_pos < hist_pos && hist_pos < question_pos);
        assert!(prompt.ends_with("Assistant:"));
    }

    #[test]
    fn confidence_grows_with_context_and_caps() {
        let none = confidence_for(&[], 0);
        let some = confidence_for(&["billing".into()], 3);
        let max = confidence_for(&["billing".into()], 50);
        assert!(none < some);
        assert!(some < max);
        assert!(max <= 0.95);
    }
}
