use crate::shared::hub::conversation_group;
use crate::shared::state::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub async fn chat_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let conversation_id = match params
        .get("conversation_id")
        .and_then(|v| Uuid::parse_str(v).ok())
    {
        Some(id) => id,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "conversation_id is required" })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, conversation_id))
        .into_response()
}

async fn handle_chat_socket(socket: WebSocket, state: Arc<AppState>, conversation_id: Uuid) {
    let group = conversation_group(conversation_id);
    let mut rx = state.hub.subscribe(&group).await;
    let (mut sender, mut receiver) = socket.split();

    info!("chat socket joined {}", group);

    let hello = serde_json::json!({
        "type": "connected",
        "conversation_id": conversation_id,
    });
    if let Ok(frame) = serde_json::to_string(&hello) {
        if sender.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            pushed = rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if sender.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Lagged receivers just drop frames; the client refetches
                    // history over REST when it notices a gap.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("chat socket lagged {} frames on {}", n, group);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_client_frame(&state, conversation_id, &text).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("chat socket error on {}: {}", group, e);
                        break;
                    }
                }
            }
        }
    }

    info!("chat socket left {}", group);
}

async fn handle_client_frame(state: &Arc<AppState>, conversation_id: Uuid, text: &str) {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    // Typing indicators are rebroadcast to the group; everything else goes
    // through REST so it hits validation and persistence.
    if frame.get("type").and_then(|t| t.as_str()) == Some("typing") {
        state
            .hub
            .publish(
                &conversation_group(conversation_id),
                &serde_json::json!({
                    "type": "typing",
                    "conversation_id": conversation_id,
                    "sender": frame.get("sender").cloned().unwrap_or(serde_json::Value::Null),
                }),
            )
            .await;
    }
}
