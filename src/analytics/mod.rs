use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::models::schema::analytics_events;
use crate::shared::models::AnalyticsEvent;
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Nullable, Text, Timestamptz, Uuid as SqlUuid};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Event types accepted from external callers; the bus writes its own.
pub const KNOWN_EVENT_TYPES: [&str; 9] = [
    "conversation_started",
    "message_added",
    "conversation_assigned",
    "conversation_escalated",
    "conversation_resolved",
    "system_alert",
    "satisfaction_rated",
    "widget_opened",
    "kb_search",
];

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/analytics/events", post(ingest_events))
        .route("/api/analytics/summary", get(summary))
        .route("/api/analytics/trends", get(trends))
        .route("/api/analytics/realtime", get(realtime))
}

#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    pub event_type: String,
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub payload: Option<serde_json::Value>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct IngestBatch {
    pub events: Vec<IngestEvent>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub total_conversations: i64,
    pub resolved_conversations: i64,
    pub resolution_rate: f64,
    pub total_messages: i64,
    pub average_satisfaction: Option<f64>,
    pub average_first_response_seconds: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct TrendPoint {
    pub day: String,
    pub conversations: i64,
    pub messages: i64,
}

#[derive(Debug, Deserialize)]
pub struct TrendParams {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RealtimeResponse {
    pub open_conversations: i64,
    pub queued_conversations: i64,
    pub online_agents: i64,
}

#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct CountResult {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct AvgResult {
    #[diesel(sql_type = Nullable<Double>)]
    avg: Option<f64>,
}

#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DailyCount {
    #[diesel(sql_type = Timestamptz)]
    day: DateTime<Utc>,
    #[diesel(sql_type = BigInt)]
    conversations: i64,
    #[diesel(sql_type = BigInt)]
    messages: i64,
}

async fn ingest_events(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(batch): Json<IngestBatch>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServiceError> {
    if batch.events.is_empty() {
        return Err(ServiceError::Validation("events batch is empty".into()));
    }
    if batch.events.len() > 500 {
        return Err(ServiceError::Validation(
            "events batch exceeds 500 entries".into(),
        ));
    }
    for event in &batch.events {
        if !KNOWN_EVENT_TYPES.contains(&event.event_type.as_str()) {
            return Err(ServiceError::Validation(format!(
                "unknown event type: {}",
                event.event_type
            )));
        }
    }

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let count = batch.events.len();
    run_blocking(move || {
        let mut db = conn.get()?;
        let now = Utc::now();
        for event in batch.events {
            let row = AnalyticsEvent {
                id: Uuid::new_v4(),
                tenant_id,
                event_type: event.event_type,
                conversation_id: event.conversation_id,
                user_id: event.user_id,
                payload: event.payload.unwrap_or(serde_json::Value::Null),
                occurred_at: event.occurred_at.unwrap_or(now),
            };
            diesel::insert_into(analytics_events::table)
                .values(&row)
                .execute(&mut db)?;
        }
        Ok(())
    })
    .await?;

    info!("ingested {} analytics events for {}", count, tenant_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "ingested": count })),
    ))
}

async fn summary(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<SummaryResponse>, ServiceError> {
    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let summary = run_blocking(move || {
        let mut db = conn.get()?;

        let total_conversations = count_query(
            &mut db,
            "SELECT COUNT(*) AS count FROM conversations WHERE tenant_id = $1",
            tenant_id,
        )?;
        let resolved_conversations = count_query(
            &mut db,
            "SELECT COUNT(*) AS count FROM conversations \
             WHERE tenant_id = $1 AND status IN ('resolved', 'closed')",
            tenant_id,
        )?;
        let total_messages = count_query(
            &mut db,
            "SELECT COUNT(*) AS count FROM messages WHERE tenant_id = $1",
            tenant_id,
        )?;

        let average_satisfaction = avg_query(
            &mut db,
            "SELECT AVG(satisfaction_rating)::float8 AS avg FROM conversations \
             WHERE tenant_id = $1 AND satisfaction_rating IS NOT NULL",
            tenant_id,
        )?;

        // First response = gap between conversation start and the first
        // non-customer message.
        let average_first_response_seconds = avg_query(
            &mut db,
            "SELECT AVG(first_reply)::float8 AS avg FROM ( \
               SELECT EXTRACT(EPOCH FROM MIN(m.created_at) - c.created_at) AS first_reply \
               FROM conversations c \
               JOIN messages m ON m.conversation_id = c.id AND m.sender <> 0 \
               WHERE c.tenant_id = $1 \
               GROUP BY c.id \
             ) gaps",
            tenant_id,
        )?;

        let resolution_rate = if total_conversations > 0 {
            resolved_conversations as f64 / total_conversations as f64
        } else {
            0.0
        };

        Ok(SummaryResponse {
            total_conversations,
            resolved_conversations,
            resolution_rate,
            total_messages,
            average_satisfaction,
            average_first_response_seconds,
        })
    })
    .await?;

    Ok(Json(summary))
}

async fn trends(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<TrendParams>,
) -> Result<Json<Vec<TrendPoint>>, ServiceError> {
    let days = params.days.unwrap_or(7).clamp(1, 90);

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let points = run_blocking(move || {
        let mut db = conn.get()?;
        let rows: Vec<DailyCount> = diesel::sql_query(
            "SELECT date_trunc('day', c.created_at) AS day, \
                    COUNT(DISTINCT c.id) AS conversations, \
                    COUNT(m.id) AS messages \
             FROM conversations c \
             LEFT JOIN messages m ON m.conversation_id = c.id \
             WHERE c.tenant_id = $1 AND c.created_at > NOW() - ($2 || ' days')::interval \
             GROUP BY 1 ORDER BY 1",
        )
        .bind::<SqlUuid, _>(tenant_id)
        .bind::<Text, _>(days.to_string())
        .load(&mut db)?;

        Ok(rows
            .into_iter()
            .map(|r| TrendPoint {
                day: r.day.format("%Y-%m-%d").to_string(),
                conversations: r.conversations,
                messages: r.messages,
            })
            .collect())
    })
    .await?;

    Ok(Json(points))
}

async fn realtime(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<RealtimeResponse>, ServiceError> {
    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let snapshot = run_blocking(move || {
        let mut db = conn.get()?;
        let open_conversations = count_query(
            &mut db,
            "SELECT COUNT(*) AS count FROM conversations \
             WHERE tenant_id = $1 AND status IN ('active', 'waiting', 'assigned', 'escalated')",
            tenant_id,
        )?;
        let queued_conversations = count_query(
            &mut db,
            "SELECT COUNT(*) AS count FROM conversations \
             WHERE tenant_id = $1 AND status = 'queued'",
            tenant_id,
        )?;
        let online_agents = count_query(
            &mut db,
            "SELECT COUNT(*) AS count FROM agent_status \
             WHERE tenant_id = $1 AND availability = 'online'",
            tenant_id,
        )?;
        Ok(RealtimeResponse {
            open_conversations,
            queued_conversations,
            online_agents,
        })
    })
    .await?;

    Ok(Json(snapshot))
}

fn count_query(
    db: &mut PgConnection,
    sql: &str,
    tenant_id: Uuid,
) -> Result<i64, ServiceError> {
    let result: CountResult = diesel::sql_query(sql)
        .bind::<SqlUuid, _>(tenant_id)
        .get_result(db)?;
    Ok(result.count)
}

fn avg_query(
    db: &mut PgConnection,
    sql: &str,
    tenant_id: Uuid,
) -> Result<Option<f64>, ServiceError> {
    let result: AvgResult = diesel::sql_query(sql)
        .bind::<SqlUuid, _>(tenant_id)
        .get_result(db)?;
    Ok(result.avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_cover_the_bus_events() {
        for t in [
            "conversation_started",
            "conversation_assigned",
            "conversation_escalated",
            "conversation_resolved",
            "message_added",
            "system_alert",
        ] {
            assert!(KNOWN_EVENT_TYPES.contains(&t), "missing {}", t);
        }
        assert!(!KNOWN_EVENT_TYPES.contains(&"made_up_event"));
    }
}
