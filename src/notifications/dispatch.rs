use crate::notifications::NotificationEvent;
use crate::shared::error::ServiceError;
use crate::shared::events::DomainEvent;
use crate::shared::hub::user_group;
use crate::shared::models::schema::{analytics_events, notifications, users};
use crate::shared::models::{AnalyticsEvent, Notification, NotificationStatus, SenderKind, TriggerKind};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

pub const MAX_RETRIES: i32 = 3;
const RETRY_TICK_SECS: u64 = 30;

/// A notification whose retry budget is spent is Failed and never picked up
/// again; anything under budget stays Pending for the sweep.
pub fn status_after_failure(retry_count: i32) -> NotificationStatus {
    if retry_count >= MAX_RETRIES {
        NotificationStatus::Failed
    } else {
        NotificationStatus::Pending
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn enabled(&self) -> bool;
    async fn deliver(
        &self,
        notification: &Notification,
        recipient_email: &str,
    ) -> Result<(), ServiceError>;
}

pub struct InAppChannel {
    state: Arc<AppState>,
}

#[async_trait]
impl NotificationChannel for InAppChannel {
    fn name(&self) -> &'static str {
        "in_app"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn deliver(
        &self,
        notification: &Notification,
        _recipient_email: &str,
    ) -> Result<(), ServiceError> {
        self.state
            .hub
            .publish(
                &user_group(notification.user_id),
                &serde_json::json!({
                    "type": "notification",
                    "notification_id": notification.id,
                    "kind": notification.kind,
                    "title": notification.title,
                    "body": notification.body,
                    "created_at": notification.created_at.to_rfc3339(),
                }),
            )
            .await;
        Ok(())
    }
}

pub struct EmailChannel {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from_address: String,
}

impl EmailChannel {
    fn new(state: &AppState) -> Self {
        let cfg = &state.config.smtp;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
            .map(|builder| {
                builder
                    .credentials(Credentials::new(
                        cfg.username.clone(),
                        cfg.password.clone(),
                    ))
                    .build()
            })
            .map_err(|e| warn!("smtp transport unavailable: {}", e))
            .ok();
        Self {
            transport,
            from_address: cfg.from_address.clone(),
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn enabled(&self) -> bool {
        self.transport.is_some()
    }

    async fn deliver(
        &self,
        notification: &Notification,
        recipient_email: &str,
    ) -> Result<(), ServiceError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| ServiceError::Upstream("smtp transport not configured".into()))?;

        let from: Mailbox = self
            .from_address
            .parse()
            .map_err(|e| ServiceError::Internal(format!("bad from address: {}", e)))?;
        let to: Mailbox = recipient_email
            .parse()
            .map_err(|e| ServiceError::Validation(format!("bad recipient address: {}", e)))?;

        let email = lettre::Message::builder()
            .from(from)
            .to(to)
            .subject(notification.title.clone())
            .body(notification.body.clone())
            .map_err(|e| ServiceError::Internal(format!("email build: {}", e)))?;

        transport
            .send(email)
            .await
            .map_err(|e| ServiceError::Upstream(format!("smtp send: {}", e)))?;
        Ok(())
    }
}

/// Generic JSON webhook channel used for both the SMS and push gateways.
pub struct GatewayChannel {
    channel_name: &'static str,
    client: reqwest::Client,
    url: Option<String>,
}

impl GatewayChannel {
    fn new(channel_name: &'static str, url: Option<String>) -> Self {
        Self {
            channel_name,
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationChannel for GatewayChannel {
    fn name(&self) -> &'static str {
        self.channel_name
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn deliver(
        &self,
        notification: &Notification,
        recipient_email: &str,
    ) -> Result<(), ServiceError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ServiceError::Upstream(format!("{} gateway not configured", self.channel_name)))?;

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "user_id": notification.user_id,
                "recipient": recipient_email,
                "title": notification.title,
                "body": notification.body,
                "kind": notification.kind,
            }))
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("{} gateway: {}", self.channel_name, e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "{} gateway returned {}",
                self.channel_name,
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct Dispatcher {
    state: Arc<AppState>,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![
            Arc::new(InAppChannel {
                state: state.clone(),
            }),
            Arc::new(EmailChannel::new(&state)),
            Arc::new(GatewayChannel::new(
                "sms",
                state.config.sms_gateway_url.clone(),
            )),
            Arc::new(GatewayChannel::new(
                "push",
                state.config.push_gateway_url.clone(),
            )),
        ];
        Self { state, channels }
    }

    /// Event loop: every domain event is recorded for analytics, fanned out
    /// to notification channels and offered to workflow triggers.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DomainEvent>) {
        info!("notification dispatcher started");
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        info!("notification dispatcher stopped");
    }

    async fn handle_event(&self, event: DomainEvent) {
        if let Err(e) = self.record_analytics(&event).await {
            error!("analytics ingestion failed: {}", e);
        }

        if let Some(notification_event) = notification_for(&event) {
            self.enqueue(notification_event).await;
        }

        if matches!(event, DomainEvent::MessageAdded { .. }) {
            let conn = self.state.conn.clone();
            let ev = event.clone();
            match run_blocking(move || {
                let mut db = conn.get()?;
                message_notification(&mut db, &ev)
            })
            .await
            {
                Ok(Some(ping)) => self.enqueue(ping).await,
                Ok(None) => {}
                Err(e) => warn!("assignee lookup for message ping failed: {}", e),
            }
        }

        if let Some((kind, conversation_id)) = workflow_trigger_for(&event) {
            crate::workflows::fire_event_triggers(
                self.state.clone(),
                event.tenant_id(),
                kind,
                conversation_id,
            )
            .await;
        }
    }

    async fn record_analytics(&self, event: &DomainEvent) -> Result<(), ServiceError> {
        let conn = self.state.conn.clone();
        let row = AnalyticsEvent {
            id: Uuid::new_v4(),
            tenant_id: event.tenant_id(),
            event_type: event.event_type().to_string(),
            conversation_id: event.conversation_id(),
            user_id: None,
            payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            occurred_at: Utc::now(),
        };
        run_blocking(move || {
            let mut db = conn.get()?;
            diesel::insert_into(analytics_events::table)
                .values(&row)
                .execute(&mut db)?;
            Ok(())
        })
        .await
    }

    /// Persists pending rows and attempts first delivery. Channels fail
    /// independently; a dead SMTP relay never blocks the in-app push.
    pub async fn enqueue(&self, event: NotificationEvent) {
        let rows = event.rows(Utc::now());
        if rows.is_empty() {
            return;
        }

        let conn = self.state.conn.clone();
        let to_insert = rows.clone();
        let inserted = run_blocking(move || {
            let mut db = conn.get()?;
            for row in &to_insert {
                diesel::insert_into(notifications::table)
                    .values(row)
                    .execute(&mut db)?;
            }
            Ok(())
        })
        .await;

        if let Err(e) = inserted {
            error!("failed to persist notifications: {}", e);
            return;
        }

        for row in rows {
            self.attempt_delivery(row).await;
        }
    }

    async fn attempt_delivery(&self, notification: Notification) {
        let Some(channel) = self
            .channels
            .iter()
            .find(|c| c.name() == notification.channel)
        else {
            warn!("no channel handler for {}", notification.channel);
            return;
        };

        if !channel.enabled() {
            // Unconfigured channels burn a retry each pass and end Failed,
            // which keeps the rows visible to operators.
            self.record_failure(&notification).await;
            return;
        }

        let recipient = match self.recipient_email(notification.user_id).await {
            Ok(email) => email,
            Err(e) => {
                warn!("recipient lookup failed for {}: {}", notification.user_id, e);
                self.record_failure(&notification).await;
                return;
            }
        };

        match channel.deliver(&notification, &recipient).await {
            Ok(()) => {
                let conn = self.state.conn.clone();
                let id = notification.id;
                let _ = run_blocking(move || {
                    let mut db = conn.get()?;
                    diesel::update(notifications::table.filter(notifications::id.eq(id)))
                        .set((
                            notifications::status.eq(NotificationStatus::Sent.as_str()),
                            notifications::delivered_at.eq(Some(Utc::now())),
                        ))
                        .execute(&mut db)?;
                    Ok(())
                })
                .await;
            }
            Err(e) => {
                warn!(
                    "delivery of {} over {} failed: {}",
                    notification.id, notification.channel, e
                );
                self.record_failure(&notification).await;
            }
        }
    }

    async fn record_failure(&self, notification: &Notification) {
        let conn = self.state.conn.clone();
        let id = notification.id;
        let result = run_blocking(move || {
            let mut db = conn.get()?;
            let retries: i32 = diesel::update(notifications::table.filter(notifications::id.eq(id)))
                .set(notifications::retry_count.eq(notifications::retry_count + 1))
                .returning(notifications::retry_count)
                .get_result(&mut db)?;

            diesel::update(notifications::table.filter(notifications::id.eq(id)))
                .set(notifications::status.eq(status_after_failure(retries).as_str()))
                .execute(&mut db)?;
            Ok(retries)
        })
        .await;

        if let Ok(retries) = result {
            if retries >= MAX_RETRIES {
                info!("notification {} failed after {} attempts", id, retries);
            }
        }
    }

    async fn recipient_email(&self, user_id: Uuid) -> Result<String, ServiceError> {
        let conn = self.state.conn.clone();
        run_blocking(move || {
            let mut db = conn.get()?;
            let email: String = users::table
                .filter(users::id.eq(user_id))
                .select(users::email)
                .first(&mut db)?;
            Ok(email)
        })
        .await
    }

    /// Periodic sweep over pending rows that still have retry budget.
    pub async fn run_retry_worker(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(RETRY_TICK_SECS));
        loop {
            ticker.tick().await;
            let conn = self.state.conn.clone();
            let pending = run_blocking(move || {
                let mut db = conn.get()?;
                let rows: Vec<Notification> = notifications::table
                    .filter(notifications::status.eq(NotificationStatus::Pending.as_str()))
                    .filter(notifications::retry_count.lt(MAX_RETRIES))
                    .filter(notifications::retry_count.gt(0))
                    .order(notifications::created_at.asc())
                    .limit(100)
                    .load(&mut db)?;
                Ok(rows)
            })
            .await;

            match pending {
                Ok(rows) => {
                    for row in rows {
                        self.attempt_delivery(row).await;
                    }
                }
                Err(e) => error!("retry sweep failed: {}", e),
            }
        }
    }
}

/// Maps bus events onto the closed notification set. Events with no
/// notification semantics return None.
fn notification_for(event: &DomainEvent) -> Option<NotificationEvent> {
    match event {
        DomainEvent::ConversationAssigned {
            tenant_id,
            conversation_id,
            agent_id,
            customer_name,
            ..
        } => Some(NotificationEvent::ConversationAssigned {
            tenant_id: *tenant_id,
            agent_id: *agent_id,
            conversation_id: *conversation_id,
            customer_name: customer_name.clone(),
        }),
        DomainEvent::ConversationEscalated {
            tenant_id,
            conversation_id,
            to_agent_id,
            reason,
            ..
        } => Some(NotificationEvent::ConversationEscalated {
            tenant_id: *tenant_id,
            agent_id: *to_agent_id,
            conversation_id: *conversation_id,
            reason: reason.clone(),
        }),
        DomainEvent::SystemAlert {
            tenant_id,
            user_id,
            title,
            body,
            ..
        } => Some(NotificationEvent::SystemAlert {
            tenant_id: *tenant_id,
            user_id: *user_id,
            title: title.clone(),
            body: body.clone(),
        }),
        DomainEvent::UserRegistered {
            tenant_id,
            user_id,
            display_name,
            ..
        } => Some(NotificationEvent::Welcome {
            tenant_id: *tenant_id,
            user_id: *user_id,
            display_name: display_name.clone(),
        }),
        DomainEvent::MessageAdded { .. }
        | DomainEvent::ConversationStarted { .. }
        | DomainEvent::ConversationResolved { .. } => None,
    }
}

fn workflow_trigger_for(event: &DomainEvent) -> Option<(TriggerKind, Option<Uuid>)> {
    match event {
        DomainEvent::ConversationStarted {
            conversation_id, ..
        } => Some((TriggerKind::ConversationCreated, Some(*conversation_id))),
        DomainEvent::ConversationEscalated {
            conversation_id, ..
        } => Some((TriggerKind::ConversationEscalated, Some(*conversation_id))),
        DomainEvent::ConversationResolved {
            conversation_id, ..
        } => Some((TriggerKind::ConversationResolved, Some(*conversation_id))),
        _ => None,
    }
}

/// New customer messages ping the assigned agent. Kept separate from
/// notification_for because it needs the conversation's assignee.
pub fn message_notification(
    db: &mut PgConnection,
    event: &DomainEvent,
) -> Result<Option<NotificationEvent>, ServiceError> {
    use crate::shared::models::schema::conversations;

    let DomainEvent::MessageAdded {
        tenant_id,
        conversation_id,
        sender,
        ..
    } = event
    else {
        return Ok(None);
    };
    if SenderKind::from_i32(*sender) != Some(SenderKind::Customer) {
        return Ok(None);
    }

    let assignee: Option<Option<Uuid>> = conversations::table
        .filter(conversations::id.eq(conversation_id))
        .select(conversations::assigned_agent_id)
        .first(db)
        .optional()?;

    Ok(assignee.flatten().map(|agent_id| NotificationEvent::NewMessage {
        tenant_id: *tenant_id,
        agent_id,
        conversation_id: *conversation_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_failure_exhausts_the_retry_budget() {
        assert_eq!(status_after_failure(1), NotificationStatus::Pending);
        assert_eq!(status_after_failure(2), NotificationStatus::Pending);
        assert_eq!(status_after_failure(3), NotificationStatus::Failed);
        assert_eq!(status_after_failure(4), NotificationStatus::Failed);
    }

    #[test]
    fn assigned_event_maps_to_notification() {
        let event = DomainEvent::ConversationAssigned {
            tenant_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            customer_name: "Ada".into(),
            occurred_at: Utc::now(),
        };
        let mapped = notification_for(&event).expect("maps");
        assert_eq!(mapped.kind(), "conversation_assigned");
    }

    #[test]
    fn message_added_does_not_map_directly() {
        let event = DomainEvent::MessageAdded {
            tenant_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender: SenderKind::Customer as i32,
            message_index: 1,
            occurred_at: Utc::now(),
        };
        assert!(notification_for(&event).is_none());
    }

    #[test]
    fn lifecycle_events_fire_workflow_triggers() {
        let started = DomainEvent::ConversationStarted {
            tenant_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            channel: "widget".into(),
            occurred_at: Utc::now(),
        };
        let (kind, conv) = workflow_trigger_for(&started).expect("trigger");
        assert_eq!(kind, TriggerKind::ConversationCreated);
        assert!(conv.is_some());

        let alert = DomainEvent::SystemAlert {
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            title: "t".into(),
            body: "b".into(),
            occurred_at: Utc::now(),
        };
        assert!(workflow_trigger_for(&alert).is_none());
    }
}
