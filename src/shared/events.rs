use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain events emitted by the chat and attendance services and consumed by
/// the notification dispatcher, analytics ingestion and workflow triggers.
/// One closed set of variants; every consumer matches exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ConversationStarted {
        tenant_id: Uuid,
        conversation_id: Uuid,
        channel: String,
        occurred_at: DateTime<Utc>,
    },
    MessageAdded {
        tenant_id: Uuid,
        conversation_id: Uuid,
        sender: i32,
        message_index: i64,
        occurred_at: DateTime<Utc>,
    },
    ConversationAssigned {
        tenant_id: Uuid,
        conversation_id: Uuid,
        agent_id: Uuid,
        customer_name: String,
        occurred_at: DateTime<Utc>,
    },
    ConversationEscalated {
        tenant_id: Uuid,
        conversation_id: Uuid,
        from_agent_id: Option<Uuid>,
        to_agent_id: Option<Uuid>,
        reason: String,
        seconds_before_escalation: i64,
        occurred_at: DateTime<Utc>,
    },
    ConversationResolved {
        tenant_id: Uuid,
        conversation_id: Uuid,
        agent_id: Option<Uuid>,
        occurred_at: DateTime<Utc>,
    },
    SystemAlert {
        tenant_id: Uuid,
        user_id: Uuid,
        title: String,
        body: String,
        occurred_at: DateTime<Utc>,
    },
    UserRegistered {
        tenant_id: Uuid,
        user_id: Uuid,
        display_name: String,
        occurred_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn tenant_id(&self) -> Uuid {
        match self {
            Self::ConversationStarted { tenant_id, .. }
            | Self::MessageAdded { tenant_id, .. }
            | Self::ConversationAssigned { tenant_id, .. }
            | Self::ConversationEscalated { tenant_id, .. }
            | Self::ConversationResolved { tenant_id, .. }
            | Self::SystemAlert { tenant_id, .. }
            | Self::UserRegistered { tenant_id, .. } => *tenant_id,
        }
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::ConversationStarted {
                conversation_id, ..
            }
            | Self::MessageAdded {
                conversation_id, ..
            }
            | Self::ConversationAssigned {
                conversation_id, ..
            }
            | Self::ConversationEscalated {
                conversation_id, ..
            }
            | Self::ConversationResolved {
                conversation_id, ..
            } => Some(*conversation_id),
            Self::SystemAlert { .. } | Self::UserRegistered { .. } => None,
        }
    }

    /// Analytics event_type for the ingestion table.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConversationStarted { .. } => "conversation_started",
            Self::MessageAdded { .. } => "message_added",
            Self::ConversationAssigned { .. } => "conversation_assigned",
            Self::ConversationEscalated { .. } => "conversation_escalated",
            Self::ConversationResolved { .. } => "conversation_resolved",
            Self::SystemAlert { .. } => "system_alert",
            Self::UserRegistered { .. } => "user_registered",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_is_stable() {
        let ev = DomainEvent::ConversationAssigned {
            tenant_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            customer_name: "Ada".into(),
            occurred_at: Utc::now(),
        };
        assert_eq!(ev.event_type(), "conversation_assigned");
        assert!(ev.conversation_id().is_some());
    }
}
