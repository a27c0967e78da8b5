use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Trial,
    Expired,
    Cancelled,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Trial => "trial",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "trial" => Some(Self::Trial),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    TenantAdmin,
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::TenantAdmin => "tenant_admin",
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "super_admin" => Some(Self::SuperAdmin),
            "admin" => Some(Self::Admin),
            "tenant_admin" => Some(Self::TenantAdmin),
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    pub fn can_manage_tenant(&self) -> bool {
        matches!(self, Self::SuperAdmin | Self::Admin | Self::TenantAdmin)
    }

    pub fn can_handle_conversations(&self) -> bool {
        matches!(
            self,
            Self::SuperAdmin | Self::Admin | Self::TenantAdmin | Self::Agent
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Online,
    Busy,
    Away,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "busy" => Some(Self::Busy),
            "away" => Some(Self::Away),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Waiting,
    Queued,
    Assigned,
    Resolved,
    Closed,
    Escalated,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "waiting" => Some(Self::Waiting),
            "queued" => Some(Self::Queued),
            "assigned" => Some(Self::Assigned),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Widget,
    Email,
    Sms,
    Whatsapp,
    Facebook,
    Api,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Widget => "widget",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Facebook => "facebook",
            Self::Api => "api",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "widget" => Some(Self::Widget),
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            "whatsapp" => Some(Self::Whatsapp),
            "facebook" => Some(Self::Facebook),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Stored as Int4 so queue ordering can sort on the raw column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    Customer = 0,
    Bot = 1,
    Agent = 2,
    System = 3,
}

impl SenderKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Customer),
            1 => Some(Self::Bot),
            2 => Some(Self::Agent),
            3 => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Processed,
    Failed,
    Archived,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Read,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Scheduled = 0,
    ConversationCreated = 1,
    ConversationEscalated = 2,
    ConversationResolved = 3,
}

impl TriggerKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Scheduled),
            1 => Some(Self::ConversationCreated),
            2 => Some(Self::ConversationEscalated),
            3 => Some(Self::ConversationResolved),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, AsChangeset, Selectable,
)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub branding: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = user_tenants)]
pub struct UserTenant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, AsChangeset, Selectable,
)]
#[diesel(table_name = agent_status)]
pub struct AgentStatus {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub availability: String,
    pub department: Option<String>,
    pub language: Option<String>,
    pub active_conversations: i32,
    pub max_conversations: i32,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub channel: String,
    pub status: String,
    pub priority: i32,
    pub department: Option<String>,
    pub language: Option<String>,
    pub assigned_agent_id: Option<Uuid>,
    pub queued_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalation_reason: Option<String>,
    pub satisfaction_rating: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub sender: i32,
    pub message_type: i32,
    pub content: String,
    pub message_index: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub status: String,
    pub chunk_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = document_chunks)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub channel: String,
    pub status: String,
    pub retry_count: i32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = analytics_events)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, AsChangeset, Selectable,
)]
#[diesel(table_name = plans)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i32,
    pub max_agents: i32,
    pub max_conversations_month: i32,
    pub max_documents: i32,
    pub stripe_price_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = subscriptions)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = usage_records)]
pub struct UsageRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub metric: String,
    pub quantity: i64,
    pub period_start: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, AsChangeset, Selectable,
)]
#[diesel(table_name = workflow_rules)]
pub struct WorkflowRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub trigger_kind: i32,
    pub schedule: Option<String>,
    pub action_kind: String,
    pub action_params: serde_json::Value,
    pub is_active: bool,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub mod schema {
    diesel::table! {
        tenants (id) {
            id -> Uuid,
            name -> Text,
            subdomain -> Text,
            branding -> Jsonb,
            status -> Text,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        users (id) {
            id -> Uuid,
            email -> Text,
            display_name -> Text,
            password_hash -> Text,
            is_active -> Bool,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        user_tenants (id) {
            id -> Uuid,
            user_id -> Uuid,
            tenant_id -> Uuid,
            role -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        agent_status (id) {
            id -> Uuid,
            user_id -> Uuid,
            tenant_id -> Uuid,
            availability -> Text,
            department -> Nullable<Text>,
            language -> Nullable<Text>,
            active_conversations -> Int4,
            max_conversations -> Int4,
            last_activity -> Timestamptz,
        }
    }

    diesel::table! {
        conversations (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            customer_name -> Text,
            customer_email -> Nullable<Text>,
            channel -> Text,
            status -> Text,
            priority -> Int4,
            department -> Nullable<Text>,
            language -> Nullable<Text>,
            assigned_agent_id -> Nullable<Uuid>,
            queued_at -> Nullable<Timestamptz>,
            assigned_at -> Nullable<Timestamptz>,
            resolved_at -> Nullable<Timestamptz>,
            escalation_reason -> Nullable<Text>,
            satisfaction_rating -> Nullable<Int4>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        messages (id) {
            id -> Uuid,
            conversation_id -> Uuid,
            tenant_id -> Uuid,
            sender -> Int4,
            message_type -> Int4,
            content -> Text,
            message_index -> Int8,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        documents (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            file_name -> Text,
            content_type -> Text,
            size_bytes -> Int8,
            status -> Text,
            chunk_count -> Int4,
            error_message -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        document_chunks (id) {
            id -> Uuid,
            document_id -> Uuid,
            tenant_id -> Uuid,
            chunk_index -> Int4,
            content -> Text,
        }
    }

    diesel::table! {
        notifications (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            user_id -> Uuid,
            kind -> Text,
            title -> Text,
            body -> Text,
            channel -> Text,
            status -> Text,
            retry_count -> Int4,
            delivered_at -> Nullable<Timestamptz>,
            read_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        analytics_events (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            event_type -> Text,
            conversation_id -> Nullable<Uuid>,
            user_id -> Nullable<Uuid>,
            payload -> Jsonb,
            occurred_at -> Timestamptz,
        }
    }

    diesel::table! {
        plans (id) {
            id -> Uuid,
            name -> Text,
            price_cents -> Int4,
            max_agents -> Int4,
            max_conversations_month -> Int4,
            max_documents -> Int4,
            stripe_price_id -> Nullable<Text>,
        }
    }

    diesel::table! {
        subscriptions (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            plan_id -> Uuid,
            stripe_subscription_id -> Nullable<Text>,
            status -> Text,
            current_period_start -> Timestamptz,
            current_period_end -> Timestamptz,
            cancel_at_period_end -> Bool,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        usage_records (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            metric -> Text,
            quantity -> Int8,
            period_start -> Timestamptz,
        }
    }

    diesel::table! {
        workflow_rules (id) {
            id -> Uuid,
            tenant_id -> Uuid,
            name -> Text,
            trigger_kind -> Int4,
            schedule -> Nullable<Text>,
            action_kind -> Text,
            action_params -> Jsonb,
            is_active -> Bool,
            last_triggered -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
        }
    }

    diesel::joinable!(user_tenants -> users (user_id));
    diesel::joinable!(user_tenants -> tenants (tenant_id));
    diesel::joinable!(agent_status -> users (user_id));
    diesel::joinable!(messages -> conversations (conversation_id));
    diesel::joinable!(document_chunks -> documents (document_id));
    diesel::joinable!(subscriptions -> plans (plan_id));

    diesel::allow_tables_to_appear_in_same_query!(
        tenants,
        users,
        user_tenants,
        agent_status,
        conversations,
        messages,
        documents,
        document_chunks,
        notifications,
        analytics_events,
        plans,
        subscriptions,
        usage_records,
        workflow_rules,
    );
}

pub use schema::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            ConversationStatus::Active,
            ConversationStatus::Waiting,
            ConversationStatus::Queued,
            ConversationStatus::Assigned,
            ConversationStatus::Resolved,
            ConversationStatus::Closed,
            ConversationStatus::Escalated,
        ] {
            assert_eq!(ConversationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ConversationStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(ConversationStatus::Resolved.is_terminal());
        assert!(ConversationStatus::Closed.is_terminal());
        assert!(!ConversationStatus::Queued.is_terminal());
        assert!(!ConversationStatus::Escalated.is_terminal());
    }

    #[test]
    fn priority_ordering_matches_raw_values() {
        assert!(Priority::Urgent as i32 > Priority::High as i32);
        assert!(Priority::High as i32 > Priority::Normal as i32);
        assert!(Priority::Normal as i32 > Priority::Low as i32);
        assert_eq!(Priority::from_i32(7), None);
    }

    #[test]
    fn sender_kind_codes() {
        assert_eq!(SenderKind::from_i32(0), Some(SenderKind::Customer));
        assert_eq!(SenderKind::from_i32(1), Some(SenderKind::Bot));
        assert_eq!(SenderKind::from_i32(2), Some(SenderKind::Agent));
        assert_eq!(SenderKind::from_i32(3), Some(SenderKind::System));
        assert_eq!(SenderKind::from_i32(9), None);
    }
}
