use crate::shared::error::ServiceError;
use crate::shared::models::schema::{plans, subscriptions, usage_records};
use crate::shared::models::{Plan, UsageRecord};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use diesel::prelude::*;
use uuid::Uuid;

// Limits applied when a tenant has no active subscription.
const FREE_CONVERSATIONS_MONTH: i64 = 100;
const FREE_AI_REPLIES_MONTH: i64 = 500;
const FREE_DOCUMENTS: i64 = 20;

const AI_REPLIES_PER_CONVERSATION_QUOTA: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Conversations,
    AiReplies,
    Documents,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::AiReplies => "ai_replies",
            Self::Documents => "documents",
        }
    }
}

/// Usage buckets are calendar months, UTC.
pub fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub fn record_usage(
    db: &mut PgConnection,
    tenant_id: Uuid,
    metric: Metric,
) -> Result<(), ServiceError> {
    let period = period_start(Utc::now());

    let bumped = diesel::update(
        usage_records::table
            .filter(usage_records::tenant_id.eq(tenant_id))
            .filter(usage_records::metric.eq(metric.as_str()))
            .filter(usage_records::period_start.eq(period)),
    )
    .set(usage_records::quantity.eq(usage_records::quantity + 1))
    .execute(db)?;

    if bumped == 0 {
        let row = UsageRecord {
            id: Uuid::new_v4(),
            tenant_id,
            metric: metric.as_str().to_string(),
            quantity: 1,
            period_start: period,
        };
        let inserted = diesel::insert_into(usage_records::table)
            .values(&row)
            .on_conflict((
                usage_records::tenant_id,
                usage_records::metric,
                usage_records::period_start,
            ))
            .do_nothing()
            .execute(db)?;
        // Lost the insert race: the row exists now, bump it.
        if inserted == 0 {
            diesel::update(
                usage_records::table
                    .filter(usage_records::tenant_id.eq(tenant_id))
                    .filter(usage_records::metric.eq(metric.as_str()))
                    .filter(usage_records::period_start.eq(period)),
            )
            .set(usage_records::quantity.eq(usage_records::quantity + 1))
            .execute(db)?;
        }
    }
    Ok(())
}

pub fn current_usage(
    db: &mut PgConnection,
    tenant_id: Uuid,
    metric: Metric,
) -> Result<i64, ServiceError> {
    let period = period_start(Utc::now());
    let quantity: Option<i64> = usage_records::table
        .filter(usage_records::tenant_id.eq(tenant_id))
        .filter(usage_records::metric.eq(metric.as_str()))
        .filter(usage_records::period_start.eq(period))
        .select(usage_records::quantity)
        .first(db)
        .optional()?;
    Ok(quantity.unwrap_or(0))
}

pub fn active_plan(
    db: &mut PgConnection,
    tenant_id: Uuid,
) -> Result<Option<Plan>, ServiceError> {
    let plan: Option<Plan> = subscriptions::table
        .inner_join(plans::table)
        .filter(subscriptions::tenant_id.eq(tenant_id))
        .filter(subscriptions::status.eq_any(["active", "trialing"]))
        .select(Plan::as_select())
        .first(db)
        .optional()?;
    Ok(plan)
}

pub fn quota_for(plan: Option<&Plan>, metric: Metric) -> i64 {
    match (plan, metric) {
        (Some(p), Metric::Conversations) => p.max_conversations_month as i64,
        (Some(p), Metric::AiReplies) => {
            p.max_conversations_month as i64 * AI_REPLIES_PER_CONVERSATION_QUOTA
        }
        (Some(p), Metric::Documents) => p.max_documents as i64,
        (None, Metric::Conversations) => FREE_CONVERSATIONS_MONTH,
        (None, Metric::AiReplies) => FREE_AI_REPLIES_MONTH,
        (None, Metric::Documents) => FREE_DOCUMENTS,
    }
}

/// Gate applied before metered operations. Over-quota reads as Conflict so
/// clients can distinguish it from validation problems.
pub fn check_quota(
    db: &mut PgConnection,
    tenant_id: Uuid,
    metric: Metric,
) -> Result<(), ServiceError> {
    let plan = active_plan(db, tenant_id)?;
    let quota = quota_for(plan.as_ref(), metric);
    let used = current_usage(db, tenant_id, metric)?;
    if used >= quota {
        return Err(ServiceError::Conflict(format!(
            "monthly {} quota of {} exhausted",
            metric.as_str(),
            quota
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(conversations: i32, documents: i32) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "growth".into(),
            price_cents: 4900,
            max_agents: 10,
            max_conversations_month: conversations,
            max_documents: documents,
            stripe_price_id: Some("price_123".into()),
        }
    }

    #[test]
    fn period_start_is_first_of_month() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 14, 30, 5).unwrap();
        let start = period_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn quotas_follow_the_plan() {
        let p = plan(1000, 50);
        assert_eq!(quota_for(Some(&p), Metric::Conversations), 1000);
        assert_eq!(quota_for(Some(&p), Metric::AiReplies), 10_000);
        assert_eq!(quota_for(Some(&p), Metric::Documents), 50);
    }

    #[test]
    fn free_tier_applies_without_subscription() {
        assert_eq!(quota_for(None, Metric::Conversations), FREE_CONVERSATIONS_MONTH);
        assert_eq!(quota_for(None, Metric::AiReplies), FREE_AI_REPLIES_MONTH);
        assert_eq!(quota_for(None, Metric::Documents), FREE_DOCUMENTS);
    }
}
