//! End-to-end exercises of the routing core against a real database.
//! Every test no-ops when DATABASE_URL is unreachable so the suite stays
//! green on machines without Postgres.

use chatserver::attendance::queue;
use chatserver::chat::append_message;
use chatserver::shared::error::ServiceError;
use chatserver::shared::models::schema::{agent_status, conversations, tenants, users};
use chatserver::shared::models::{
    AgentStatus, Conversation, SenderKind, Tenant, User,
};
use chatserver::shared::utils::{create_conn, DbPool};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use uuid::Uuid;

fn test_pool() -> Option<DbPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = create_conn(&url).ok()?;
    // Probe once so individual tests can just unwrap.
    pool.get().ok()?;
    Some(pool)
}

fn seed_tenant(db: &mut PgConnection) -> Uuid {
    let now = Utc::now();
    let tenant = Tenant {
        id: Uuid::new_v4(),
        name: "Test Tenant".into(),
        subdomain: format!("t-{}", Uuid::new_v4().simple()),
        branding: serde_json::json!({}),
        status: "active".into(),
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(tenants::table)
        .values(&tenant)
        .execute(db)
        .expect("insert tenant");
    tenant.id
}

fn seed_agent(db: &mut PgConnection, tenant_id: Uuid, active: i32, max: i32) -> Uuid {
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        email: format!("{}@example.test", Uuid::new_v4().simple()),
        display_name: "Agent".into(),
        password_hash: "x".into(),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(users::table)
        .values(&user)
        .execute(db)
        .expect("insert user");

    let status = AgentStatus {
        id: Uuid::new_v4(),
        user_id: user.id,
        tenant_id,
        availability: "online".into(),
        department: None,
        language: None,
        active_conversations: active,
        max_conversations: max,
        last_activity: now - Duration::minutes(5),
    };
    diesel::insert_into(agent_status::table)
        .values(&status)
        .execute(db)
        .expect("insert agent status");
    user.id
}

fn seed_conversation(db: &mut PgConnection, tenant_id: Uuid, priority: i32) -> Uuid {
    let now = Utc::now();
    let conversation = Conversation {
        id: Uuid::new_v4(),
        tenant_id,
        customer_name: "Customer".into(),
        customer_email: None,
        channel: "widget".into(),
        status: "queued".into(),
        priority,
        department: None,
        language: None,
        assigned_agent_id: None,
        queued_at: Some(now),
        assigned_at: None,
        resolved_at: None,
        escalation_reason: None,
        satisfaction_rating: None,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(conversations::table)
        .values(&conversation)
        .execute(db)
        .expect("insert conversation");
    conversation.id
}

#[test]
fn assignment_at_capacity_is_a_conflict_and_mutates_nothing() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };
    let mut db = pool.get().unwrap();

    let tenant = seed_tenant(&mut db);
    let agent = seed_agent(&mut db, tenant, 5, 5);
    let conversation = seed_conversation(&mut db, tenant, 1);

    let result = queue::assign_conversation(&mut db, tenant, conversation, agent);
    assert!(matches!(result, Err(ServiceError::Conflict(_))));

    let status: String = conversations::table
        .filter(conversations::id.eq(conversation))
        .select(conversations::status)
        .first(&mut db)
        .unwrap();
    assert_eq!(status, "queued");

    let active: i32 = agent_status::table
        .filter(agent_status::user_id.eq(agent))
        .select(agent_status::active_conversations)
        .first(&mut db)
        .unwrap();
    assert_eq!(active, 5);
}

#[test]
fn unknown_agent_is_not_found() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };
    let mut db = pool.get().unwrap();

    let tenant = seed_tenant(&mut db);
    let conversation = seed_conversation(&mut db, tenant, 1);

    let result = queue::assign_conversation(&mut db, tenant, conversation, Uuid::new_v4());
    assert!(matches!(result, Err(ServiceError::NotFound)));
}

#[test]
fn racing_assignments_let_exactly_one_win() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };

    let (tenant, conversation, agent_a, agent_b) = {
        let mut db = pool.get().unwrap();
        let tenant = seed_tenant(&mut db);
        let conversation = seed_conversation(&mut db, tenant, 1);
        let agent_a = seed_agent(&mut db, tenant, 0, 5);
        let agent_b = seed_agent(&mut db, tenant, 0, 5);
        (tenant, conversation, agent_a, agent_b)
    };

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let t1 = std::thread::spawn(move || {
        let mut db = pool_a.get().unwrap();
        queue::assign_conversation(&mut db, tenant, conversation, agent_a)
    });
    let t2 = std::thread::spawn(move || {
        let mut db = pool_b.get().unwrap();
        queue::assign_conversation(&mut db, tenant, conversation, agent_b)
    });

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();
    assert_eq!(
        r1.is_ok() as u8 + r2.is_ok() as u8,
        1,
        "exactly one racer must win: {:?} / {:?}",
        r1.as_ref().map(|c| c.id),
        r2.as_ref().map(|c| c.id)
    );

    let mut db = pool.get().unwrap();
    let assigned: Option<Uuid> = conversations::table
        .filter(conversations::id.eq(conversation))
        .select(conversations::assigned_agent_id)
        .first(&mut db)
        .unwrap();
    assert!(assigned.is_some());

    // The loser's counter must have rolled back.
    let total_active: i64 = agent_status::table
        .filter(agent_status::tenant_id.eq(tenant))
        .select(diesel::dsl::sum(agent_status::active_conversations))
        .first::<Option<i64>>(&mut db)
        .unwrap()
        .unwrap_or(0);
    assert_eq!(total_active, 1);
}

#[test]
fn routing_prefers_least_loaded_then_parks_when_saturated() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };
    let mut db = pool.get().unwrap();

    let tenant = seed_tenant(&mut db);
    let light = seed_agent(&mut db, tenant, 0, 1);
    let _busy = seed_agent(&mut db, tenant, 4, 5);

    let first = seed_conversation(&mut db, tenant, 1);
    let outcome = queue::route_conversation(&mut db, tenant, first).unwrap();
    assert_eq!(outcome.outcome, "assigned");
    assert_eq!(outcome.agent_id, Some(light));

    // light is now full and busy has the only slots left.
    let second = seed_conversation(&mut db, tenant, 1);
    let outcome = queue::route_conversation(&mut db, tenant, second).unwrap();
    assert_eq!(outcome.outcome, "assigned");
    assert_ne!(outcome.agent_id, Some(light));
}

#[test]
fn queue_positions_follow_priority_then_age() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };
    let mut db = pool.get().unwrap();

    let tenant = seed_tenant(&mut db);
    let normal_early = seed_conversation(&mut db, tenant, 1);
    diesel::update(conversations::table.filter(conversations::id.eq(normal_early)))
        .set(conversations::queued_at.eq(Some(Utc::now() - Duration::minutes(5))))
        .execute(&mut db)
        .unwrap();
    let high_late = seed_conversation(&mut db, tenant, 2);

    let snapshot = queue::queue_snapshot(&mut db, tenant).unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].conversation_id, high_late);
    assert_eq!(snapshot[0].position, 1);
    assert_eq!(snapshot[1].conversation_id, normal_early);
    assert_eq!(snapshot[1].position, 2);
    assert!(snapshot[1].waiting_seconds >= 290);
}

#[test]
fn message_indices_stay_dense_and_ordered() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };
    let mut db = pool.get().unwrap();

    let tenant = seed_tenant(&mut db);
    let conversation = seed_conversation(&mut db, tenant, 1);
    // seed_conversation parks it queued; appending is legal in any
    // non-terminal state.
    for (i, text) in ["hello", "anyone there?", "hi, agent here"].iter().enumerate() {
        let sender = if i == 2 {
            SenderKind::Agent
        } else {
            SenderKind::Customer
        };
        append_message(&mut db, tenant, conversation, sender, text, 0).unwrap();
    }

    use chatserver::shared::models::schema::messages;
    let rows: Vec<(i64, chrono::DateTime<Utc>)> = messages::table
        .filter(messages::conversation_id.eq(conversation))
        .order(messages::message_index.asc())
        .select((messages::message_index, messages::created_at))
        .load(&mut db)
        .unwrap();

    assert_eq!(rows.len(), 3);
    for (expected, (index, _)) in rows.iter().enumerate() {
        assert_eq!(*index, expected as i64);
    }
    for pair in rows.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "created_at must be non-decreasing");
    }
}

#[test]
fn escalation_moves_load_between_agents() {
    let Some(pool) = test_pool() else {
        println!("skipping test - database not available");
        return;
    };
    let mut db = pool.get().unwrap();

    let tenant = seed_tenant(&mut db);
    let original = seed_agent(&mut db, tenant, 0, 5);
    let target = seed_agent(&mut db, tenant, 0, 5);
    let conversation = seed_conversation(&mut db, tenant, 1);

    queue::assign_conversation(&mut db, tenant, conversation, original).unwrap();

    let request = queue::EscalateRequest {
        conversation_id: conversation,
        to_agent_id: Some(target),
        department: None,
        reason: "needs a specialist".into(),
    };
    let (updated, from_agent, _seconds) =
        queue::escalate_conversation(&mut db, tenant, &request).unwrap();

    assert_eq!(from_agent, Some(original));
    assert_eq!(updated.assigned_agent_id, Some(target));
    assert_eq!(updated.escalation_reason.as_deref(), Some("needs a specialist"));

    let original_active: i32 = agent_status::table
        .filter(agent_status::user_id.eq(original))
        .select(agent_status::active_conversations)
        .first(&mut db)
        .unwrap();
    let target_active: i32 = agent_status::table
        .filter(agent_status::user_id.eq(target))
        .select(agent_status::active_conversations)
        .first(&mut db)
        .unwrap();
    assert_eq!(original_active, 0);
    assert_eq!(target_active, 1);
}
