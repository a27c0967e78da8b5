use crate::config::AppConfig;
use crate::llm::LLMProvider;
use crate::shared::events::DomainEvent;
use crate::shared::hub::HubRegistry;
use crate::shared::utils::DbPool;
use governor::DefaultKeyedRateLimiter;
use redis::Client as RedisClient;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type TenantRateLimiter = DefaultKeyedRateLimiter<Uuid>;

pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub cache: Option<Arc<RedisClient>>,
    pub llm_provider: Arc<dyn LLMProvider>,
    pub hub: Arc<HubRegistry>,
    pub events_tx: mpsc::UnboundedSender<DomainEvent>,
    pub ai_limiter: Arc<TenantRateLimiter>,
}

impl AppState {
    /// Fire-and-forget domain event publication. A closed bus only happens
    /// during shutdown, so a failed send is logged and dropped.
    pub fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events_tx.send(event) {
            log::warn!("event bus closed, dropping event: {}", e);
        }
    }
}
