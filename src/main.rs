use chatserver::api_router::configure_api_routes;
use chatserver::config::AppConfig;
use chatserver::llm::provider_from_config;
use chatserver::notifications::dispatch::Dispatcher;
use chatserver::shared::hub::HubRegistry;
use chatserver::shared::state::AppState;
use chatserver::shared::utils::create_conn;
use chatserver::workflows::WorkflowService;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use dotenvy::dotenv;
use governor::{Quota, RateLimiter};
use log::{error, info, warn};
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("config: {}", e))
    })?;

    let pool = match create_conn(&config.database_url()) {
        Ok(pool) => pool,
        Err(e) => {
            error!("failed to create database pool: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("database pool creation failed: {}", e),
            ));
        }
    };

    {
        let mut conn = pool.get().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("database connection failed: {}", e),
            )
        })?;
        conn.run_pending_migrations(MIGRATIONS).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, format!("migrations failed: {}", e))
        })?;
        info!("database migrations applied");
    }

    let cache = match &config.cache_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("failed to connect to cache: {}", e);
                None
            }
        },
        None => None,
    };

    let llm_provider = provider_from_config(&config.llm);
    info!("llm provider: {}", llm_provider.name());

    let per_minute = NonZeroU32::new(config.ai_requests_per_minute.max(1))
        .unwrap_or_else(|| NonZeroU32::new(60).expect("nonzero"));
    let ai_limiter = Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)));

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

    let app_state = Arc::new(AppState {
        config: config.clone(),
        conn: pool,
        cache,
        llm_provider,
        hub: Arc::new(HubRegistry::new()),
        events_tx,
        ai_limiter,
    });

    // Background workers: event dispatcher, notification retry sweep,
    // scheduled workflows. None of them touch request threads.
    let dispatcher = Arc::new(Dispatcher::new(app_state.clone()));
    tokio::spawn(dispatcher.clone().run(events_rx));
    tokio::spawn(dispatcher.run_retry_worker());
    tokio::spawn(WorkflowService::new(app_state.clone()).spawn());

    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await?;
    info!(
        "starting HTTP server on {}:{}",
        config.server.host, config.server.port
    );

    let app = configure_api_routes()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state.clone());

    axum::serve(listener, app).await
}
