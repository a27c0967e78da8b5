pub mod analytics;
pub mod api_router;
pub mod attendance;
pub mod auth;
pub mod billing;
pub mod chat;
pub mod config;
pub mod directory;
pub mod kb;
pub mod llm;
pub mod notifications;
pub mod shared;
pub mod workflows;
