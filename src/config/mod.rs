use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache_url: Option<String>,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub stripe: StripeConfig,
    pub smtp: SmtpConfig,
    pub sms_gateway_url: Option<String>,
    pub push_gateway_url: Option<String>,
    pub ai_requests_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn database_url(&self) -> String {
        // DATABASE_URL wins when set, matching local tooling.
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let database = DatabaseConfig {
            username: get_env("TABLES_USERNAME", "chatserver"),
            password: get_env("TABLES_PASSWORD", ""),
            server: get_env("TABLES_SERVER", "localhost"),
            port: env::var("TABLES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: get_env("TABLES_DATABASE", "chatserver"),
        };

        let auth = AuthConfig {
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?,
            jwt_issuer: get_env("JWT_ISSUER", "chatserver"),
            jwt_audience: get_env("JWT_AUDIENCE", "chatserver-api"),
            token_ttl_hours: env::var("JWT_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
        };

        let llm = LlmConfig {
            provider: get_env("LLM_PROVIDER", "openai"),
            api_key: get_env("LLM_API_KEY", ""),
            base_url: env::var("LLM_BASE_URL").ok(),
            model: get_env("LLM_MODEL", "gpt-4o-mini"),
        };

        let stripe = StripeConfig {
            secret_key: get_env("STRIPE_SECRET_KEY", ""),
            webhook_secret: get_env("STRIPE_WEBHOOK_SECRET", ""),
            base_url: env::var("STRIPE_BASE_URL").ok(),
        };

        let smtp = SmtpConfig {
            host: get_env("SMTP_HOST", "localhost"),
            username: get_env("SMTP_USERNAME", ""),
            password: get_env("SMTP_PASSWORD", ""),
            from_address: get_env("SMTP_FROM", "no-reply@chatserver.local"),
        };

        Ok(Self {
            server: ServerConfig {
                host: get_env("SERVER_HOST", "0.0.0.0"),
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            database,
            cache_url: env::var("CACHE_URL").or_else(|_| env::var("REDIS_URL")).ok(),
            auth,
            llm,
            stripe,
            smtp,
            sms_gateway_url: env::var("SMS_GATEWAY_URL").ok(),
            push_gateway_url: env::var("PUSH_GATEWAY_URL").ok(),
            ai_requests_per_minute: env::var("AI_REQUESTS_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        })
    }
}
