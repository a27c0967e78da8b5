use crate::config::AuthConfig;
use crate::shared::error::ServiceError;
use crate::shared::models::schema::{tenants, user_tenants, users};
use crate::shared::models::{Role, TenantStatus, User};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub tenant: Uuid,
    pub role: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(
    user_id: Uuid,
    tenant_id: Uuid,
    role: Role,
    cfg: &AuthConfig,
) -> Result<String, ServiceError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        tenant: tenant_id,
        role: role.as_str().to_string(),
        iss: cfg.jwt_issuer.clone(),
        aud: cfg.jwt_audience.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(cfg.token_ttl_hours)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
    .map_err(|e| ServiceError::Internal(format!("token encode: {}", e)))
}

pub fn decode_token(token: &str, cfg: &AuthConfig) -> Result<Claims, ServiceError> {
    let mut validation = Validation::default();
    validation.set_issuer(&[&cfg.jwt_issuer]);
    validation.set_audience(&[&cfg.jwt_audience]);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ServiceError::Unauthorized)
}

pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ServiceError::Internal(format!("password hash: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
    /// Creating a tenant at registration makes the caller its TenantAdmin.
    pub tenant_name: Option<String>,
    pub subdomain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub subdomain: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub role: Option<String>,
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
}

fn validate_registration(req: &RegisterRequest) -> Result<(), ServiceError> {
    if !req.email.contains('@') || req.email.len() < 5 {
        return Err(ServiceError::Validation("invalid email address".into()));
    }
    if req.password.len() < 8 {
        return Err(ServiceError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }
    if req.display_name.trim().is_empty() {
        return Err(ServiceError::Validation("display name is required".into()));
    }
    if req.tenant_name.is_some() != req.subdomain.is_some() {
        return Err(ServiceError::Validation(
            "tenant_name and subdomain must be provided together".into(),
        ));
    }
    if let Some(sub) = &req.subdomain {
        if sub.is_empty() || !sub.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
            return Err(ServiceError::Validation(
                "subdomain may only contain lowercase letters, digits and dashes".into(),
            ));
        }
    }
    Ok(())
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ServiceError> {
    validate_registration(&req)?;

    let password_hash = hash_password(&req.password)?;
    let display_name_for_event = req.display_name.clone();
    let conn = state.conn.clone();
    let auth_cfg = state.config.auth.clone();

    let response = run_blocking(move || {
        let mut db = conn.get()?;
        let now = Utc::now();

        db.transaction::<AuthResponse, ServiceError, _>(|db| {
            let user = User {
                id: Uuid::new_v4(),
                email: req.email.to_lowercase(),
                display_name: req.display_name.clone(),
                password_hash,
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(users::table)
                .values(&user)
                .execute(db)
                .map_err(|e| match e {
                    diesel::result::Error::DatabaseError(
                        diesel::result::DatabaseErrorKind::UniqueViolation,
                        _,
                    ) => ServiceError::Conflict("email already registered".into()),
                    other => other.into(),
                })?;

            let (tenant_id, role) = match (&req.tenant_name, &req.subdomain) {
                (Some(name), Some(subdomain)) => {
                    let tenant_id = Uuid::new_v4();
                    diesel::insert_into(tenants::table)
                        .values((
                            tenants::id.eq(tenant_id),
                            tenants::name.eq(name),
                            tenants::subdomain.eq(subdomain),
                            tenants::branding.eq(serde_json::json!({})),
                            tenants::status.eq(TenantStatus::Trial.as_str()),
                            tenants::created_at.eq(now),
                            tenants::updated_at.eq(now),
                        ))
                        .execute(db)
                        .map_err(|e| match e {
                            diesel::result::Error::DatabaseError(
                                diesel::result::DatabaseErrorKind::UniqueViolation,
                                _,
                            ) => ServiceError::Conflict("subdomain already taken".into()),
                            other => other.into(),
                        })?;

                    diesel::insert_into(user_tenants::table)
                        .values((
                            user_tenants::id.eq(Uuid::new_v4()),
                            user_tenants::user_id.eq(user.id),
                            user_tenants::tenant_id.eq(tenant_id),
                            user_tenants::role.eq(Role::TenantAdmin.as_str()),
                            user_tenants::created_at.eq(now),
                        ))
                        .execute(db)?;

                    (Some(tenant_id), Some(Role::TenantAdmin))
                }
                _ => (None, None),
            };

            let token = match (tenant_id, role) {
                (Some(tid), Some(r)) => issue_token(user.id, tid, r, &auth_cfg)?,
                // No membership yet: the token is only useful for login later,
                // so hand back an empty one and let the client log in.
                _ => String::new(),
            };

            Ok(AuthResponse {
                token,
                user_id: user.id,
                tenant_id,
                role: role.map(|r| r.as_str().to_string()),
            })
        })
    })
    .await?;

    info!("registered user {}", response.user_id);

    if let Some(tenant_id) = response.tenant_id {
        state.emit(crate::shared::events::DomainEvent::UserRegistered {
            tenant_id,
            user_id: response.user_id,
            display_name: display_name_for_event,
            occurred_at: Utc::now(),
        });
    }

    Ok(Json(response))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ServiceError> {
    let conn = state.conn.clone();
    let auth_cfg = state.config.auth.clone();

    let response = run_blocking(move || {
        let mut db = conn.get()?;

        let user: User = users::table
            .filter(users::email.eq(req.email.to_lowercase()))
            .filter(users::is_active.eq(true))
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::Unauthorized)?;

        if !verify_password(&req.password, &user.password_hash) {
            return Err(ServiceError::Unauthorized);
        }

        let (tenant_id, tenant_status): (Uuid, String) = tenants::table
            .filter(tenants::subdomain.eq(&req.subdomain))
            .select((tenants::id, tenants::status))
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::Unauthorized)?;

        if TenantStatus::parse(&tenant_status) == Some(TenantStatus::Suspended) {
            return Err(ServiceError::Forbidden);
        }

        let role_str: String = user_tenants::table
            .filter(user_tenants::user_id.eq(user.id))
            .filter(user_tenants::tenant_id.eq(tenant_id))
            .select(user_tenants::role)
            .first(&mut db)
            .optional()?
            .ok_or(ServiceError::Unauthorized)?;

        let role = Role::parse(&role_str).ok_or(ServiceError::Unauthorized)?;
        let token = issue_token(user.id, tenant_id, role, &auth_cfg)?;

        Ok(AuthResponse {
            token,
            user_id: user.id,
            tenant_id: Some(tenant_id),
            role: Some(role_str),
        })
    })
    .await?;

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret-test-secret".into(),
            jwt_issuer: "chatserver".into(),
            jwt_audience: "chatserver-api".into(),
            token_ttl_hours: 1,
        }
    }

    #[test]
    fn token_round_trip() {
        let cfg = test_cfg();
        let user = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let token = issue_token(user, tenant, Role::Agent, &cfg).unwrap();
        let claims = decode_token(&token, &cfg).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.tenant, tenant);
        assert_eq!(claims.role, "agent");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let cfg = test_cfg();
        let token = issue_token(Uuid::new_v4(), Uuid::new_v4(), Role::User, &cfg).unwrap();
        let mut other = test_cfg();
        other.jwt_secret = "another-secret-entirely".into();
        assert!(decode_token(&token, &other).is_err());
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn registration_validation() {
        let base = RegisterRequest {
            email: "a@b.io".into(),
            display_name: "Ada".into(),
            password: "longenough".into(),
            tenant_name: None,
            subdomain: None,
        };
        assert!(validate_registration(&base).is_ok());

        let bad_email = RegisterRequest {
            email: "nope".into(),
            display_name: "Ada".into(),
            password: "longenough".into(),
            tenant_name: None,
            subdomain: None,
        };
        assert!(validate_registration(&bad_email).is_err());

        let short_password = RegisterRequest {
            email: "a@b.io".into(),
            display_name: "Ada".into(),
            password: "short".into(),
            tenant_name: None,
            subdomain: None,
        };
        assert!(validate_registration(&short_password).is_err());

        let bad_subdomain = RegisterRequest {
            email: "a@b.io".into(),
            display_name: "Ada".into(),
            password: "longenough".into(),
            tenant_name: Some("Acme".into()),
            subdomain: Some("Not Valid".into()),
        };
        assert!(validate_registration(&bad_subdomain).is_err());

        let mismatched = RegisterRequest {
            email: "a@b.io".into(),
            display_name: "Ada".into(),
            password: "longenough".into(),
            tenant_name: Some("Acme".into()),
            subdomain: None,
        };
        assert!(validate_registration(&mismatched).is_err());
    }
}
