use crate::auth::decode_token;
use crate::shared::error::ServiceError;
use crate::shared::models::Role;
use crate::shared::state::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;
use uuid::Uuid;

/// The acting principal, resolved from the bearer token once per request and
/// passed explicitly into every service call. There is no ambient tenant
/// state anywhere in the process.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: Role,
}

impl TenantContext {
    pub fn require_tenant_admin(&self) -> Result<(), ServiceError> {
        if self.role.can_manage_tenant() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden)
        }
    }

    pub fn require_agent(&self) -> Result<(), ServiceError> {
        if self.role.can_handle_conversations() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden)
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for TenantContext {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServiceError::Unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ServiceError::Unauthorized)?;

        let claims = decode_token(token, &state.config.auth)?;
        let role = Role::parse(&claims.role).ok_or(ServiceError::Unauthorized)?;

        Ok(TenantContext {
            user_id: claims.sub,
            tenant_id: claims.tenant,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_gates() {
        let ctx = TenantContext {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: Role::Agent,
        };
        assert!(ctx.require_agent().is_ok());
        assert!(ctx.require_tenant_admin().is_err());

        let admin = TenantContext {
            role: Role::TenantAdmin,
            ..ctx
        };
        assert!(admin.require_tenant_admin().is_ok());
    }
}
