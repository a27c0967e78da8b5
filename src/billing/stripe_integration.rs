use crate::config::StripeConfig;
use crate::shared::error::ServiceError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "https://api.stripe.com/v1";
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct StripeClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StripeSubscriptionStatus {
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Paused,
    Trialing,
    Unpaid,
}

impl StripeSubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::PastDue => "past_due",
            Self::Paused => "paused",
            Self::Trialing => "trialing",
            Self::Unpaid => "unpaid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: StripeSubscriptionStatus,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
}

impl StripeClient {
    pub fn new(cfg: &StripeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.secret_key.clone(),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, ServiceError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(form)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("stripe: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "stripe returned {}: {}",
                status, body
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::Upstream(format!("stripe payload: {}", e)))
    }

    pub async fn create_customer(
        &self,
        email: &str,
        name: &str,
        tenant_id: Uuid,
    ) -> Result<StripeCustomer, ServiceError> {
        self.post_form(
            "/customers",
            &[
                ("email".to_string(), email.to_string()),
                ("name".to_string(), name.to_string()),
                ("metadata[tenant_id]".to_string(), tenant_id.to_string()),
            ],
        )
        .await
    }

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        tenant_id: Uuid,
        plan_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<StripeCheckoutSession, ServiceError> {
        self.post_form(
            "/checkout/sessions",
            &[
                ("customer".to_string(), customer_id.to_string()),
                ("mode".to_string(), "subscription".to_string()),
                ("line_items[0][price]".to_string(), price_id.to_string()),
                ("line_items[0][quantity]".to_string(), "1".to_string()),
                ("success_url".to_string(), success_url.to_string()),
                ("cancel_url".to_string(), cancel_url.to_string()),
                ("metadata[tenant_id]".to_string(), tenant_id.to_string()),
                ("metadata[plan_id]".to_string(), plan_id.to_string()),
                (
                    "subscription_data[metadata][tenant_id]".to_string(),
                    tenant_id.to_string(),
                ),
                (
                    "subscription_data[metadata][plan_id]".to_string(),
                    plan_id.to_string(),
                ),
            ],
        )
        .await
    }

    pub async fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, ServiceError> {
        self.post_form(
            &format!("/subscriptions/{}", subscription_id),
            &[("cancel_at_period_end".to_string(), "true".to_string())],
        )
        .await
    }
}

/// Validates a `Stripe-Signature` header (`t=...,v1=...`) against the raw
/// payload. The caller supplies `now` so the tolerance window is testable.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> Result<(), ServiceError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| ServiceError::Validation("missing timestamp in signature header".into()))?;
    if signatures.is_empty() {
        return Err(ServiceError::Validation(
            "missing v1 signature in header".into(),
        ));
    }
    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(ServiceError::Validation(
            "signature timestamp outside tolerance".into(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::Internal(format!("hmac init: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    if signatures.iter().any(|sig| *sig == expected) {
        Ok(())
    } else {
        Err(ServiceError::Validation("signature mismatch".into()))
    }
}

/// Helper for tests and tooling: produces a header the verifier accepts.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"type":"invoice.paid"}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_060, 300).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let payload = br#"{"type":"invoice.paid"}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000);
        let tampered = br#"{"type":"invoice.voided"}"#;
        assert!(verify_signature(tampered, &header, SECRET, 1_700_000_060, 300).is_err());
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = br#"{}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000 + 600, 300).is_err());
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = br#"{}"#;
        let header = sign_payload(payload, "whsec_other", 1_700_000_000);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_030, 300).is_err());
    }

    #[test]
    fn malformed_header_fails() {
        assert!(verify_signature(b"{}", "garbage", SECRET, 0, 300).is_err());
        assert!(verify_signature(b"{}", "t=123", SECRET, 123, 300).is_err());
    }

    #[tokio::test]
    async fn checkout_session_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/checkout/sessions")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "cs_test_1",
                    "url": "https://checkout.stripe.test/cs_test_1",
                    "customer": "cus_1",
                    "subscription": null,
                    "status": "open"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = StripeClient::new(&crate::config::StripeConfig {
            secret_key: "sk_test".into(),
            webhook_secret: "whsec".into(),
            base_url: Some(server.url()),
        });
        let session = client
            .create_checkout_session(
                "cus_1",
                "price_1",
                Uuid::new_v4(),
                Uuid::new_v4(),
                "https://app.test/ok",
                "https://app.test/cancel",
            )
            .await
            .unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert!(session.url.unwrap().contains("checkout"));
    }
}
