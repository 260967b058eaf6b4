use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::models::PaymentStatus;
use crate::config;

#[derive(Debug, Error)]
pub enum PaymentGatewayError {
    #[error("payment gateway credentials are not configured")]
    NotConfigured,
    #[error("payment gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to decode payment gateway response: {0}")]
    Decode(String),
}

impl PaymentGatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentGatewayError::Transport(_) => true,
            PaymentGatewayError::Http { status, .. } => *status == 429 || *status >= 500,
            PaymentGatewayError::NotConfigured | PaymentGatewayError::Decode(_) => false,
        }
    }
}

/// Metadata round-tripped through the gateway so webhooks can find the local row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    pub tenant_id: String,
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// One key per logical checkout, reused across retries.
    pub idempotence_key: String,
    pub amount_value: String,
    pub currency: String,
    pub description: String,
    pub return_url: String,
    pub metadata: CheckoutMetadata,
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub gateway_payment_id: Option<String>,
    pub status: PaymentStatus,
    pub confirmation_url: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct PaymentSnapshot {
    pub gateway_payment_id: String,
    pub status: PaymentStatus,
    pub raw: Value,
}

/// key: payment-gateway -> black-box checkout + status provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError>;

    async fn get_status(&self, gateway_payment_id: &str)
        -> Result<PaymentSnapshot, PaymentGatewayError>;
}

#[derive(Debug, Deserialize)]
struct GatewayPayment {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    confirmation: Option<GatewayConfirmation>,
}

#[derive(Debug, Deserialize)]
struct GatewayConfirmation {
    #[serde(default)]
    confirmation_url: Option<String>,
}

/// key: payment-gateway-http -> REST client with basic auth and bounded retries
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    shop_id: String,
    secret_key: String,
    attempts: u32,
    base_delay: Duration,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        shop_id: impl Into<String>,
        secret_key: impl Into<String>,
        attempts: u32,
    ) -> Result<Self, PaymentGatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            shop_id: shop_id.into(),
            secret_key: secret_key.into(),
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(500),
        })
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(&self.shop_id, Some(&self.secret_key))
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, PaymentGatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PaymentGatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let delay = self.base_delay * attempt;
                    warn!(?err, attempt, ?delay, operation, "payment gateway call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn read_payment(response: reqwest::Response) -> Result<(GatewayPayment, Value), PaymentGatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PaymentGatewayError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        let raw: Value = serde_json::from_str(&body)
            .map_err(|err| PaymentGatewayError::Decode(err.to_string()))?;
        let payment: GatewayPayment = serde_json::from_value(raw.clone())
            .map_err(|err| PaymentGatewayError::Decode(err.to_string()))?;
        Ok((payment, raw))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError> {
        let payload = json!({
            "amount": {"value": request.amount_value, "currency": request.currency},
            "confirmation": {"type": "redirect", "return_url": request.return_url},
            "capture": true,
            "description": request.description,
            "metadata": request.metadata,
        });

        let payload = &payload;
        let (payment, raw) = self
            .with_retries("create_checkout", move || async move {
                let response = self
                    .auth(self.client.post(self.endpoint("payments")))
                    .header("Idempotence-Key", &request.idempotence_key)
                    .json(&payload)
                    .send()
                    .await?;
                Self::read_payment(response).await
            })
            .await?;

        info!(
            gateway_payment_id = %payment.id,
            status = ?payment.status,
            "payment gateway checkout created"
        );
        Ok(CheckoutSession {
            status: PaymentStatus::from_gateway(payment.status.as_deref().unwrap_or("pending")),
            confirmation_url: payment
                .confirmation
                .and_then(|confirmation| confirmation.confirmation_url)
                .filter(|url| !url.trim().is_empty()),
            gateway_payment_id: Some(payment.id),
            raw,
        })
    }

    async fn get_status(
        &self,
        gateway_payment_id: &str,
    ) -> Result<PaymentSnapshot, PaymentGatewayError> {
        let (payment, raw) = self
            .with_retries("get_status", move || async move {
                let response = self
                    .auth(
                        self.client
                            .get(self.endpoint(&format!("payments/{gateway_payment_id}"))),
                    )
                    .send()
                    .await?;
                Self::read_payment(response).await
            })
            .await?;

        Ok(PaymentSnapshot {
            status: PaymentStatus::from_gateway(payment.status.as_deref().unwrap_or("pending")),
            gateway_payment_id: payment.id,
            raw,
        })
    }
}

/// key: payment-gateway-fallback -> no credentials, static checkout page
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredGateway {
    checkout_url: Option<String>,
}

impl UnconfiguredGateway {
    pub fn new(checkout_url: Option<String>) -> Self {
        Self { checkout_url }
    }
}

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError> {
        let confirmation_url = self.checkout_url.as_deref().and_then(|base| {
            let mut url = Url::parse(base).ok()?;
            url.query_pairs_mut()
                .append_pair("tenant_id", &request.metadata.tenant_id)
                .append_pair("plan_id", &request.metadata.plan_id);
            Some(url.to_string())
        });
        Ok(CheckoutSession {
            gateway_payment_id: None,
            status: PaymentStatus::Pending,
            confirmation_url,
            raw: json!({ "metadata": request.metadata }),
        })
    }

    async fn get_status(
        &self,
        _gateway_payment_id: &str,
    ) -> Result<PaymentSnapshot, PaymentGatewayError> {
        Err(PaymentGatewayError::NotConfigured)
    }
}

/// HTTP gateway when both credentials are set, otherwise the fallback.
pub fn gateway_from_env() -> Result<Arc<dyn PaymentGateway>, PaymentGatewayError> {
    match (
        config::PAYMENT_SHOP_ID.as_deref(),
        config::PAYMENT_SECRET_KEY.as_deref(),
    ) {
        (Some(shop_id), Some(secret_key)) => Ok(Arc::new(HttpPaymentGateway::new(
            config::PAYMENT_GATEWAY_URL.as_str(),
            shop_id,
            secret_key,
            *config::PAYMENT_GATEWAY_ATTEMPTS,
        )?)),
        _ => {
            warn!("payment gateway credentials missing; checkout falls back to static page");
            Ok(Arc::new(UnconfiguredGateway::new(
                config::PAYMENT_CHECKOUT_URL.clone(),
            )))
        }
    }
}
