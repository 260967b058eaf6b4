use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::adapters::CheckoutMetadata;
use super::models::{Plan, Subscription, SubscriptionStatus};
use super::reconciliation::{NotifyPolicy, ReconcileOutcome, Reconciliation};
use super::service::BillingService;
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::TenantAuth;
use crate::tenants::{BindToken, TenantDirectory};

/// key: billing-api -> dashboard endpoints
pub async fn list_plans(Extension(billing): Extension<BillingService>) -> AppResult<Json<Vec<Plan>>> {
    Ok(Json(billing.active_plans().await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionStatusResponse {
    pub status: SubscriptionStatus,
    pub tenant_id: i64,
    pub plan_id: Option<i64>,
    pub paid_until: Option<DateTime<Utc>>,
    pub is_trial: bool,
    pub auto_renew: bool,
    pub is_usable: bool,
}

impl SubscriptionStatusResponse {
    fn from_subscription(subscription: &Subscription, now: DateTime<Utc>) -> Self {
        Self {
            status: subscription.status,
            tenant_id: subscription.tenant_id,
            plan_id: subscription.plan_id,
            paid_until: subscription.paid_until,
            is_trial: subscription.is_trial,
            auto_renew: subscription.auto_renew,
            is_usable: subscription.is_usable(now),
        }
    }
}

/// Pull path for the dashboard: reconciles the newest pending payment first.
pub async fn subscription_status(
    Extension(reconciliation): Extension<Reconciliation>,
    auth: TenantAuth,
) -> AppResult<Json<SubscriptionStatusResponse>> {
    if let Some(ReconcileOutcome::Unavailable(reason)) =
        reconciliation.refresh_latest(auth.tenant_id).await?
    {
        warn!(tenant_id = auth.tenant_id, %reason, "status view served without gateway refresh");
    }
    let now = Utc::now();
    let subscription = reconciliation
        .billing()
        .subscription_for(auth.tenant_id, now)
        .await?;
    Ok(Json(SubscriptionStatusResponse::from_subscription(
        &subscription,
        now,
    )))
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub plan_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    pub ok: bool,
    pub plan: Plan,
    pub payment_id: i64,
    pub gateway_payment_id: String,
    pub metadata: CheckoutMetadata,
    pub confirmation_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn create_payment(
    Extension(billing): Extension<BillingService>,
    auth: TenantAuth,
    Json(payload): Json<CreatePaymentRequest>,
) -> AppResult<Json<CreatePaymentResponse>> {
    let outcome = billing
        .create_checkout(auth.tenant_id, payload.plan_id)
        .await?;
    let message = outcome.confirmation_url.is_none().then(|| {
        "Payment confirmation is unavailable right now; check the payment status later.".to_string()
    });
    Ok(Json(CreatePaymentResponse {
        ok: outcome.confirmation_url.is_some(),
        plan: outcome.plan,
        payment_id: outcome.payment.id,
        gateway_payment_id: outcome.payment.gateway_payment_id,
        metadata: outcome.metadata,
        confirmation_url: outcome.confirmation_url,
        message,
    }))
}

#[derive(Debug, Serialize)]
pub struct PaymentCheckResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub async fn check_payment(
    Extension(reconciliation): Extension<Reconciliation>,
    auth: TenantAuth,
    Path(payment_id): Path<i64>,
) -> AppResult<Json<PaymentCheckResponse>> {
    let outcome = reconciliation
        .check_payment(auth.tenant_id, payment_id, NotifyPolicy::Notify)
        .await?;
    let status = outcome.label();
    let (subscription, detail) = match outcome {
        ReconcileOutcome::NotFound => return Err(AppError::NotFound),
        ReconcileOutcome::Succeeded(subscription) => (Some(subscription), None),
        ReconcileOutcome::AlreadyProcessed(subscription) => (subscription, None),
        ReconcileOutcome::Unavailable(reason) => (None, Some(reason)),
        ReconcileOutcome::Canceled | ReconcileOutcome::Pending | ReconcileOutcome::Ignored => {
            (None, None)
        }
    };
    Ok(Json(PaymentCheckResponse {
        status,
        subscription,
        detail,
    }))
}

/// The "has active subscription" gate: 204 when usable, 402 otherwise.
pub async fn access(
    Extension(billing): Extension<BillingService>,
    auth: TenantAuth,
) -> AppResult<StatusCode> {
    if billing
        .has_active_subscription(auth.tenant_id, Utc::now())
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::PaymentRequired)
    }
}

#[derive(Debug, Serialize)]
pub struct BindTokenResponse {
    pub token: String,
    pub deep_link: Option<String>,
    pub expires_in: i64,
}

/// Issues the payload for the dashboard's "Connect Telegram" button.
pub async fn issue_bind_token(
    Extension(directory): Extension<TenantDirectory>,
    auth: TenantAuth,
) -> AppResult<Json<BindTokenResponse>> {
    let tenant = directory
        .find_by_id(auth.tenant_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let token = BindToken::issue(
        tenant.id,
        &tenant.api_key,
        config::BIND_TOKEN_SECRET.as_str(),
        Utc::now().timestamp(),
    );
    let deep_link = config::TELEGRAM_BOT_USERNAME
        .as_deref()
        .map(|username| format!("https://t.me/{username}?start={token}"));
    Ok(Json(BindTokenResponse {
        token,
        deep_link,
        expires_in: *config::BIND_TOKEN_MAX_AGE_SECS,
    }))
}
