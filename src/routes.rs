use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/subscription/plans", get(billing::billing_list_plans))
        .route(
            "/api/subscription/status",
            get(billing::billing_subscription_status),
        )
        .route(
            "/api/subscription/payments",
            post(billing::billing_create_payment),
        )
        .route(
            "/api/subscription/payments/:id/check",
            post(billing::billing_check_payment),
        )
        .route("/api/subscription/access", get(billing::billing_access))
        .route(
            "/api/telegram/bind-token",
            get(billing::billing_issue_bind_token),
        )
        .merge(webhook_routes())
}

/// Public endpoints called by the payment gateway and the chat provider.
pub fn webhook_routes() -> Router {
    Router::new()
        .route(
            "/api/subscription/webhook",
            post(webhooks::payment_webhook),
        )
        .route("/api/telegram/webhook", post(webhooks::telegram_webhook))
}
