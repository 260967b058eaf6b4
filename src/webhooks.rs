use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::billing::{BillingError, EventMetadata, GatewayEvent, Reconciliation};
use crate::bot::EventDispatcher;
use crate::config;
use crate::error::{AppError, AppResult};
use crate::ledger::{LedgerEntry, RecordOutcome, UpdateLedger};
use crate::telegram::{deliver_all, ChatGateway, RetryPolicy, Update};

pub const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Pulls the event out of a gateway notification; `Err` means the body is unusable.
pub fn parse_gateway_event(payload: Value) -> Result<Option<GatewayEvent>, String> {
    let Some(object) = payload.as_object() else {
        return Err("payload is not a JSON object".into());
    };
    let event = object
        .get("event")
        .or_else(|| object.get("type"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if !event.starts_with("payment.") {
        return Ok(None);
    }

    let payment = object
        .get("object")
        .map(|inner| inner.get("object").unwrap_or(inner))
        .filter(|inner| inner.is_object())
        .ok_or_else(|| format!("{event} without payment object"))?;
    let gateway_payment_id = payment
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| format!("{event} without payment id"))?
        .to_string();
    let metadata = payment
        .get("metadata")
        .filter(|metadata| metadata.is_object())
        .ok_or_else(|| format!("{event} without metadata"))?;

    Ok(Some(GatewayEvent {
        metadata: EventMetadata::from_value(Some(metadata)),
        event,
        gateway_payment_id,
        payload: payment.clone(),
    }))
}

/// key: webhooks-payment -> push path into reconciliation
pub async fn payment_webhook(
    Extension(reconciliation): Extension<Reconciliation>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let payload: Value = serde_json::from_slice(&body).map_err(|err| {
        warn!(?err, "payment webhook body is not JSON");
        AppError::BadRequest("invalid JSON".into())
    })?;
    let event = match parse_gateway_event(payload) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(Json(json!({"status": "ignored"}))),
        Err(reason) => {
            warn!(%reason, "payment webhook rejected");
            return Err(AppError::BadRequest(reason));
        }
    };

    match reconciliation.handle_gateway_event(&event).await {
        Ok(outcome) => {
            info!(
                event = %event.event,
                gateway_payment_id = %event.gateway_payment_id,
                outcome = outcome.label(),
                "payment webhook handled"
            );
            Ok(Json(json!({"status": outcome.label()})))
        }
        Err(err @ (BillingError::TenantMismatch { .. } | BillingError::PlanUnresolved { .. })) => {
            error!(?err, gateway_payment_id = %event.gateway_payment_id, "payment webhook rejected");
            Ok(Json(json!({"status": "rejected"})))
        }
        Err(err) => Err(err.into()),
    }
}

/// Everything the bot webhook intake needs to record and dispatch an update.
#[derive(Clone)]
pub struct TelegramIntake {
    pub secret: Option<String>,
    pub ledger: Arc<dyn UpdateLedger>,
    pub dispatcher: Arc<dyn EventDispatcher>,
    pub gateway: Option<Arc<dyn ChatGateway>>,
    pub retry: RetryPolicy,
    pub dispatch_timeout: Duration,
}

impl TelegramIntake {
    pub fn new(
        ledger: Arc<dyn UpdateLedger>,
        dispatcher: Arc<dyn EventDispatcher>,
        gateway: Option<Arc<dyn ChatGateway>>,
    ) -> Self {
        Self {
            secret: config::TELEGRAM_WEBHOOK_SECRET.clone(),
            ledger,
            dispatcher,
            gateway,
            retry: RetryPolicy::from_env(),
            dispatch_timeout: Duration::from_secs(*config::TELEGRAM_DISPATCH_TIMEOUT_SECS),
        }
    }
}

/// key: webhooks-telegram -> push intake sharing the poller's ledger dedup
pub async fn telegram_webhook(
    Extension(intake): Extension<TelegramIntake>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    if let Some(secret) = intake.secret.as_deref() {
        let presented = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(secret) {
            warn!("bot webhook secret mismatch");
            return Err(AppError::Forbidden);
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("invalid JSON".into()))?;
    let update = Update::from_value(payload).map_err(|err| {
        warn!(%err, "bot webhook update dropped");
        AppError::BadRequest(err.to_string())
    })?;

    match intake
        .ledger
        .record(&LedgerEntry::from_update(&update, Utc::now()))
        .await
    {
        Ok(RecordOutcome::Recorded) => {}
        Ok(RecordOutcome::Duplicate) => {
            info!(update_id = update.update_id, "duplicate update ignored");
            return Ok(Json(json!({"status": "duplicate"})));
        }
        Err(err) => error!(?err, update_id = update.update_id, "update ledger write failed; dispatching anyway"),
    }

    match timeout(intake.dispatch_timeout, intake.dispatcher.dispatch(&update)).await {
        Ok(Ok(effects)) => {
            if let Some(gateway) = &intake.gateway {
                deliver_all(gateway.as_ref(), &effects, intake.retry).await;
            } else if !effects.is_empty() {
                debug!(update_id = update.update_id, "no chat gateway; side effects dropped");
            }
        }
        Ok(Err(err)) => error!(?err, update_id = update.update_id, "update dispatch failed"),
        Err(_) => error!(update_id = update.update_id, "update dispatch timed out"),
    }
    Ok(Json(json!({"status": "ok"})))
}
