use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::types::{ApiResponse, InlineKeyboardMarkup, Update, WebhookInfo};
use super::{ChatGateway, GatewayError};
use crate::config;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const ALLOWED_UPDATES: [&str; 5] = [
    "message",
    "edited_message",
    "channel_post",
    "edited_channel_post",
    "callback_query",
];

/// Bot API client. Every method is a JSON POST to `<base>/bot<token>/<method>`.
#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    network_slack: Duration,
}

impl TelegramClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        network_slack: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
            network_slack,
        })
    }

    /// Builds a client from `TELEGRAM_API_BASE` / `TELEGRAM_BOT_TOKEN`; `None` without a token.
    pub fn from_env() -> Result<Option<Self>, GatewayError> {
        let Some(token) = config::TELEGRAM_BOT_TOKEN.clone() else {
            return Ok(None);
        };
        let slack = Duration::from_secs(*config::TELEGRAM_POLLING_NETWORK_SLACK_SECS);
        Self::new(config::TELEGRAM_API_BASE.as_str(), token, slack).map(Some)
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.base_url.trim_end_matches('/'),
            self.token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .post(self.endpoint(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        let envelope: Option<ApiResponse> = serde_json::from_str(&text).ok();
        let description = envelope
            .as_ref()
            .and_then(|envelope| envelope.description.clone())
            .unwrap_or_else(|| text.chars().take(200).collect());

        if status.as_u16() == 409 {
            return Err(GatewayError::Conflict(description));
        }
        if status.as_u16() == 429 {
            let retry_after = envelope
                .as_ref()
                .and_then(|envelope| envelope.parameters.as_ref())
                .and_then(|parameters| parameters.retry_after);
            return Err(GatewayError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                description,
            });
        }

        let envelope = envelope
            .ok_or_else(|| GatewayError::Decode(format!("{method}: body is not an API envelope")))?;
        if !envelope.ok {
            return Err(GatewayError::Api(description));
        }
        let result = envelope
            .result
            .ok_or_else(|| GatewayError::Decode(format!("{method}: envelope without result")))?;
        serde_json::from_value(result).map_err(|err| GatewayError::Decode(format!("{method}: {err}")))
    }
}

#[async_trait]
impl ChatGateway for TelegramClient {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, GatewayError> {
        let mut body = json!({
            "timeout": timeout.as_secs(),
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }

        let raw: Vec<Value> = self
            .call("getUpdates", &body, timeout + self.network_slack)
            .await?;
        let mut updates = Vec::with_capacity(raw.len());
        for item in raw {
            match Update::from_value(item.clone()) {
                Ok(update) => updates.push(update),
                Err(err) => warn!(?err, payload = %item, "update skipped at ingestion boundary"),
            }
        }
        debug!(count = updates.len(), ?offset, "getUpdates returned");
        Ok(updates)
    }

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), GatewayError> {
        let _: bool = self
            .call(
                "deleteWebhook",
                &json!({ "drop_pending_updates": drop_pending_updates }),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn get_webhook_info(&self) -> Result<WebhookInfo, GatewayError> {
        self.call("getWebhookInfo", &json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), GatewayError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] =
                serde_json::to_value(keyboard).map_err(|err| GatewayError::Decode(err.to_string()))?;
        }
        let _: Value = self
            .call("sendMessage", &body, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), GatewayError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self
            .call("answerCallbackQuery", &body, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }
}
