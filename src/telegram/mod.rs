pub mod client;
pub mod outbound;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use client::TelegramClient;
pub use outbound::{deliver, deliver_all, Outbound, RetryPolicy, SideEffects};
pub use types::{
    BotEvent, CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, Message, Update,
    WebhookInfo,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Another `getUpdates` consumer holds the credential, or push delivery is still set.
    #[error("chat gateway conflict (409): {0}")]
    Conflict(String),
    #[error("chat gateway rate limited the request (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },
    #[error("chat gateway returned HTTP {status}: {description}")]
    Http { status: u16, description: String },
    #[error("chat gateway rejected the request: {0}")]
    Api(String),
    #[error("chat gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode chat gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Timeouts, connection failures, rate limits and 5xx may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::RateLimited { .. } => true,
            GatewayError::Http { status, .. } => *status >= 500,
            GatewayError::Conflict(_) | GatewayError::Api(_) | GatewayError::Decode(_) => false,
        }
    }
}

/// key: chat-gateway -> messaging provider seam
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, GatewayError>;

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), GatewayError>;

    async fn get_webhook_info(&self) -> Result<WebhookInfo, GatewayError>;

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), GatewayError>;

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), GatewayError>;
}
