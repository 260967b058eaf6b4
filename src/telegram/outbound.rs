use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

use super::types::InlineKeyboardMarkup;
use super::{ChatGateway, GatewayError};
use crate::config;

/// A message the bot owes somebody once an event has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reply {
        chat_id: i64,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    },
    AnswerCallback {
        callback_id: String,
        text: Option<String>,
    },
}

/// Ordered list of outbound actions produced by handling one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    actions: Vec<Outbound>,
}

impl SideEffects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(&mut self, chat_id: i64, text: impl Into<String>) -> &mut Self {
        self.actions.push(Outbound::Reply {
            chat_id,
            text: text.into(),
            keyboard: None,
        });
        self
    }

    pub fn reply_with_keyboard(
        &mut self,
        chat_id: i64,
        text: impl Into<String>,
        keyboard: InlineKeyboardMarkup,
    ) -> &mut Self {
        self.actions.push(Outbound::Reply {
            chat_id,
            text: text.into(),
            keyboard: Some(keyboard),
        });
        self
    }

    pub fn answer_callback(&mut self, callback_id: impl Into<String>) -> &mut Self {
        self.actions.push(Outbound::AnswerCallback {
            callback_id: callback_id.into(),
            text: None,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self) -> &[Outbound] {
        &self.actions
    }

    /// Texts of all replies, in order.
    pub fn reply_texts(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                Outbound::Reply { text, .. } => Some(text.as_str()),
                Outbound::AnswerCallback { .. } => None,
            })
            .collect()
    }
}

/// Bounded linear back-off for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            attempts: *config::NOTIFY_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(*config::NOTIFY_RETRY_BASE_MS),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

pub async fn deliver(
    gateway: &dyn ChatGateway,
    action: &Outbound,
    policy: RetryPolicy,
) -> Result<(), GatewayError> {
    let mut attempt = 1;
    loop {
        let result = match action {
            Outbound::Reply {
                chat_id,
                text,
                keyboard,
            } => gateway.send_message(*chat_id, text, keyboard.as_ref()).await,
            Outbound::AnswerCallback { callback_id, text } => {
                gateway.answer_callback(callback_id, text.as_deref()).await
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                let delay = match &err {
                    GatewayError::RateLimited {
                        retry_after: Some(seconds),
                    } => Duration::from_secs(*seconds),
                    _ => policy.delay_for(attempt),
                };
                warn!(?err, attempt, ?delay, "outbound chat call failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Delivers every action in order; failures are logged and dropped.
pub async fn deliver_all(
    gateway: &dyn ChatGateway,
    effects: &SideEffects,
    policy: RetryPolicy,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for action in effects.actions() {
        match deliver(gateway, action, policy).await {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                report.dropped += 1;
                error!(?err, ?action, "outbound chat call dropped");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChatGateway;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let gateway = FakeChatGateway::default();
        gateway.fail_sends_with(vec![
            GatewayError::Http {
                status: 502,
                description: "bad gateway".into(),
            },
            GatewayError::RateLimited { retry_after: None },
        ]);

        let mut effects = SideEffects::none();
        effects.reply(10, "hello");
        let report = deliver_all(&gateway, &effects, fast_policy()).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(gateway.send_attempts(), 3);
        assert_eq!(gateway.sent_texts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn permanent_client_errors_are_not_retried() {
        let gateway = FakeChatGateway::default();
        gateway.fail_sends_with(vec![GatewayError::Http {
            status: 403,
            description: "bot was blocked by the user".into(),
        }]);

        let mut effects = SideEffects::none();
        effects.reply(10, "hello").reply(11, "second");
        let report = deliver_all(&gateway, &effects, fast_policy()).await;

        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(gateway.send_attempts(), 2);
        assert_eq!(gateway.sent_texts(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let gateway = FakeChatGateway::default();
        gateway.fail_sends_with(
            (0..5)
                .map(|_| GatewayError::Http {
                    status: 500,
                    description: "internal".into(),
                })
                .collect(),
        );

        let action = Outbound::Reply {
            chat_id: 1,
            text: "x".into(),
            keyboard: None,
        };
        let result = deliver(&gateway, &action, fast_policy()).await;
        assert!(result.is_err());
        assert_eq!(gateway.send_attempts(), 3);
    }

    #[test]
    fn linear_backoff_grows_with_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }
}
