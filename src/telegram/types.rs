use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

impl Message {
    /// Text of the message, falling back to a media caption.
    pub fn content(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

/// key: telegram-events -> decoded once at the ingestion boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    Message(Message),
    EditedMessage(Message),
    CallbackQuery(CallbackQuery),
    Unknown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateDecodeError {
    #[error("update payload is not a JSON object")]
    NotAnObject,
    #[error("update payload has no update_id")]
    MissingUpdateId,
}

/// One inbound gateway event together with the payload it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub update_id: i64,
    pub event: BotEvent,
    pub raw: Value,
}

impl Update {
    pub fn from_value(raw: Value) -> Result<Self, UpdateDecodeError> {
        let object = raw.as_object().ok_or(UpdateDecodeError::NotAnObject)?;
        let update_id = object
            .get("update_id")
            .and_then(Value::as_i64)
            .ok_or(UpdateDecodeError::MissingUpdateId)?;

        let event = if let Some(message) = first_present(object, &["message", "channel_post"]) {
            decode(update_id, message).map(BotEvent::Message)
        } else if let Some(message) =
            first_present(object, &["edited_message", "edited_channel_post"])
        {
            decode(update_id, message).map(BotEvent::EditedMessage)
        } else if let Some(callback) = object.get("callback_query") {
            decode(update_id, callback).map(BotEvent::CallbackQuery)
        } else {
            None
        }
        .unwrap_or(BotEvent::Unknown);

        Ok(Self {
            update_id,
            event,
            raw,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self.event {
            BotEvent::Message(_) => "message",
            BotEvent::EditedMessage(_) => "edited_message",
            BotEvent::CallbackQuery(_) => "callback_query",
            BotEvent::Unknown => "unknown",
        }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match &self.event {
            BotEvent::Message(message) | BotEvent::EditedMessage(message) => Some(message.chat.id),
            BotEvent::CallbackQuery(callback) => {
                callback.message.as_ref().map(|message| message.chat.id)
            }
            BotEvent::Unknown => None,
        }
    }

    pub fn sender_id(&self) -> Option<i64> {
        match &self.event {
            BotEvent::Message(message) | BotEvent::EditedMessage(message) => {
                message.from.as_ref().map(|user| user.id)
            }
            BotEvent::CallbackQuery(callback) => Some(callback.from.id),
            BotEvent::Unknown => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.event {
            BotEvent::Message(message) | BotEvent::EditedMessage(message) => message.content(),
            _ => None,
        }
    }

    pub fn callback_data(&self) -> Option<&str> {
        match &self.event {
            BotEvent::CallbackQuery(callback) => callback.data.as_deref(),
            _ => None,
        }
    }

    /// Leading `/command` of the message text, lowercased and without a `@botname` suffix.
    pub fn command(&self) -> Option<String> {
        let text = self.text()?.trim();
        if !text.starts_with('/') {
            return None;
        }
        let head = text.split_whitespace().next()?;
        let head = head.split('@').next().unwrap_or(head);
        Some(head.to_ascii_lowercase())
    }
}

fn first_present<'a>(
    object: &'a serde_json::Map<String, Value>,
    keys: &[&str],
) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key).filter(|value| value.is_object()))
}

fn decode<T: serde::de::DeserializeOwned>(update_id: i64, value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            debug!(%update_id, ?err, "update body did not match a known event shape");
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebhookInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub pending_update_count: i64,
    #[serde(default)]
    pub last_error_date: Option<i64>,
    #[serde(default)]
    pub last_error_message: Option<String>,
}

impl WebhookInfo {
    pub fn push_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InlineKeyboardButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: Some(data.into()),
            url: None,
        }
    }

    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: None,
            url: Some(url.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    /// One button per row.
    pub fn column(buttons: Vec<InlineKeyboardButton>) -> Self {
        Self {
            inline_keyboard: buttons.into_iter().map(|button| vec![button]).collect(),
        }
    }
}

/// Envelope every Bot API method answers with.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}
