use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef, Postgres};
use sqlx::{Decode, Encode, FromRow};

use crate::config;

/// key: billing-models -> plans, subscriptions, payments
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub duration_days: i32,
    pub is_active: bool,
}

impl Plan {
    /// Price as the gateway expects it, e.g. `"490.00"`.
    pub fn amount_value(&self) -> String {
        format!("{}.{:02}", self.amount_cents / 100, self.amount_cents % 100)
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.duration_days))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(format!("unknown subscription status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
        }
    }

    /// Maps a gateway status string; `waiting_for_capture` and unknowns stay pending.
    pub fn from_gateway(value: &str) -> Self {
        match value {
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" | "cancelled" => PaymentStatus::Canceled,
            _ => PaymentStatus::Pending,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "canceled" => Ok(PaymentStatus::Canceled),
            other => Err(format!("unknown payment status {other}")),
        }
    }
}

/// key: billing-subscription-model -> one row per tenant
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub tenant_id: i64,
    pub plan_id: Option<i64>,
    pub status: SubscriptionStatus,
    pub paid_until: Option<DateTime<Utc>>,
    pub is_trial: bool,
    pub auto_renew: bool,
    pub admin_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if self.admin_override {
            return true;
        }
        self.status == SubscriptionStatus::Active
            && self.paid_until.map_or(false, |paid_until| paid_until > now)
    }

    /// Active without a future `paid_until`; corrected to expired on read.
    pub fn is_stale_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.paid_until.map_or(true, |paid_until| paid_until <= now)
    }
}

/// Stores a status enum in a TEXT column through its string form.
macro_rules! text_column {
    ($ty:ty) => {
        impl sqlx::Type<Postgres> for $ty {
            fn type_info() -> PgTypeInfo {
                <String as sqlx::Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <String as sqlx::Type<Postgres>>::compatible(ty)
            }
        }

        impl<'r> Decode<'r, Postgres> for $ty {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let raw = <&str as Decode<Postgres>>::decode(value)?;
                Ok(raw.parse::<$ty>()?)
            }
        }

        impl Encode<'_, Postgres> for $ty {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
                <&str as Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

text_column!(SubscriptionStatus);
text_column!(PaymentStatus);

/// key: billing-payment-model -> one row per gateway transaction
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPayment {
    pub id: i64,
    pub tenant_id: i64,
    pub plan_id: Option<i64>,
    pub gateway_payment_id: String,
    pub status: PaymentStatus,
    pub activated_at: Option<DateTime<Utc>>,
    pub confirmation_url: Option<String>,
    pub raw_payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const PLACEHOLDER_PREFIX: &str = "local-";

impl SubscriptionPayment {
    /// The gateway never saw this id; there is nothing to ask it about.
    pub fn has_placeholder_id(&self) -> bool {
        self.gateway_payment_id.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn is_activated(&self) -> bool {
        self.activated_at.is_some()
    }
}

/// Renders a timestamp for chat messages in the configured display offset.
pub fn display_time(at: DateTime<Utc>) -> String {
    display_time_with_offset(at, *config::DISPLAY_UTC_OFFSET_MINUTES)
}

pub fn display_time_with_offset(at: DateTime<Utc>, offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    at.with_timezone(&offset).format("%d.%m.%Y %H:%M").to_string()
}
