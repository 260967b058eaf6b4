use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use super::models::display_time;
use crate::config;
use crate::telegram::{
    deliver, ChatGateway, InlineKeyboardButton, InlineKeyboardMarkup, Outbound, RetryPolicy,
};
use crate::tenants::TenantDirectory;

/// key: billing-reminder-scheduler -> expiry sweep + renewal reminders
pub fn spawn(pool: PgPool, gateway: Option<Arc<dyn ChatGateway>>, policy: RetryPolicy) {
    let interval = TokioDuration::from_secs(*config::BILLING_REMINDER_SCAN_INTERVAL_SECS);
    let window = Duration::hours(*config::BILLING_REMINDER_WINDOW_HOURS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, gateway.as_deref(), policy, now, window).await {
                warn!(?err, "billing reminder tick failed");
            }
        }
    });
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub expired: usize,
    pub reminded: usize,
}

/// key: billing-reminder-scheduler -> tick handler
pub async fn process_tick(
    pool: &PgPool,
    gateway: Option<&dyn ChatGateway>,
    policy: RetryPolicy,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<TickReport> {
    let mut report = TickReport::default();

    let expired = sqlx::query_as::<_, ExpiredSubscription>(
        r#"
        UPDATE subscriptions
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'active' AND (paid_until IS NULL OR paid_until <= $1)
        RETURNING id, tenant_id, paid_until
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    for record in &expired {
        info!(
            subscription = record.id,
            tenant_id = record.tenant_id,
            paid_until = ?record.paid_until,
            "subscription expired"
        );
    }
    report.expired = expired.len();

    let Some(gateway) = gateway else {
        debug!("no chat gateway configured; renewal reminders skipped");
        return Ok(report);
    };

    let candidates = sqlx::query_as::<_, ReminderCandidate>(
        r#"
        SELECT s.id, s.tenant_id, s.paid_until
        FROM subscriptions s
        WHERE s.status = 'active'
          AND s.auto_renew = TRUE
          AND s.is_trial = FALSE
          AND s.paid_until > $1
          AND s.paid_until <= $2
          AND NOT EXISTS (
              SELECT 1 FROM subscription_reminders r
              WHERE r.subscription_id = s.id AND r.paid_until = s.paid_until
          )
        ORDER BY s.paid_until ASC
        "#,
    )
    .bind(now)
    .bind(now + window)
    .fetch_all(pool)
    .await?;

    let directory = TenantDirectory::new(pool.clone());
    for candidate in candidates {
        let chat_id = match directory.notification_chat(candidate.tenant_id).await {
            Ok(Some(chat_id)) => chat_id,
            Ok(None) => {
                debug!(tenant_id = candidate.tenant_id, "no chat for renewal reminder");
                continue;
            }
            Err(err) => {
                warn!(?err, tenant_id = candidate.tenant_id, "failed to resolve reminder chat");
                continue;
            }
        };

        // At most one reminder per validity period, across replicas.
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO subscription_reminders (subscription_id, paid_until)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            RETURNING subscription_id
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.paid_until)
        .fetch_optional(pool)
        .await?;
        if claimed.is_none() {
            continue;
        }

        let action = Outbound::Reply {
            chat_id,
            text: reminder_text(candidate.paid_until),
            keyboard: Some(reminder_keyboard(candidate.id)),
        };
        match deliver(gateway, &action, policy).await {
            Ok(()) => {
                report.reminded += 1;
                info!(
                    subscription = candidate.id,
                    tenant_id = candidate.tenant_id,
                    %chat_id,
                    "renewal reminder sent"
                );
            }
            Err(err) => error!(
                ?err,
                subscription = candidate.id,
                tenant_id = candidate.tenant_id,
                "renewal reminder dropped"
            ),
        }
    }

    Ok(report)
}

pub fn reminder_text(paid_until: DateTime<Utc>) -> String {
    format!(
        "Your subscription ends soon: {}.\nRenew automatically?",
        display_time(paid_until)
    )
}

pub fn reminder_keyboard(subscription_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::column(vec![
        InlineKeyboardButton::callback("Renew now", format!("renew_now_{subscription_id}")),
        InlineKeyboardButton::callback(
            "Disable auto-renew",
            format!("disable_auto_renew_{subscription_id}"),
        ),
    ])
}

#[derive(Debug, FromRow)]
struct ExpiredSubscription {
    id: i64,
    tenant_id: i64,
    paid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct ReminderCandidate {
    id: i64,
    tenant_id: i64,
    paid_until: DateTime<Utc>,
}
