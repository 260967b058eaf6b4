use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::adapters::{CheckoutMetadata, CheckoutRequest, PaymentGateway, PaymentGatewayError};
use super::models::{
    PaymentStatus, Plan, Subscription, SubscriptionPayment, SubscriptionStatus, PLACEHOLDER_PREFIX,
};
use crate::config;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("payment {0} not found")]
    PaymentNotFound(i64),
    #[error("payment {payment_id} has no resolvable plan")]
    PlanUnresolved { payment_id: i64 },
    #[error("plan {0} not found or inactive")]
    PlanNotFound(i64),
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("payment {payment_id} belongs to tenant {owner}, not {claimed}")]
    TenantMismatch {
        payment_id: i64,
        owner: i64,
        claimed: i64,
    },
    #[error(transparent)]
    Gateway(#[from] PaymentGatewayError),
}

/// Result of the activation routine.
#[derive(Debug, Clone)]
pub enum Activation {
    /// The payment was converted into a subscription extension just now.
    Activated { subscription: Subscription, plan: Plan },
    /// `activated_at` was already set; nothing changed.
    NoOp { subscription: Subscription },
}

impl Activation {
    pub fn subscription(&self) -> &Subscription {
        match self {
            Activation::Activated { subscription, .. } | Activation::NoOp { subscription } => {
                subscription
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub payment: SubscriptionPayment,
    pub plan: Plan,
    pub metadata: CheckoutMetadata,
    pub confirmation_url: Option<String>,
    /// Set when the gateway call failed; the pending row is kept.
    pub gateway_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AutoRenewChange {
    Disabled(Subscription),
    AlreadyDisabled(Subscription),
}

/// New validity end: renewals stack onto a future `paid_until`, otherwise start now.
pub fn extend_paid_until(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    duration: Duration,
) -> DateTime<Utc> {
    match current {
        Some(paid_until) if paid_until > now => paid_until + duration,
        _ => now + duration,
    }
}

/// key: billing-service -> subscription lifecycle and the single activation path
#[derive(Clone)]
pub struct BillingService {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingService {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { pool, gateway }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn gateway(&self) -> &dyn PaymentGateway {
        self.gateway.as_ref()
    }

    pub async fn active_plans(&self) -> Result<Vec<Plan>, BillingError> {
        let plans = sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, name, amount_cents, currency, duration_days, is_active
            FROM subscription_plans
            WHERE is_active = TRUE
            ORDER BY amount_cents ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn plan(&self, plan_id: i64) -> Result<Option<Plan>, BillingError> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, name, amount_cents, currency, duration_days, is_active
            FROM subscription_plans
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    /// Get-or-create the tenant's subscription, correcting a stale active status.
    pub async fn subscription_for(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let mut conn = self.pool.acquire().await?;
        let subscription = ensure_subscription(&mut conn, tenant_id, false).await?;
        heal_expired(&mut conn, subscription, now).await
    }

    /// Like `subscription_for` without creating a row.
    pub async fn existing_subscription(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, BillingError> {
        let mut conn = self.pool.acquire().await?;
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;
        match subscription {
            Some(subscription) => Ok(Some(heal_expired(&mut conn, subscription, now).await?)),
            None => Ok(None),
        }
    }

    /// The "has active subscription" gate consumed by authorization middleware.
    pub async fn has_active_subscription(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, BillingError> {
        Ok(self
            .existing_subscription(tenant_id, now)
            .await?
            .map_or(false, |subscription| subscription.is_usable(now)))
    }

    pub async fn activate(&self, payment_id: i64) -> Result<Activation, BillingError> {
        self.activate_at(payment_id, Utc::now()).await
    }

    /// The only routine that moves `paid_until`. Runs in one transaction holding
    /// row locks on the payment and on the tenant's subscription.
    pub async fn activate_at(
        &self,
        payment_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Activation, BillingError> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, SubscriptionPayment>(
            "SELECT * FROM subscription_payments WHERE id = $1 FOR UPDATE",
        )
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BillingError::PaymentNotFound(payment_id))?;

        if payment.is_activated() {
            let subscription = ensure_subscription(&mut tx, payment.tenant_id, false).await?;
            tx.commit().await?;
            info!(
                %payment_id,
                tenant_id = payment.tenant_id,
                "payment already activated; nothing to do"
            );
            return Ok(Activation::NoOp { subscription });
        }

        let plan = match payment.plan_id {
            Some(plan_id) => {
                sqlx::query_as::<_, Plan>(
                    r#"
                    SELECT id, name, amount_cents, currency, duration_days, is_active
                    FROM subscription_plans
                    WHERE id = $1
                    "#,
                )
                .bind(plan_id)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => None,
        };
        let Some(plan) = plan else {
            tx.rollback().await?;
            error!(
                %payment_id,
                tenant_id = payment.tenant_id,
                plan_id = ?payment.plan_id,
                "payment has no resolvable plan; activation refused"
            );
            return Err(BillingError::PlanUnresolved { payment_id });
        };

        let current = ensure_subscription(&mut tx, payment.tenant_id, true).await?;
        let paid_until = extend_paid_until(current.paid_until, now, plan.duration());

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = $2, plan_id = $3, paid_until = $4, is_trial = FALSE, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(current.id)
        .bind(SubscriptionStatus::Active)
        .bind(plan.id)
        .bind(paid_until)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE subscription_payments
            SET status = $2, activated_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(PaymentStatus::Succeeded)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            %payment_id,
            tenant_id = subscription.tenant_id,
            plan = %plan.name,
            previous_paid_until = ?current.paid_until,
            %paid_until,
            "subscription activated from payment"
        );
        Ok(Activation::Activated { subscription, plan })
    }

    /// Creates the pending row first, then asks the gateway for a checkout.
    /// A failed or incomplete gateway call leaves the row in place.
    pub async fn create_checkout(
        &self,
        tenant_id: i64,
        plan_id: i64,
    ) -> Result<CheckoutOutcome, BillingError> {
        let plan = self
            .plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound(plan_id))?;

        let mut metadata = CheckoutMetadata {
            tenant_id: tenant_id.to_string(),
            plan_id: plan.id.to_string(),
            payment_id: None,
        };
        let placeholder = format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4().simple());
        let payment = sqlx::query_as::<_, SubscriptionPayment>(
            r#"
            INSERT INTO subscription_payments (tenant_id, plan_id, gateway_payment_id, status, raw_payload)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(plan.id)
        .bind(&placeholder)
        .bind(PaymentStatus::Pending)
        .bind(json!({ "metadata": &metadata }))
        .fetch_one(&self.pool)
        .await?;
        metadata.payment_id = Some(payment.id.to_string());

        let request = CheckoutRequest {
            idempotence_key: Uuid::new_v4().simple().to_string(),
            amount_value: plan.amount_value(),
            currency: plan.currency.clone(),
            description: format!("Subscription: {}", plan.name),
            return_url: config::PAYMENT_RETURN_URL.clone(),
            metadata: metadata.clone(),
        };

        let (payment, confirmation_url, gateway_error) =
            match self.gateway.create_checkout(&request).await {
                Ok(session) => {
                    let updated = sqlx::query_as::<_, SubscriptionPayment>(
                        r#"
                        UPDATE subscription_payments
                        SET gateway_payment_id = COALESCE($2, gateway_payment_id),
                            status = $3,
                            confirmation_url = $4,
                            raw_payload = $5,
                            updated_at = NOW()
                        WHERE id = $1
                        RETURNING *
                        "#,
                    )
                    .bind(payment.id)
                    .bind(&session.gateway_payment_id)
                    .bind(session.status)
                    .bind(&session.confirmation_url)
                    .bind(&session.raw)
                    .fetch_one(&self.pool)
                    .await?;
                    if session.confirmation_url.is_none() {
                        warn!(
                            payment_id = updated.id,
                            %tenant_id,
                            "gateway returned no confirmation url"
                        );
                    }
                    (updated, session.confirmation_url, None)
                }
                Err(err) => {
                    warn!(?err, payment_id = payment.id, %tenant_id, "checkout creation failed; payment kept pending");
                    (payment, None, Some(err.to_string()))
                }
            };

        info!(
            payment_id = payment.id,
            %tenant_id,
            plan = %plan.name,
            gateway_payment_id = %payment.gateway_payment_id,
            "checkout initiated"
        );
        Ok(CheckoutOutcome {
            payment,
            plan,
            metadata,
            confirmation_url,
            gateway_error,
        })
    }

    pub async fn payment(&self, payment_id: i64) -> Result<Option<SubscriptionPayment>, BillingError> {
        Ok(sqlx::query_as::<_, SubscriptionPayment>(
            "SELECT * FROM subscription_payments WHERE id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Scoped lookup; another tenant's id behaves as missing.
    pub async fn payment_for_tenant(
        &self,
        tenant_id: i64,
        payment_id: i64,
    ) -> Result<Option<SubscriptionPayment>, BillingError> {
        Ok(sqlx::query_as::<_, SubscriptionPayment>(
            "SELECT * FROM subscription_payments WHERE id = $1 AND tenant_id = $2",
        )
        .bind(payment_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn payment_by_gateway_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<SubscriptionPayment>, BillingError> {
        Ok(sqlx::query_as::<_, SubscriptionPayment>(
            "SELECT * FROM subscription_payments WHERE gateway_payment_id = $1",
        )
        .bind(gateway_payment_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Newest pending payment the gateway knows about.
    pub async fn latest_pending_payment(
        &self,
        tenant_id: i64,
    ) -> Result<Option<SubscriptionPayment>, BillingError> {
        Ok(sqlx::query_as::<_, SubscriptionPayment>(
            r#"
            SELECT * FROM subscription_payments
            WHERE tenant_id = $1 AND status = 'pending' AND gateway_payment_id NOT LIKE $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(format!("{PLACEHOLDER_PREFIX}%"))
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Stores the last gateway snapshot without touching status.
    pub async fn record_snapshot(&self, payment_id: i64, raw: &Value) -> Result<(), BillingError> {
        sqlx::query(
            "UPDATE subscription_payments SET raw_payload = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(payment_id)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces a placeholder id with the one the gateway reported.
    pub async fn adopt_gateway_id(
        &self,
        payment_id: i64,
        gateway_payment_id: &str,
    ) -> Result<(), BillingError> {
        let result = sqlx::query(
            r#"
            UPDATE subscription_payments
            SET gateway_payment_id = $2, updated_at = NOW()
            WHERE id = $1 AND gateway_payment_id LIKE $3
            "#,
        )
        .bind(payment_id)
        .bind(gateway_payment_id)
        .bind(format!("{PLACEHOLDER_PREFIX}%"))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            info!(%payment_id, %gateway_payment_id, "placeholder payment id replaced");
        }
        Ok(())
    }

    /// Pending, never-activated payments move to canceled; others are returned as is.
    pub async fn mark_canceled(&self, payment_id: i64) -> Result<SubscriptionPayment, BillingError> {
        let updated = sqlx::query_as::<_, SubscriptionPayment>(
            r#"
            UPDATE subscription_payments
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND activated_at IS NULL
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(PaymentStatus::Canceled)
        .fetch_optional(&self.pool)
        .await?;
        match updated {
            Some(payment) => {
                info!(%payment_id, tenant_id = payment.tenant_id, "payment canceled");
                Ok(payment)
            }
            None => self
                .payment(payment_id)
                .await?
                .ok_or(BillingError::PaymentNotFound(payment_id)),
        }
    }

    pub async fn disable_auto_renew(
        &self,
        tenant_id: i64,
        subscription_id: i64,
    ) -> Result<AutoRenewChange, BillingError> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET auto_renew = FALSE, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND auto_renew = TRUE
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(subscription) = updated {
            info!(%subscription_id, %tenant_id, "auto-renew disabled");
            return Ok(AutoRenewChange::Disabled(subscription));
        }

        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 AND tenant_id = $2",
        )
        .bind(subscription_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .map(AutoRenewChange::AlreadyDisabled)
        .ok_or(BillingError::SubscriptionNotFound)
    }
}

/// Upserts the tenant's row (default expired) and reads it back, optionally locked.
async fn ensure_subscription(
    conn: &mut PgConnection,
    tenant_id: i64,
    lock: bool,
) -> Result<Subscription, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (tenant_id, status, is_trial, auto_renew)
        VALUES ($1, 'expired', FALSE, TRUE)
        ON CONFLICT ON CONSTRAINT unique_subscription_per_tenant DO NOTHING
        "#,
    )
    .bind(tenant_id)
    .execute(&mut *conn)
    .await?;

    let query = if lock {
        "SELECT * FROM subscriptions WHERE tenant_id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM subscriptions WHERE tenant_id = $1"
    };
    sqlx::query_as::<_, Subscription>(query)
        .bind(tenant_id)
        .fetch_one(&mut *conn)
        .await
}

async fn heal_expired(
    conn: &mut PgConnection,
    subscription: Subscription,
    now: DateTime<Utc>,
) -> Result<Subscription, BillingError> {
    if !subscription.is_stale_active(now) {
        return Ok(subscription);
    }
    let healed = sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET status = 'expired', updated_at = NOW()
        WHERE id = $1 AND status = 'active' AND (paid_until IS NULL OR paid_until <= $2)
        RETURNING *
        "#,
    )
    .bind(subscription.id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    match healed {
        Some(healed) => {
            info!(
                subscription_id = healed.id,
                tenant_id = healed.tenant_id,
                paid_until = ?healed.paid_until,
                "stale active subscription marked expired"
            );
            Ok(healed)
        }
        // Concurrently renewed; re-read the current row.
        None => Ok(sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(subscription.id)
            .fetch_one(&mut *conn)
            .await?),
    }
}
