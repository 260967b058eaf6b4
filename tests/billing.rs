use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use sqlx::PgPool;
use subscription_engine::billing::{
    Activation, AutoRenewChange, BillingError, BillingService, CheckoutRequest, CheckoutSession,
    NotificationHandle, NotifyPolicy, PaymentGateway, PaymentGatewayError, PaymentSnapshot,
    PaymentStatus, ReconcileOutcome, Reconciliation, SubscriptionStatus, UnconfiguredGateway,
};
use subscription_engine::webhooks::parse_gateway_event;

fn whole_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).unwrap()
}

async fn seed_tenant(pool: &PgPool, api_key: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO tenants (api_key, name) VALUES ($1, $2) RETURNING id")
        .bind(api_key)
        .bind(format!("Tenant {api_key}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn seed_plan(pool: &PgPool, name: &str, days: i32) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO subscription_plans (name, amount_cents, duration_days) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(name)
    .bind(49000_i64)
    .bind(days)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn seed_payment(pool: &PgPool, tenant_id: i64, plan_id: Option<i64>, gateway_id: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO subscription_payments (tenant_id, plan_id, gateway_payment_id) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(tenant_id)
    .bind(plan_id)
    .bind(gateway_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn set_paid_until(pool: &PgPool, tenant_id: i64, status: &str, paid_until: DateTime<Utc>) {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (tenant_id, status, paid_until)
        VALUES ($1, $2, $3)
        ON CONFLICT ON CONSTRAINT unique_subscription_per_tenant
        DO UPDATE SET status = EXCLUDED.status, paid_until = EXCLUDED.paid_until
        "#,
    )
    .bind(tenant_id)
    .bind(status)
    .bind(paid_until)
    .execute(pool)
    .await
    .unwrap();
}

fn service(pool: &PgPool) -> BillingService {
    BillingService::new(pool.clone(), Arc::new(UnconfiguredGateway::default()))
}

fn reconciliation(pool: &PgPool) -> Reconciliation {
    Reconciliation::new(service(pool), NotificationHandle::disabled())
}

/// Answers every status query with one fixed gateway record.
struct StaticGateway {
    snapshot: PaymentSnapshot,
}

#[async_trait]
impl PaymentGateway for StaticGateway {
    async fn create_checkout(
        &self,
        _request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError> {
        Err(PaymentGatewayError::NotConfigured)
    }

    async fn get_status(
        &self,
        _gateway_payment_id: &str,
    ) -> Result<PaymentSnapshot, PaymentGatewayError> {
        Ok(self.snapshot.clone())
    }
}

fn reconciliation_with_gateway(pool: &PgPool, snapshot: PaymentSnapshot) -> Reconciliation {
    let billing = BillingService::new(pool.clone(), Arc::new(StaticGateway { snapshot }));
    Reconciliation::new(billing, NotificationHandle::disabled())
}

// key: billing-tests -> webhook activation and replay
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn succeeded_webhook_activates_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-webhook").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let payment_id = seed_payment(&pool, tenant_id, Some(plan_id), "gw-100").await;
    let reconciliation = reconciliation(&pool);

    let event = parse_gateway_event(json!({
        "event": "payment.succeeded",
        "object": {
            "id": "gw-100",
            "status": "succeeded",
            "metadata": {"tenant_id": tenant_id.to_string(), "plan_id": plan_id.to_string()}
        }
    }))
    .unwrap()
    .unwrap();

    let before = Utc::now();
    let first = reconciliation.handle_gateway_event(&event).await.unwrap();
    let ReconcileOutcome::Succeeded(subscription) = first else {
        panic!("expected activation");
    };
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.plan_id, Some(plan_id));
    assert!(!subscription.is_trial);
    let paid_until = subscription.paid_until.unwrap();
    assert!(paid_until >= before + Duration::days(30));
    assert!(paid_until <= Utc::now() + Duration::days(30));

    let replay = reconciliation.handle_gateway_event(&event).await.unwrap();
    assert_eq!(replay.label(), "already_processed");

    let billing = reconciliation.billing();
    let stored = billing.subscription_for(tenant_id, Utc::now()).await.unwrap();
    assert_eq!(stored.paid_until, Some(paid_until));
    let payment = billing.payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert!(payment.activated_at.is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_activation_extends_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-race").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let payment_id = seed_payment(&pool, tenant_id, Some(plan_id), "gw-race").await;
    let billing = service(&pool);
    let now = whole_seconds(Utc::now());

    let results = futures_util::future::join_all(
        (0..5).map(|_| billing.activate_at(payment_id, now)),
    )
    .await;

    let activated = results
        .iter()
        .filter(|result| matches!(result, Ok(Activation::Activated { .. })))
        .count();
    let no_ops = results
        .iter()
        .filter(|result| matches!(result, Ok(Activation::NoOp { .. })))
        .count();
    assert_eq!((activated, no_ops), (1, 4));

    let subscription = billing.subscription_for(tenant_id, now).await.unwrap();
    assert_eq!(subscription.paid_until, Some(now + Duration::days(30)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn renewal_stacks_and_lapsed_subscription_restarts(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let billing = service(&pool);
    let now = whole_seconds(Utc::now());

    let renewing = seed_tenant(&pool, "key-renewing").await;
    set_paid_until(&pool, renewing, "active", now + Duration::days(5)).await;
    let payment = seed_payment(&pool, renewing, Some(plan_id), "gw-renew").await;
    let activation = billing.activate_at(payment, now).await.unwrap();
    assert_eq!(
        activation.subscription().paid_until,
        Some(now + Duration::days(35))
    );

    let lapsed = seed_tenant(&pool, "key-lapsed").await;
    set_paid_until(&pool, lapsed, "expired", now - Duration::days(3)).await;
    let payment = seed_payment(&pool, lapsed, Some(plan_id), "gw-lapsed").await;
    let activation = billing.activate_at(payment, now).await.unwrap();
    assert_eq!(
        activation.subscription().paid_until,
        Some(now + Duration::days(30))
    );
    assert_eq!(activation.subscription().status, SubscriptionStatus::Active);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn payment_without_plan_is_refused(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-planless").await;
    let payment_id = seed_payment(&pool, tenant_id, None, "gw-planless").await;
    let billing = service(&pool);

    let err = billing.activate(payment_id).await.unwrap_err();
    assert!(matches!(err, BillingError::PlanUnresolved { .. }));

    let payment = billing.payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.activated_at.is_none());
    assert!(!billing
        .has_active_subscription(tenant_id, Utc::now())
        .await
        .unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn webhook_with_foreign_tenant_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let owner = seed_tenant(&pool, "key-owner").await;
    let intruder = seed_tenant(&pool, "key-intruder").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    seed_payment(&pool, owner, Some(plan_id), "gw-owned").await;
    let reconciliation = reconciliation(&pool);

    let event = parse_gateway_event(json!({
        "event": "payment.succeeded",
        "object": {"id": "gw-owned", "metadata": {"tenant_id": intruder}}
    }))
    .unwrap()
    .unwrap();

    let err = reconciliation.handle_gateway_event(&event).await.unwrap_err();
    assert!(matches!(err, BillingError::TenantMismatch { owner: o, claimed: c, .. } if o == owner && c == intruder));
    assert!(!reconciliation
        .billing()
        .has_active_subscription(owner, Utc::now())
        .await
        .unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn payment_checks_are_scoped_to_the_tenant(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let owner = seed_tenant(&pool, "key-scoped").await;
    let other = seed_tenant(&pool, "key-other").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let payment_id = seed_payment(&pool, owner, Some(plan_id), "gw-scoped").await;
    let reconciliation = reconciliation(&pool);

    let outcome = reconciliation
        .check_payment(other, payment_id, NotifyPolicy::Notify)
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::NotFound));

    // No credentials: the pull path reports the gateway as unavailable.
    let outcome = reconciliation
        .check_payment(owner, payment_id, NotifyPolicy::Suppress)
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Unavailable(_)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn checkout_without_gateway_keeps_pending_placeholder(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-checkout").await;
    let plan_id = seed_plan(&pool, "Quarterly", 90).await;
    let billing = service(&pool);

    let outcome = billing.create_checkout(tenant_id, plan_id).await.unwrap();
    assert_eq!(outcome.payment.status, PaymentStatus::Pending);
    assert!(outcome.payment.has_placeholder_id());
    assert_eq!(outcome.confirmation_url, None);
    assert_eq!(outcome.metadata.tenant_id, tenant_id.to_string());
    assert_eq!(
        outcome.metadata.payment_id,
        Some(outcome.payment.id.to_string())
    );

    // Placeholders are never polled against the gateway.
    assert!(billing
        .latest_pending_payment(tenant_id)
        .await
        .unwrap()
        .is_none());
    let outcome = reconciliation(&pool)
        .check_payment(tenant_id, outcome.payment.id, NotifyPolicy::Notify)
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Pending));

    let err = billing.create_checkout(tenant_id, 9999).await.unwrap_err();
    assert!(matches!(err, BillingError::PlanNotFound(9999)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn webhook_adopts_gateway_id_for_placeholder_rows(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-adopt").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let checkout = service(&pool)
        .create_checkout(tenant_id, plan_id)
        .await
        .unwrap();
    let metadata = json!({
        "tenant_id": tenant_id,
        "plan_id": plan_id,
        "payment_id": checkout.payment.id.to_string()
    });
    let reconciliation = reconciliation_with_gateway(
        &pool,
        PaymentSnapshot {
            gateway_payment_id: "gw-late-id".into(),
            status: PaymentStatus::Succeeded,
            raw: json!({"id": "gw-late-id", "status": "succeeded", "metadata": metadata}),
        },
    );

    let event = parse_gateway_event(json!({
        "event": "payment.succeeded",
        "object": {"id": "gw-late-id", "metadata": metadata}
    }))
    .unwrap()
    .unwrap();
    let outcome = reconciliation.handle_gateway_event(&event).await.unwrap();
    assert_eq!(outcome.label(), "ok");

    let payment = reconciliation
        .billing()
        .payment_by_gateway_id("gw-late-id")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.id, checkout.payment.id);
    assert_eq!(payment.status, PaymentStatus::Succeeded);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn webhook_with_unknown_gateway_id_does_not_activate_bound_payment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-bound").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let payment_id = seed_payment(&pool, tenant_id, Some(plan_id), "real-gw-id").await;
    let reconciliation = reconciliation(&pool);

    let event = parse_gateway_event(json!({
        "event": "payment.succeeded",
        "object": {
            "id": "made-up-id",
            "metadata": {"tenant_id": tenant_id, "payment_id": payment_id}
        }
    }))
    .unwrap()
    .unwrap();
    let outcome = reconciliation.handle_gateway_event(&event).await.unwrap();
    assert_eq!(outcome.label(), "not_found");

    let billing = reconciliation.billing();
    let payment = billing.payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.gateway_payment_id, "real-gw-id");
    assert!(payment.activated_at.is_none());
    assert!(billing.payment_by_gateway_id("made-up-id").await.unwrap().is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn placeholder_rows_need_gateway_confirmation(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-unconfirmed").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let checkout = service(&pool)
        .create_checkout(tenant_id, plan_id)
        .await
        .unwrap();
    let event = parse_gateway_event(json!({
        "event": "payment.succeeded",
        "object": {
            "id": "gw-unknown",
            "metadata": {"tenant_id": tenant_id, "payment_id": checkout.payment.id}
        }
    }))
    .unwrap()
    .unwrap();

    // No gateway to ask: nothing is activated.
    let outcome = reconciliation(&pool).handle_gateway_event(&event).await.unwrap();
    assert_eq!(outcome.label(), "unavailable");

    // The gateway's own record belongs to a different local payment.
    let disowning = reconciliation_with_gateway(
        &pool,
        PaymentSnapshot {
            gateway_payment_id: "gw-unknown".into(),
            status: PaymentStatus::Succeeded,
            raw: json!({"metadata": {"payment_id": (checkout.payment.id + 1).to_string()}}),
        },
    );
    let outcome = disowning.handle_gateway_event(&event).await.unwrap();
    assert_eq!(outcome.label(), "not_found");

    let payment = service(&pool)
        .payment(checkout.payment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.has_placeholder_id());
    assert!(payment.activated_at.is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn canceled_webhook_cancels_pending_payment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-cancel").await;
    let plan_id = seed_plan(&pool, "Monthly", 30).await;
    let payment_id = seed_payment(&pool, tenant_id, Some(plan_id), "gw-cancel").await;
    let reconciliation = reconciliation(&pool);

    let event = parse_gateway_event(json!({
        "event": "payment.canceled",
        "object": {"id": "gw-cancel", "metadata": {"tenant_id": tenant_id}}
    }))
    .unwrap()
    .unwrap();
    let outcome = reconciliation.handle_gateway_event(&event).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Canceled));

    let payment = reconciliation.billing().payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Canceled);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn stale_active_subscription_heals_on_read(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-stale").await;
    let now = Utc::now();
    set_paid_until(&pool, tenant_id, "active", now - Duration::hours(1)).await;
    let billing = service(&pool);

    assert!(!billing.has_active_subscription(tenant_id, now).await.unwrap());
    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "expired");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn disabling_auto_renew_is_idempotent_and_scoped(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "key-autorenew").await;
    let other = seed_tenant(&pool, "key-autorenew-other").await;
    let billing = service(&pool);
    let subscription = billing.subscription_for(tenant_id, Utc::now()).await.unwrap();
    assert!(subscription.auto_renew);

    let first = billing
        .disable_auto_renew(tenant_id, subscription.id)
        .await
        .unwrap();
    assert!(matches!(first, AutoRenewChange::Disabled(ref s) if !s.auto_renew));
    let second = billing
        .disable_auto_renew(tenant_id, subscription.id)
        .await
        .unwrap();
    assert!(matches!(second, AutoRenewChange::AlreadyDisabled(_)));

    let err = billing
        .disable_auto_renew(other, subscription.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionNotFound));
}
