use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use subscription_engine::billing::{
    BillingService, NotificationHandle, Reconciliation, UnconfiguredGateway,
};
use subscription_engine::bot::{BotRouter, EventDispatcher};
use subscription_engine::ledger::{LedgerEntry, PgUpdateLedger, RecordOutcome, UpdateLedger};
use subscription_engine::telegram::Update;
use subscription_engine::tenants::{
    resolve_start_payload, BindToken, BindTokenError, BotLinks, TenantDirectory, TenantError,
    TenantIdentifier,
};

async fn seed_tenant(pool: &PgPool, api_key: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO tenants (api_key, name) VALUES ($1, $1) RETURNING id")
        .bind(api_key)
        .fetch_one(pool)
        .await
        .unwrap()
}

// key: ledger-tests -> update dedup and resume cursor
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn ledger_records_each_update_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let ledger = PgUpdateLedger::new(pool.clone());
    assert_eq!(ledger.resume_cursor().await.unwrap(), None);

    let update = Update::from_value(json!({
        "update_id": 700,
        "message": {"message_id": 1, "from": {"id": 5}, "chat": {"id": 5}, "text": "/start"}
    }))
    .unwrap();
    let entry = LedgerEntry::from_update(&update, Utc::now());
    assert_eq!(ledger.record(&entry).await.unwrap(), RecordOutcome::Recorded);
    assert_eq!(ledger.record(&entry).await.unwrap(), RecordOutcome::Duplicate);
    assert_eq!(ledger.resume_cursor().await.unwrap(), Some(701));

    let (command, chat_id): (Option<String>, Option<i64>) =
        sqlx::query_as("SELECT command, chat_id FROM bot_update_ledger WHERE update_id = 700")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(command.as_deref(), Some("/start"));
    assert_eq!(chat_id, Some(5));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn identifiers_and_bind_tokens_resolve_tenants(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tenant_id = seed_tenant(&pool, "ak_live_resolve").await;
    let directory = TenantDirectory::new(pool.clone());

    let by_key = directory
        .resolve(&TenantIdentifier::parse("ak_live_resolve").unwrap())
        .await
        .unwrap();
    assert_eq!(by_key.id, tenant_id);
    let by_public_id = directory
        .resolve(&TenantIdentifier::PublicId(by_key.public_id))
        .await
        .unwrap();
    assert_eq!(by_public_id.id, tenant_id);
    assert!(matches!(
        directory.resolve(&TenantIdentifier::Id(tenant_id + 100)).await,
        Err(TenantError::NotFound)
    ));

    let now = Utc::now().timestamp();
    let token = BindToken::issue(tenant_id, "ak_live_resolve", "bind-secret", now);
    let tenant = resolve_start_payload(&directory, &token, "bind-secret", 600, now + 5)
        .await
        .unwrap();
    assert_eq!(tenant.id, tenant_id);

    assert!(matches!(
        resolve_start_payload(&directory, &token, "other-secret", 600, now + 5).await,
        Err(BindTokenError::BadSignature)
    ));
    assert!(matches!(
        resolve_start_payload(&directory, &token, "bind-secret", 600, now + 601).await,
        Err(BindTokenError::Expired)
    ));

    sqlx::query("UPDATE tenants SET is_active = FALSE WHERE id = $1")
        .bind(tenant_id)
        .execute(&pool)
        .await
        .unwrap();
    assert!(matches!(
        resolve_start_payload(&directory, &token, "bind-secret", 600, now + 5).await,
        Err(BindTokenError::UnknownTenant)
    ));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn chat_binding_and_link_collisions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let first = seed_tenant(&pool, "ak_first").await;
    let second = seed_tenant(&pool, "ak_second").await;
    let directory = TenantDirectory::new(pool.clone());
    let links = BotLinks::new(pool.clone());

    assert_eq!(directory.bind_chat(first, 9001).await.unwrap(), None);
    assert_eq!(directory.bind_chat(first, 9002).await.unwrap(), Some(9001));
    assert_eq!(directory.notification_chat(first).await.unwrap(), Some(9002));
    assert_eq!(
        directory.find_by_chat(9002).await.unwrap().map(|tenant| tenant.id),
        Some(first)
    );

    // The link takes precedence over the tenant's own chat.
    links.upsert(55, -100500, first).await.unwrap();
    assert_eq!(directory.notification_chat(first).await.unwrap(), Some(-100500));

    // The second tenant already has a link; moving user 55 there drops it.
    links.upsert(66, 66, second).await.unwrap();
    let moved = links.upsert(55, 55, second).await.unwrap();
    assert_eq!(moved.tenant_id, second);
    assert!(links.by_bot_user(66).await.unwrap().is_none());
    assert!(links.for_tenant(first).await.unwrap().is_none());
    assert_eq!(
        links.for_tenant(second).await.unwrap().map(|link| link.bot_user_id),
        Some(55)
    );
}

fn start_message(update_id: i64, user_id: i64, text: &str) -> Update {
    Update::from_value(json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "from": {"id": user_id},
            "chat": {"id": user_id, "type": "private"},
            "text": text,
        }
    }))
    .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn payment_link_does_not_displace_an_existing_link(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let linked = seed_tenant(&pool, "ak_linked").await;
    let unlinked = seed_tenant(&pool, "ak_unlinked").await;
    let directory = TenantDirectory::new(pool.clone());
    let links = BotLinks::new(pool.clone());
    directory.bind_chat(linked, 55).await.unwrap();
    links.upsert(55, 55, linked).await.unwrap();

    let billing = BillingService::new(pool.clone(), Arc::new(UnconfiguredGateway::default()));
    let reconciliation = Reconciliation::new(billing, NotificationHandle::disabled());
    let router = BotRouter::new(pool.clone(), reconciliation, "bind-secret", 600);

    let effects = router
        .dispatch(&start_message(1, 77, &format!("/start pay_{linked}")))
        .await
        .unwrap();
    let replies = effects.reply_texts();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].contains("already connected to another Telegram chat"));

    let tenant = directory.find_by_id(linked).await.unwrap().unwrap();
    assert_eq!(tenant.telegram_chat_id, Some(55));
    assert_eq!(
        links.for_tenant(linked).await.unwrap().map(|link| link.bot_user_id),
        Some(55)
    );
    assert!(links.by_bot_user(77).await.unwrap().is_none());

    // The owner may reopen the payment link from the chat it is bound to.
    let effects = router
        .dispatch(&start_message(2, 55, &format!("/start pay_{linked}")))
        .await
        .unwrap();
    assert_eq!(effects.reply_texts(), vec!["No subscription plans are available right now."]);

    // A tenant without any chat is bound by the payment link.
    router
        .dispatch(&start_message(3, 77, &format!("/start pay_{unlinked}")))
        .await
        .unwrap();
    assert_eq!(
        links.by_bot_user(77).await.unwrap().map(|link| link.tenant_id),
        Some(unlinked)
    );
    assert_eq!(directory.notification_chat(unlinked).await.unwrap(), Some(77));
}
