use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use subscription_engine::billing::{
    gateway_from_env, start_notification_worker, BillingService, Reconciliation,
};
use subscription_engine::bot::BotRouter;
use subscription_engine::config::{self, PollingSettings};
use subscription_engine::ledger::PgUpdateLedger;
use subscription_engine::polling::{PollLock, PollingCoordinator, RedisLeaseStore, StopReason};
use subscription_engine::telegram::{ChatGateway, RetryPolicy, TelegramClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    if *config::TELEGRAM_USE_WEBHOOK {
        info!("TELEGRAM_USE_WEBHOOK is set; updates arrive via webhook, poller not started");
        return Ok(());
    }
    let Some(client) = TelegramClient::from_env()? else {
        anyhow::bail!("TELEGRAM_BOT_TOKEN is not set; refusing to start polling");
    };
    let _ = config::BIND_TOKEN_SECRET.as_str();

    let pool = PgPoolOptions::new()
        .max_connections(3)
        .connect(config::DATABASE_URL.as_str())
        .await?;
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let settings = PollingSettings::from_env();
    let retry = RetryPolicy::from_env();
    let gateway: Arc<dyn ChatGateway> = Arc::new(client);

    let notifier = start_notification_worker(pool.clone(), gateway.clone(), retry);
    let billing = BillingService::new(pool.clone(), gateway_from_env()?);
    let reconciliation = Reconciliation::new(billing, notifier);
    let router = BotRouter::from_env(pool.clone(), reconciliation);

    let store = Arc::new(RedisLeaseStore::open(config::REDIS_URL.as_str())?);
    let lock = PollLock::new(
        settings.lock_file.clone(),
        store,
        settings.lock_key.clone(),
        settings.lock_ttl,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing in-flight update");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut coordinator = PollingCoordinator::new(
        gateway,
        Arc::new(PgUpdateLedger::new(pool)),
        Arc::new(router),
        lock,
        settings,
        retry,
    )
    .with_cursor(*config::TELEGRAM_POLLING_OFFSET);
    match coordinator.run(shutdown_rx).await {
        Ok(StopReason::Shutdown) => Ok(()),
        Ok(reason) => {
            error!(?reason, "polling stopped; restart is left to the supervisor");
            anyhow::bail!("polling stopped: {reason:?}")
        }
        Err(err) => {
            error!(?err, "polling could not run");
            Err(err.into())
        }
    }
}
