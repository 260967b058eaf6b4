use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use subscription_engine::billing::{
    gateway_from_env, spawn_billing_scheduler, start_notification_worker, BillingService,
    NotificationHandle, Reconciliation,
};
use subscription_engine::bot::BotRouter;
use subscription_engine::config;
use subscription_engine::ledger::PgUpdateLedger;
use subscription_engine::routes::api_routes;
use subscription_engine::telegram::{ChatGateway, RetryPolicy, TelegramClient};
use subscription_engine::tenants::TenantDirectory;
use subscription_engine::webhooks::TelegramIntake;

async fn root() -> &'static str {
    "Subscription Engine API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if either signing secret is missing
    let _ = config::JWT_SECRET.as_str();
    let _ = config::BIND_TOKEN_SECRET.as_str();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let chat: Option<Arc<dyn ChatGateway>> =
        TelegramClient::from_env()?.map(|client| Arc::new(client) as Arc<dyn ChatGateway>);
    let retry = RetryPolicy::from_env();
    let notifier = match &chat {
        Some(gateway) => start_notification_worker(pool.clone(), gateway.clone(), retry),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN not set; chat notifications disabled");
            NotificationHandle::disabled()
        }
    };

    let billing = BillingService::new(pool.clone(), gateway_from_env()?);
    let reconciliation = Reconciliation::new(billing.clone(), notifier);
    let intake = TelegramIntake::new(
        Arc::new(PgUpdateLedger::new(pool.clone())),
        Arc::new(BotRouter::from_env(pool.clone(), reconciliation.clone())),
        chat.clone(),
    );
    spawn_billing_scheduler(pool.clone(), chat, retry);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(billing))
        .layer(Extension(reconciliation))
        .layer(Extension(TenantDirectory::new(pool)))
        .layer(Extension(intake));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
