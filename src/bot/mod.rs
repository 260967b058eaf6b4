pub mod commands;
pub mod router;

use async_trait::async_trait;
use thiserror::Error;

use crate::billing::BillingError;
use crate::telegram::{SideEffects, Update};
use crate::tenants::TenantError;

pub use commands::{BotCommand, CallbackAction};
pub use router::BotRouter;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error("{0}")]
    Message(String),
}

/// key: event-dispatcher -> per-update handler driven by the poller and the webhook intake
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, update: &Update) -> Result<SideEffects, DispatchError>;
}
