pub mod binding;
pub mod links;

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use binding::{resolve_start_payload, BindToken, BindTokenError};
pub use links::{BotLinks, TenantBotLink};

/// key: tenant-record -> columns of the CRUD-owned tenant consumed by billing
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Tenant {
    pub id: i64,
    pub public_id: Uuid,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub name: String,
    pub is_active: bool,
    pub telegram_chat_id: Option<i64>,
    pub send_to_telegram: bool,
}

/// Ways a caller may name a tenant, tried in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantIdentifier {
    Id(i64),
    PublicId(Uuid),
    ApiKey(String),
}

impl TenantIdentifier {
    /// All digits is an id, RFC 4122 text is a public id, anything else an API key.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.bytes().all(|byte| byte.is_ascii_digit()) {
            if let Ok(id) = raw.parse() {
                return Some(Self::Id(id));
            }
        }
        if let Ok(public_id) = Uuid::parse_str(raw) {
            return Some(Self::PublicId(public_id));
        }
        Some(Self::ApiKey(raw.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant not found")]
    NotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

const TENANT_COLUMNS: &str =
    "id, public_id, api_key, name, is_active, telegram_chat_id, send_to_telegram";

/// key: tenant-directory -> lookup + chat binding over the tenants table
#[derive(Clone)]
pub struct TenantDirectory {
    pool: PgPool,
}

impl TenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn resolve(&self, identifier: &TenantIdentifier) -> Result<Tenant, TenantError> {
        let tenant = match identifier {
            TenantIdentifier::Id(id) => self.find_by_id(*id).await?,
            TenantIdentifier::PublicId(public_id) => {
                sqlx::query_as::<_, Tenant>(&format!(
                    "SELECT {TENANT_COLUMNS} FROM tenants WHERE public_id = $1 AND is_active = TRUE"
                ))
                .bind(public_id)
                .fetch_optional(&self.pool)
                .await?
            }
            TenantIdentifier::ApiKey(api_key) => {
                sqlx::query_as::<_, Tenant>(&format!(
                    "SELECT {TENANT_COLUMNS} FROM tenants WHERE api_key = $1 AND is_active = TRUE"
                ))
                .bind(api_key)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        tenant.ok_or(TenantError::NotFound)
    }

    pub async fn find_by_id(&self, tenant_id: i64) -> Result<Option<Tenant>, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1 AND is_active = TRUE"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn find_by_chat(&self, chat_id: i64) -> Result<Option<Tenant>, sqlx::Error> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE telegram_chat_id = $1 AND is_active = TRUE ORDER BY id LIMIT 1"
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Points the tenant's notification channel at `chat_id`; returns the previous chat.
    pub async fn bind_chat(&self, tenant_id: i64, chat_id: i64) -> Result<Option<i64>, sqlx::Error> {
        let previous: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            UPDATE tenants AS t
            SET telegram_chat_id = $2, send_to_telegram = TRUE, updated_at = NOW()
            FROM (SELECT id, telegram_chat_id FROM tenants WHERE id = $1 FOR UPDATE) AS old
            WHERE t.id = old.id
            RETURNING old.telegram_chat_id
            "#,
        )
        .bind(tenant_id)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        let previous = previous.flatten();
        info!(%tenant_id, ?previous, %chat_id, "tenant chat binding updated");
        Ok(previous)
    }

    /// Chat that receives billing notices: the bot link first, then the tenant's own chat.
    pub async fn notification_chat(&self, tenant_id: i64) -> Result<Option<i64>, sqlx::Error> {
        if let Some(link) = BotLinks::new(self.pool.clone()).for_tenant(tenant_id).await? {
            return Ok(Some(link.notify_chat()));
        }
        Ok(self
            .find_by_id(tenant_id)
            .await?
            .filter(|tenant| tenant.send_to_telegram)
            .and_then(|tenant| tenant.telegram_chat_id))
    }
}
