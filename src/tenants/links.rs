use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};

/// key: bot-link -> chat identity attributed to a tenant
#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct TenantBotLink {
    pub id: i64,
    pub bot_user_id: i64,
    pub chat_id: Option<i64>,
    pub tenant_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantBotLink {
    /// Where notifications go: the bound chat, else the private chat with the user.
    pub fn notify_chat(&self) -> i64 {
        self.chat_id.unwrap_or(self.bot_user_id)
    }
}

#[derive(Clone)]
pub struct BotLinks {
    pool: PgPool,
}

impl BotLinks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates or moves the link so that `bot_user_id` and `tenant_id` each appear once.
    ///
    /// When the user is already linked elsewhere and the tenant has a link of its
    /// own, the tenant-keyed row is discarded and the user-keyed row is re-pointed.
    pub async fn upsert(
        &self,
        bot_user_id: i64,
        chat_id: i64,
        tenant_id: i64,
    ) -> Result<TenantBotLink, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let by_user = sqlx::query_as::<_, TenantBotLink>(
            "SELECT * FROM tenant_bot_links WHERE bot_user_id = $1 FOR UPDATE",
        )
        .bind(bot_user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let by_tenant = sqlx::query_as::<_, TenantBotLink>(
            "SELECT * FROM tenant_bot_links WHERE tenant_id = $1 FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let keep = match (by_user, by_tenant) {
            (Some(user_link), Some(tenant_link)) if user_link.id != tenant_link.id => {
                warn!(
                    %bot_user_id,
                    %chat_id,
                    user_link_tenant = user_link.tenant_id,
                    target_tenant = %tenant_id,
                    stale_link = tenant_link.id,
                    "bot link collision; keeping the bot-user row"
                );
                sqlx::query("DELETE FROM tenant_bot_links WHERE id = $1")
                    .bind(tenant_link.id)
                    .execute(&mut *tx)
                    .await?;
                Some(user_link)
            }
            (Some(link), _) | (None, Some(link)) => Some(link),
            (None, None) => None,
        };

        let link = match keep {
            Some(existing) => {
                sqlx::query_as::<_, TenantBotLink>(
                    r#"
                    UPDATE tenant_bot_links
                    SET bot_user_id = $2, chat_id = $3, tenant_id = $4, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(existing.id)
                .bind(bot_user_id)
                .bind(chat_id)
                .bind(tenant_id)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, TenantBotLink>(
                    r#"
                    INSERT INTO tenant_bot_links (bot_user_id, chat_id, tenant_id)
                    VALUES ($1, $2, $3)
                    RETURNING *
                    "#,
                )
                .bind(bot_user_id)
                .bind(chat_id)
                .bind(tenant_id)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        info!(%bot_user_id, %chat_id, %tenant_id, "bot link upserted");
        Ok(link)
    }

    pub async fn by_bot_user(&self, bot_user_id: i64) -> Result<Option<TenantBotLink>, sqlx::Error> {
        sqlx::query_as::<_, TenantBotLink>("SELECT * FROM tenant_bot_links WHERE bot_user_id = $1")
            .bind(bot_user_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn for_tenant(&self, tenant_id: i64) -> Result<Option<TenantBotLink>, sqlx::Error> {
        sqlx::query_as::<_, TenantBotLink>("SELECT * FROM tenant_bot_links WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
    }
}
