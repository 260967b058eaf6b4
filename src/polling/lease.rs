use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use uuid::Uuid;

/// key: poll-lease -> cluster-wide lease value object
///
/// Carried through the coordinator instead of living in module state. The
/// token identifies this holder; only a holder presenting the same token may
/// extend or release the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

impl Lease {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            token: format!("{}:{}", std::process::id(), Uuid::new_v4().simple()),
            ttl,
        }
    }

    fn ttl_millis(&self) -> u64 {
        self.ttl.as_millis().max(1) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The stored token matched and the TTL was pushed out.
    Extended,
    /// The key had expired with nobody else claiming it; it was taken back.
    Reclaimed,
    /// Somebody else holds the key now.
    Lost,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease store unavailable: {0}")]
    Store(String),
}

impl From<redis::RedisError> for LeaseError {
    fn from(err: redis::RedisError) -> Self {
        LeaseError::Store(err.to_string())
    }
}

/// Shared key-value store offering set-if-absent with TTL and compare-and-set.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_acquire(&self, lease: &Lease) -> Result<bool, LeaseError>;

    async fn renew(&self, lease: &Lease) -> Result<RenewOutcome, LeaseError>;

    /// Deletes the key only while it still holds this lease's token.
    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError>;

    async fn holder(&self, key: &str) -> Result<Option<String>, LeaseError>;
}

static RENEW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if current == ARGV[1] then
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
            return 1
        elseif not current then
            redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
            return 2
        end
        return 0
        "#,
    )
});

static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

#[derive(Clone)]
pub struct RedisLeaseStore {
    client: redis::Client,
}

impl RedisLeaseStore {
    pub fn open(url: &str) -> Result<Self, LeaseError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LeaseError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(lease.ttl_millis())
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew(&self, lease: &Lease) -> Result<RenewOutcome, LeaseError> {
        let mut conn = self.connection().await?;
        let code: i64 = RENEW_SCRIPT
            .key(&lease.key)
            .arg(&lease.token)
            .arg(lease.ttl_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(match code {
            1 => RenewOutcome::Extended,
            2 => RenewOutcome::Reclaimed,
            _ => RenewOutcome::Lost,
        })
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = RELEASE_SCRIPT
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LeaseError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }
}
