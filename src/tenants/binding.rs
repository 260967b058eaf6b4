use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use super::{Tenant, TenantDirectory};

/// key: bind-token -> signed, time-boxed `/start` payload linking a chat to a tenant
pub const BIND_PREFIX: &str = "bind_";
const BIND_SALT: &str = "subscriptions.telegram.bind.v1";
const SIGNATURE_HEX_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum BindTokenError {
    #[error("bind token is malformed")]
    Malformed,
    #[error("bind token has expired")]
    Expired,
    #[error("bind token signature does not match")]
    BadSignature,
    #[error("bind token refers to an unknown or inactive tenant")]
    UnknownTenant,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindToken {
    pub tenant_id: i64,
    pub issued_at: i64,
    signature: String,
}

impl BindToken {
    /// Renders `bind_<tenant_id>_<issued_at base36>_<signature>`.
    pub fn issue(tenant_id: i64, api_key: &str, secret: &str, issued_at: i64) -> String {
        let signature = hex::encode(mac(secret, tenant_id, api_key, issued_at).finalize().into_bytes());
        format!(
            "{BIND_PREFIX}{tenant_id}_{}_{}",
            to_base36(issued_at),
            &signature[..SIGNATURE_HEX_LEN]
        )
    }

    pub fn parse(payload: &str) -> Result<Self, BindTokenError> {
        let body = payload
            .trim()
            .strip_prefix(BIND_PREFIX)
            .ok_or(BindTokenError::Malformed)?;
        let mut parts = body.split('_');
        let (Some(tenant_raw), Some(timestamp_raw), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BindTokenError::Malformed);
        };

        if tenant_raw.is_empty() || !tenant_raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(BindTokenError::Malformed);
        }
        let tenant_id = tenant_raw
            .parse::<i64>()
            .map_err(|_| BindTokenError::Malformed)?;
        let issued_at =
            i64::from_str_radix(timestamp_raw, 36).map_err(|_| BindTokenError::Malformed)?;
        if signature.len() != SIGNATURE_HEX_LEN
            || !signature.bytes().all(|byte| byte.is_ascii_hexdigit())
        {
            return Err(BindTokenError::Malformed);
        }

        Ok(Self {
            tenant_id,
            issued_at,
            signature: signature.to_ascii_lowercase(),
        })
    }

    pub fn is_expired(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.issued_at > max_age_secs
    }

    /// Constant-time check of the truncated signature.
    pub fn verify_signature(&self, api_key: &str, secret: &str) -> Result<(), BindTokenError> {
        let expected = hex::decode(&self.signature).map_err(|_| BindTokenError::Malformed)?;
        mac(secret, self.tenant_id, api_key, self.issued_at)
            .verify_truncated_left(&expected)
            .map_err(|_| BindTokenError::BadSignature)
    }
}

/// Resolves a `/start` payload to the active tenant it was issued for.
pub async fn resolve_start_payload(
    directory: &TenantDirectory,
    payload: &str,
    secret: &str,
    max_age_secs: i64,
    now: i64,
) -> Result<Tenant, BindTokenError> {
    let token = BindToken::parse(payload)?;
    if token.is_expired(now, max_age_secs) {
        return Err(BindTokenError::Expired);
    }
    let tenant = directory
        .find_by_id(token.tenant_id)
        .await?
        .ok_or(BindTokenError::UnknownTenant)?;
    token.verify_signature(&tenant.api_key, secret)?;
    Ok(tenant)
}

fn mac(secret: &str, tenant_id: i64, api_key: &str, issued_at: i64) -> Hmac<Sha256> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(format!("{BIND_SALT}:{tenant_id}:{api_key}:{issued_at}").as_bytes());
    mac
}

fn to_base36(mut value: i64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value <= 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
