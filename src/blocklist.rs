//! Revoked-token records keyed by `jti` across the storage tiers.
//!
//! Entries carry the token's remaining lifetime as their TTL, so the
//! blocklist never outgrows the set of tokens that could still verify.

use tracing::debug;

use crate::{
    error::AuthError,
    jwt::{self, Claims},
    store::{Stores, store_failed},
    ttl::now_unix_seconds,
};

/// Cache key namespace for blocklist entries.
pub const BLOCKLIST_KEY_PREFIX: &str = "zanix:jwt-block-list:";

/// Denial message for tokens found on the blocklist.
pub const REVOKED_TOKEN_MESSAGE: &str = "The provided token has been revoked or is blocklisted.";

/// Bound on how long a KV hit may linger in the local cache, so a backfilled
/// entry cannot outlive the token's expiry by more than this.
const LOCAL_BACKFILL_TTL: i64 = 60;

/// Record `token` as revoked until its own expiry.
///
/// The token is decoded without verification; an already-expired token is
/// returned untouched and never written. Returns the decoded payload either
/// way.
///
/// # Errors
///
/// Fails when the token is malformed or the storage tier is unavailable.
pub async fn add(stores: &Stores, token: &str) -> Result<Claims, AuthError> {
    let decoded = jwt::decode(token)?;
    let claims = decoded.claims;

    let Some(jti) = claims.jti.clone() else {
        // Without an id there is nothing to key the entry on.
        return Ok(claims);
    };

    // Tokens without `exp` never expire on their own, so the entry gets no
    // TTL either.
    let ttl = match claims.exp {
        Some(exp) => {
            let remaining = exp - now_unix_seconds();
            if remaining <= 0 {
                return Ok(claims);
            }
            Some(remaining)
        }
        None => None,
    };

    let key = format!("{BLOCKLIST_KEY_PREFIX}{jti}");
    if let Some(distributed) = &stores.distributed {
        distributed
            .set(&key, "true", ttl)
            .await
            .map_err(store_failed)?;
    } else {
        stores.local.set(&key, "true", ttl).await;
        if let Some(kv) = &stores.kv {
            kv.set(&key, "true", ttl).await.map_err(store_failed)?;
        }
    }

    debug!(%jti, "token blocklisted");
    Ok(claims)
}

/// Whether `jti` is currently blocklisted.
///
/// With a distributed store configured it is consulted exclusively.
/// Otherwise the local cache is checked first and a KV hit is backfilled
/// into it.
///
/// # Errors
///
/// Fails when the storage tier is unavailable.
pub async fn check(stores: &Stores, jti: &str) -> Result<bool, AuthError> {
    let key = format!("{BLOCKLIST_KEY_PREFIX}{jti}");

    if let Some(distributed) = &stores.distributed {
        let value = distributed.get(&key).await.map_err(store_failed)?;
        return Ok(value.is_some());
    }

    if stores.local.get(&key).await.is_some() {
        return Ok(true);
    }

    let Some(kv) = &stores.kv else {
        return Ok(false);
    };
    match kv.get(&key).await.map_err(store_failed)? {
        Some(value) => {
            stores
                .local
                .set(&key, value, Some(LOCAL_BACKFILL_TTL))
                .await;
            Ok(true)
        }
        None => Ok(false),
    }
}
