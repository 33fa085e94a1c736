//! One-time numeric codes bound to a target with TTL and single-use verify.

use tracing::debug;

use crate::{
    crypto::random_digits,
    error::AuthError,
    store::{Stores, store_failed},
};

/// Cache key namespace for stored codes.
pub const OTP_KEY_PREFIX: &str = "zanix:otp:";

const DEFAULT_EXP_SECONDS: i64 = 300;
const DEFAULT_LENGTH: usize = 6;

#[derive(Debug, Clone)]
pub struct OtpOptions {
    /// Identifier the code is bound to (email, phone, user id).
    pub target: String,
    /// Code lifetime in seconds.
    pub exp: i64,
    /// Number of digits.
    pub length: usize,
}

impl OtpOptions {
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            exp: DEFAULT_EXP_SECONDS,
            length: DEFAULT_LENGTH,
        }
    }
}

/// Generate and store a fresh code for `opts.target`, replacing any previous
/// one.
///
/// # Errors
///
/// Fails when randomness or the storage tier is unavailable.
pub async fn generate(stores: &Stores, opts: &OtpOptions) -> Result<String, AuthError> {
    let code = random_digits(opts.length)?;
    let key = format!("{OTP_KEY_PREFIX}{}", opts.target);

    if let Some(distributed) = &stores.distributed {
        distributed
            .set(&key, &code, Some(opts.exp))
            .await
            .map_err(store_failed)?;
    } else {
        stores.local.set(&key, code.clone(), Some(opts.exp)).await;
    }

    debug!(target = %opts.target, "one-time code stored");
    Ok(code)
}

/// Compare `code` against the stored value for `target`.
///
/// A match consumes the code: it is deleted from both tiers so a second
/// verification fails. An empty code never matches.
///
/// # Errors
///
/// Fails when the storage tier is unavailable.
pub async fn verify(stores: &Stores, target: &str, code: &str) -> Result<bool, AuthError> {
    if code.is_empty() {
        return Ok(false);
    }

    let key = format!("{OTP_KEY_PREFIX}{target}");
    let stored = match &stores.distributed {
        Some(distributed) => distributed.get(&key).await.map_err(store_failed)?,
        None => stores.local.get(&key).await,
    };

    let matched = stored.as_deref() == Some(code);
    if matched {
        if let Some(distributed) = &stores.distributed {
            distributed.delete(&key).await.map_err(store_failed)?;
        }
        stores.local.delete(&key).await;
    }
    Ok(matched)
}
