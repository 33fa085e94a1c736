//! Fixed-window rate limiting with failed-attempt accounting.
//!
//! Two implementations share one observable contract: against a distributed
//! store a single atomic script performs the whole read-modify-write; against
//! the local cache the same logic runs inside the per-key mutex. Windows
//! reset implicitly when the primary key's TTL lapses.

use std::{
    collections::HashMap,
    env,
    sync::{OnceLock, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::AuthError,
    store::{Stores, store_failed},
    ttl::now_unix_seconds,
};

/// Cache key namespace for window records.
pub const RATE_LIMIT_KEY_PREFIX: &str = "zanix:rate-limit:";

/// Suffix of the companion failed-attempts counter.
pub const FAILED_ATTEMPTS_SUFFIX: &str = ":failed-attempts";

const WINDOW_SECONDS_VAR: &str = "RATE_LIMIT_WINDOW_SECONDS";
const PLANS_VAR: &str = "RATE_LIMIT_PLANS";
const DEFAULT_WINDOW_SECONDS: i64 = 60;
const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 3;

/// The failed-attempts counter outlives the window it reports on.
const FAILED_ATTEMPTS_TTL_FACTOR: i64 = 2;

/// Atomic window script for the distributed tier. Mirrors the local path:
/// create-or-increment the record, preserve the window TTL, account denials
/// in the companion counter and clear it once it reaches the cap.
const RATE_LIMIT_SCRIPT: &str = r"
local max = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_failed = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local record = redis.call('GET', KEYS[1])
if not record then
  redis.call('SET', KEYS[1], cjson.encode({ count = 1, createdAt = now }), 'EX', window)
  redis.call('SET', KEYS[2], '0', 'EX', window * 2)
  return cjson.encode({ count = 1, createdAt = now, failedAttempts = 0, canContinue = max >= 1 })
end

local current = cjson.decode(record)
if current.count < max then
  local pre = current.count
  current.count = current.count + 1
  local remaining = redis.call('TTL', KEYS[1])
  if remaining > 0 then
    redis.call('SET', KEYS[1], cjson.encode(current), 'EX', remaining)
  else
    redis.call('SET', KEYS[1], cjson.encode(current))
  end
  local failed = tonumber(redis.call('GET', KEYS[2]) or '0')
  return cjson.encode({ count = pre, createdAt = current.createdAt,
                        failedAttempts = failed, canContinue = true })
end

local failed = tonumber(redis.call('GET', KEYS[2]) or '0') + 1
local stored = failed
if failed >= max_failed then
  stored = 0
end
redis.call('SET', KEYS[2], tostring(stored), 'EX', window * 2)
return cjson.encode({ count = current.count, createdAt = current.createdAt,
                      failedAttempts = failed, canContinue = false })
";

#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    /// Fully qualified cache key for the window record.
    pub key: String,
    /// Requests admitted per window.
    pub max_requests: u32,
    pub window_seconds: i64,
    /// Denials tolerated before the counter is reported and re-armed.
    pub max_failed_attempts: u32,
}

impl RateLimitOptions {
    #[must_use]
    pub fn new(key: impl Into<String>, max_requests: u32) -> Self {
        Self {
            key: key.into(),
            max_requests,
            window_seconds: window_from_env(),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}

/// Stored window record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateLimitRecord {
    count: u32,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

/// Observable result of a window check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOutcome {
    pub count: u32,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "failedAttempts")]
    pub failed_attempts: u32,
    #[serde(rename = "canContinue")]
    pub can_continue: bool,
}

impl RateLimitOutcome {
    /// Seconds until the current window lapses.
    #[must_use]
    pub fn retry_after(&self, window_seconds: i64, now: i64) -> i64 {
        (self.created_at + window_seconds - now).max(0)
    }
}

/// Count a request against `opts.key` and report whether it may continue.
///
/// # Errors
///
/// Fails when the storage tier or the atomic script is unavailable.
pub async fn check(stores: &Stores, opts: &RateLimitOptions) -> Result<RateLimitOutcome, AuthError> {
    if let Some(distributed) = &stores.distributed {
        let keys = vec![
            opts.key.clone(),
            format!("{}{FAILED_ATTEMPTS_SUFFIX}", opts.key),
        ];
        let args = vec![
            opts.max_requests.to_string(),
            opts.window_seconds.to_string(),
            opts.max_failed_attempts.to_string(),
            now_unix_seconds().to_string(),
        ];
        let raw = distributed
            .eval(RATE_LIMIT_SCRIPT, &keys, &args)
            .await
            .map_err(store_failed)?;
        return serde_json::from_str(&raw).map_err(|err| {
            AuthError::internal("STORE_FAILED", format!("Bad rate-limit script result: {err}"))
        });
    }

    // The mutex makes the read-modify-write exclusive per key; no two
    // concurrent callers can act on the same snapshot.
    let _guard = stores.local.lock(&opts.key).await;
    Ok(check_local(stores, opts).await)
}

async fn check_local(stores: &Stores, opts: &RateLimitOptions) -> RateLimitOutcome {
    let now = now_unix_seconds();
    let failed_key = format!("{}{FAILED_ATTEMPTS_SUFFIX}", opts.key);
    let failed_ttl = opts.window_seconds * FAILED_ATTEMPTS_TTL_FACTOR;

    let record = match stores.local.get(&opts.key).await {
        Some(raw) => serde_json::from_str::<RateLimitRecord>(&raw).ok(),
        None => None,
    };

    let Some(mut record) = record else {
        // First observation opens the window and arms the failure counter.
        let record = RateLimitRecord {
            count: 1,
            created_at: now,
        };
        store_record(stores, &opts.key, &record, record.created_at + opts.window_seconds).await;
        stores.local.set(&failed_key, "0", Some(failed_ttl)).await;
        return RateLimitOutcome {
            count: 1,
            created_at: now,
            failed_attempts: 0,
            can_continue: opts.max_requests >= 1,
        };
    };

    if record.count < opts.max_requests {
        let pre_increment = record.count;
        record.count += 1;
        store_record(
            stores,
            &opts.key,
            &record,
            record.created_at + opts.window_seconds,
        )
        .await;
        let failed_attempts = read_counter(stores, &failed_key).await;
        return RateLimitOutcome {
            count: pre_increment,
            created_at: record.created_at,
            failed_attempts,
            can_continue: true,
        };
    }

    let failed_attempts = read_counter(stores, &failed_key).await + 1;
    // Once the cap is reached the counter re-arms so escalation logging
    // fires again on the next cycle.
    let stored = if failed_attempts >= opts.max_failed_attempts {
        0
    } else {
        failed_attempts
    };
    stores
        .local
        .set(&failed_key, stored.to_string(), Some(failed_ttl))
        .await;

    RateLimitOutcome {
        count: record.count,
        created_at: record.created_at,
        failed_attempts,
        can_continue: false,
    }
}

async fn store_record(stores: &Stores, key: &str, record: &RateLimitRecord, expires_at: i64) {
    match serde_json::to_string(record) {
        Ok(json) => stores.local.set_until(key, json, Some(expires_at)).await,
        Err(err) => warn!(error = %err, "failed to serialize rate-limit record"),
    }
}

async fn read_counter(stores: &Stores, key: &str) -> u32 {
    stores
        .local
        .get(key)
        .await
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Window length from `RATE_LIMIT_WINDOW_SECONDS`, default 60.
#[must_use]
pub fn window_from_env() -> i64 {
    env::var(WINDOW_SECONDS_VAR)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|&seconds| seconds > 0)
        .unwrap_or(DEFAULT_WINDOW_SECONDS)
}

/// Map a session rate limit through the configured plan table.
///
/// With `RATE_LIMIT_PLANS` (`"idx:max;idx:max;…"`) configured the session
/// value is treated as an index into the table; otherwise, or for an unknown
/// index, it is the quota itself.
#[must_use]
pub fn plan_lookup(session_rate_limit: u32) -> u32 {
    let table = plans();
    if let Ok(guard) = table.read()
        && let Some(parsed) = guard.as_ref()
    {
        return resolve_plan(parsed.as_ref(), session_rate_limit);
    }

    let parsed = load_plans();
    let resolved = resolve_plan(parsed.as_ref(), session_rate_limit);
    if let Ok(mut guard) = table.write() {
        *guard = Some(parsed);
    }
    resolved
}

/// Drop the cached plan table so the next lookup re-reads the environment.
pub fn clear_plans() {
    if let Ok(mut guard) = plans().write() {
        *guard = None;
    }
}

fn plans() -> &'static RwLock<Option<Option<HashMap<u32, u32>>>> {
    static PLANS: OnceLock<RwLock<Option<Option<HashMap<u32, u32>>>>> = OnceLock::new();
    PLANS.get_or_init(|| RwLock::new(None))
}

fn resolve_plan(table: Option<&HashMap<u32, u32>>, session_rate_limit: u32) -> u32 {
    table
        .and_then(|table| table.get(&session_rate_limit).copied())
        .unwrap_or(session_rate_limit)
}

fn load_plans() -> Option<HashMap<u32, u32>> {
    let raw = env::var(PLANS_VAR).ok()?;
    let mut table = HashMap::new();
    for pair in raw.split(';').filter(|pair| !pair.trim().is_empty()) {
        let Some((index, max)) = pair.split_once(':') else {
            warn!(%pair, "skipping malformed rate-limit plan entry");
            continue;
        };
        match (index.trim().parse(), max.trim().parse()) {
            (Ok(index), Ok(max)) => {
                table.insert(index, max);
            }
            _ => warn!(%pair, "skipping malformed rate-limit plan entry"),
        }
    }
    Some(table)
}
