//! Signing/verification key registry with time-based rotation.
//!
//! Keys live in the environment: a base unversioned name (`JWT_KEY`) and an
//! enumerated sequence (`JWT_KEY_V1`, `JWT_KEY_V2`, …) scanned contiguously
//! until the first gap. The active entry is a pure function of wall-clock
//! time and the configured rotation cycle. Entries are cached per process on
//! first lookup; `clear()` resets the cache for tests.

use std::{
    collections::HashMap,
    env,
    sync::{Arc, OnceLock, RwLock},
};

use base64::Engine;

use crate::{error::AuthError, ttl::parse_ttl};

const ROTATION_CYCLE_VAR: &str = "JWK_ROTATION_CYCLE";
const DEFAULT_ROTATION_CYCLE: i64 = 30 * 24 * 3600;

/// The three key spaces the library resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// HMAC secrets for `user` tokens (`JWT_KEY*`).
    JwtHmac,
    /// RSA private keys for `api` signing (`JWK_PRI*`), base64-encoded PEM.
    JwkPrivate,
    /// RSA public keys for `api` verification (`JWK_PUB*`), base64-encoded PEM.
    JwkPublic,
}

impl KeySpace {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::JwtHmac => "JWT_KEY",
            Self::JwkPrivate => "JWK_PRI",
            Self::JwkPublic => "JWK_PUB",
        }
    }

    /// Asymmetric key material is stored base64-encoded at rest.
    const fn base64_encoded(self) -> bool {
        !matches!(self, Self::JwtHmac)
    }
}

/// A resolved key: decoded material plus its version label (`V<N>`), absent
/// for the single unversioned key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub value: String,
    pub version: Option<String>,
}

#[derive(Debug, Default)]
pub struct KeyRegistry {
    entries: RwLock<HashMap<KeySpace, Arc<Vec<KeyEntry>>>>,
    cycle: RwLock<Option<i64>>,
}

/// Process-wide registry instance.
pub fn registry() -> &'static KeyRegistry {
    static REGISTRY: OnceLock<KeyRegistry> = OnceLock::new();
    REGISTRY.get_or_init(KeyRegistry::default)
}

impl KeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the currently active key for `space` at `now` (unix seconds).
    ///
    /// With versioned keys present, the active index is
    /// `floor(now / cycle) mod count`; a non-positive cycle pins index 0.
    /// Without versions the base key is returned with no version label.
    ///
    /// # Errors
    ///
    /// Returns an internal error when no key material is configured or the
    /// rotation cycle cannot be parsed.
    pub fn active(&self, space: KeySpace, now: i64) -> Result<KeyEntry, AuthError> {
        let entries = self.entries_for(space)?;
        if entries.is_empty() {
            return Err(missing_key(space.prefix()));
        }

        let index = if entries.len() == 1 && entries[0].version.is_none() {
            0
        } else {
            let cycle = self.rotation_cycle()?;
            if cycle <= 0 {
                0
            } else {
                usize::try_from((now / cycle).rem_euclid(entries.len() as i64)).unwrap_or(0)
            }
        };

        let entry = &entries[index];
        Ok(KeyEntry {
            value: decode_material(space, &entry.value)?,
            version: entry.version.clone(),
        })
    }

    /// Resolve key material by explicit key id (`kid`), or the base name when
    /// no `kid` is given.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the named key is not configured.
    pub fn by_kid(&self, space: KeySpace, kid: Option<&str>) -> Result<String, AuthError> {
        let Some(kid) = kid else {
            let entries = self.entries_for(space)?;
            let base = entries
                .iter()
                .find(|entry| entry.version.is_none())
                .ok_or_else(|| missing_key(space.prefix()))?;
            return decode_material(space, &base.value);
        };

        let entries = self.entries_for(space)?;
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.version.as_deref() == Some(kid))
        {
            return decode_material(space, &entry.value);
        }

        // A kid outside the contiguous scan is still honored when set.
        let name = format!("{}_{kid}", space.prefix());
        let value = env::var(&name).map_err(|_| missing_key(&name))?;
        decode_material(space, &value)
    }

    /// Rotation cycle in seconds, from `JWK_ROTATION_CYCLE` (TTL string or
    /// bare seconds, default 30 days, `"0"` disables rotation).
    ///
    /// # Errors
    ///
    /// Returns an internal error when the configured value cannot be parsed.
    pub fn rotation_cycle(&self) -> Result<i64, AuthError> {
        if let Ok(guard) = self.cycle.read()
            && let Some(cycle) = *guard
        {
            return Ok(cycle);
        }

        let cycle = match env::var(ROTATION_CYCLE_VAR) {
            Ok(raw) => parse_ttl(&raw)?,
            Err(_) => DEFAULT_ROTATION_CYCLE,
        };
        if let Ok(mut guard) = self.cycle.write() {
            *guard = Some(cycle);
        }
        Ok(cycle)
    }

    /// Drop all cached entries so the next lookup re-reads the environment.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
        if let Ok(mut cycle) = self.cycle.write() {
            *cycle = None;
        }
    }

    fn entries_for(&self, space: KeySpace) -> Result<Arc<Vec<KeyEntry>>, AuthError> {
        if let Ok(cache) = self.entries.read()
            && let Some(entries) = cache.get(&space)
        {
            return Ok(Arc::clone(entries));
        }

        let entries = Arc::new(scan_env(space.prefix()));
        if let Ok(mut cache) = self.entries.write() {
            // Concurrent first reads may both scan; they converge on the same
            // environment snapshot, so last write wins harmlessly.
            cache.insert(space, Arc::clone(&entries));
        }
        Ok(entries)
    }
}

/// Scan `<prefix>_V1`, `<prefix>_V2`, … until the first gap; fall back to the
/// base unversioned name when no versions exist.
fn scan_env(prefix: &str) -> Vec<KeyEntry> {
    let mut versioned = Vec::new();
    for n in 1.. {
        let version = format!("V{n}");
        match env::var(format!("{prefix}_{version}")) {
            Ok(value) => versioned.push(KeyEntry {
                value,
                version: Some(version),
            }),
            Err(_) => break,
        }
    }
    if !versioned.is_empty() {
        return versioned;
    }

    env::var(prefix)
        .map(|value| {
            vec![KeyEntry {
                value,
                version: None,
            }]
        })
        .unwrap_or_default()
}

fn decode_material(space: KeySpace, value: &str) -> Result<String, AuthError> {
    if !space.base64_encoded() {
        return Ok(value.to_string());
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| invalid_key(space.prefix()))?;
    String::from_utf8(decoded).map_err(|_| invalid_key(space.prefix()))
}

fn missing_key(name: &str) -> AuthError {
    AuthError::internal("MISSING_KEY", format!("Missing key material for {name}"))
}

fn invalid_key(name: &str) -> AuthError {
    AuthError::internal(
        "INVALID_KEY",
        format!("Key material for {name} is not valid base64 PEM"),
    )
}
