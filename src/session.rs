//! Session model and access/refresh token builders.
//!
//! Flow overview:
//! 1) `create_app_token` signs a token with the active key for the session
//!    type (HMAC for `user`, RSA for `api`).
//! 2) `generate_session_tokens` mints the access/refresh pair; the refresh
//!    payload embeds the access options so a refresh alone can rebuild an
//!    equivalent pair.
//! 3) `refresh_session_tokens` / `revoke_session_token` drive the rotation
//!    and blocklist flows against the storage tiers.

use std::sync::{Arc, RwLock};

use axum::http::HeaderMap;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    blocklist::{self, REVOKED_TOKEN_MESSAGE},
    error::{AuthError, ErrorKind},
    headers::{APP_TOKEN_HEADER, cookie_value},
    jwt::{self, Algorithm, Audience, Claims, SignOptions, VerifyOptions},
    keys::{KeySpace, registry},
    store::Stores,
    ttl::{now_unix_seconds, parse_ttl},
};

/// Default per-window quota stamped on tokens that do not set one.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Hard cap on access token lifetime.
const MAX_ACCESS_TTL_SECONDS: i64 = 3600;

/// Refresh tokens must live at least this long (one week).
const MIN_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 3600;

const ACCESS_EXPIRATION: &str = "1h";
const REFRESH_EXPIRATION: &str = "1y";

/// Token/session flavor, selecting algorithm, key space and header names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    User,
    Api,
    Anonymous,
}

impl SessionType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Api => "api",
            Self::Anonymous => "anonymous",
        }
    }

    #[must_use]
    pub const fn algorithm(self) -> Algorithm {
        match self {
            Self::Api => Algorithm::Rs256,
            Self::User | Self::Anonymous => Algorithm::Hs256,
        }
    }

    pub(crate) const fn signing_space(self) -> KeySpace {
        match self {
            Self::Api => KeySpace::JwkPrivate,
            Self::User | Self::Anonymous => KeySpace::JwtHmac,
        }
    }

    pub(crate) const fn verification_space(self) -> KeySpace {
        match self {
            Self::Api => KeySpace::JwkPublic,
            Self::User | Self::Anonymous => KeySpace::JwtHmac,
        }
    }
}

/// Lifecycle state carried in response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Failed,
    Unconfirmed,
    Blocked,
    Revoked,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Unconfirmed => "unconfirmed",
            Self::Blocked => "blocked",
            Self::Revoked => "revoked",
        }
    }
}

/// The request-scoped session derived from a verified token.
#[derive(Debug, Clone)]
pub struct Session {
    /// Token id (`jti`).
    pub id: String,
    pub kind: SessionType,
    pub subject: Option<String>,
    pub rate_limit: u32,
    /// Permission strings from `aud`.
    pub scope: Vec<String>,
    pub status: SessionStatus,
    /// Claims left over after extracting the fields above.
    pub payload: Map<String, Value>,
    /// The refresh token, when known.
    pub token: Option<String>,
}

impl Session {
    /// Build a session from verified claims; the remaining claims become the
    /// open payload.
    #[must_use]
    pub fn from_claims(kind: SessionType, claims: Claims, status: SessionStatus) -> Self {
        let Claims {
            jti,
            iss,
            sub,
            aud,
            exp,
            rate_limit,
            secure_data,
            access,
            extra,
        } = claims;

        let mut payload = extra;
        if let Some(iss) = iss {
            payload.insert("iss".to_string(), Value::String(iss));
        }
        if let Some(exp) = exp {
            payload.insert("exp".to_string(), json!(exp));
        }
        if let Some(secure_data) = secure_data {
            payload.insert("secureData".to_string(), Value::String(secure_data));
        }
        if let Some(access) = access {
            payload.insert("access".to_string(), access);
        }

        Self {
            id: jti.unwrap_or_default(),
            kind,
            subject: sub,
            rate_limit: rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            scope: aud.as_ref().map(Audience::to_vec).unwrap_or_default(),
            status,
            payload,
            token: None,
        }
    }
}

/// Request-scoped slot carrying the session across the middleware stack.
///
/// The guard assigns it at most once and readers treat the value as frozen;
/// the response layer takes it back out when serializing headers.
#[derive(Debug, Clone, Default)]
pub struct SessionCell(Arc<RwLock<Option<Session>>>);

impl SessionCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Session) {
        if let Ok(mut slot) = self.0.write() {
            *slot = Some(session);
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Session> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }

    pub fn take(&self) -> Option<Session> {
        self.0.write().ok().and_then(|mut slot| slot.take())
    }

    fn set_token(&self, token: &str) {
        if let Ok(mut slot) = self.0.write()
            && let Some(session) = slot.as_mut()
        {
            session.token = Some(token.to_string());
        }
    }
}

/// Options for minting an application token. Serialized (minus the
/// encryption key) into refresh payloads under `access`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenOptions {
    #[serde(rename = "type")]
    pub kind: SessionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// TTL string or bare seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    /// Open claim map; `permissions` is promoted into `aud`, `secureData`
    /// and `rateLimit` into their reserved claims.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    /// Never serialized: an encryption key embedded in a signed-but-readable
    /// token would be public.
    #[serde(skip)]
    pub encryption_key: Option<String>,
}

impl TokenOptions {
    #[must_use]
    pub fn new(kind: SessionType) -> Self {
        Self {
            kind,
            subject: None,
            expiration: None,
            payload: None,
            encryption_key: None,
        }
    }
}

/// The freshly minted pair.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a refresh: the new pair plus the consumed token and its claims.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub old_token: String,
    pub claims: Claims,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// Explicit refresh token; falls back to the `X-Znx-App-Token` cookie.
    pub token: Option<String>,
    /// Re-supplied data key for `secureData` regeneration (refresh payloads
    /// never embed it).
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RevokeOptions {
    /// Explicit refresh token; falls back to the `X-Znx-App-Token` cookie.
    pub token: Option<String>,
    pub session_type: SessionType,
}

impl Default for RevokeOptions {
    fn default() -> Self {
        Self {
            token: None,
            session_type: SessionType::User,
        }
    }
}

/// Sign an application token for the given options.
///
/// Selects the algorithm from the session type, resolves the active signing
/// key from the registry, promotes `payload.permissions` into `aud` and
/// defaults `rateLimit` to 100.
///
/// # Errors
///
/// Fails for anonymous types, missing key material, an `api` token carrying
/// `secureData` without an encryption key, or a signing failure.
pub fn create_app_token(opts: &TokenOptions) -> Result<String, AuthError> {
    let claims = claims_from_options(opts)?;
    sign_claims(claims, opts)
}

/// Mint a short-lived access token and assign the resulting session to the
/// context with status `active`.
///
/// # Errors
///
/// Fails when the parsed expiration exceeds one hour, plus every
/// [`create_app_token`] failure.
pub fn create_access_token(cell: &SessionCell, opts: &TokenOptions) -> Result<String, AuthError> {
    if let Some(expiration) = &opts.expiration
        && parse_ttl(expiration)? > MAX_ACCESS_TTL_SECONDS
    {
        return Err(AuthError::internal(
            "INVALID_EXPIRATION",
            format!("Access token expiration cannot exceed 1h, got {expiration:?}"),
        ));
    }

    let token = create_app_token(opts)?;
    let decoded = jwt::decode(&token)?;
    cell.set(Session::from_claims(
        opts.kind,
        decoded.claims,
        SessionStatus::Active,
    ));
    Ok(token)
}

/// Mint a long-lived refresh token.
///
/// # Errors
///
/// Fails when the expiration is shorter than one week, plus every
/// [`create_app_token`] failure.
pub fn create_refresh_token(opts: &TokenOptions) -> Result<String, AuthError> {
    if let Some(expiration) = &opts.expiration
        && parse_ttl(expiration)? < MIN_REFRESH_TTL_SECONDS
    {
        return Err(AuthError::internal(
            "INVALID_EXPIRATION",
            format!("Refresh token expiration must be at least 1w, got {expiration:?}"),
        ));
    }
    create_app_token(opts)
}

/// Produce the access/refresh pair for one session.
///
/// Access lives `1h`, refresh `1y`. The refresh payload embeds the access
/// options under `access`, and the refresh token is written back into the
/// in-context session.
///
/// # Errors
///
/// Propagates the token builder failures.
pub fn generate_session_tokens(
    cell: &SessionCell,
    opts: &TokenOptions,
) -> Result<SessionTokens, AuthError> {
    let access_opts = TokenOptions {
        expiration: Some(ACCESS_EXPIRATION.to_string()),
        ..opts.clone()
    };
    let access_token = create_access_token(cell, &access_opts)?;

    let embedded = serde_json::to_value(&access_opts)
        .map_err(|err| AuthError::internal("ENCODING_FAILED", err.to_string()))?;
    let mut refresh_claims = claims_from_options(&TokenOptions {
        expiration: None,
        payload: None,
        ..opts.clone()
    })?;
    refresh_claims.access = Some(embedded);

    let refresh_opts = TokenOptions {
        expiration: Some(REFRESH_EXPIRATION.to_string()),
        ..opts.clone()
    };
    let refresh_token = sign_claims(refresh_claims, &refresh_opts)?;

    cell.set_token(&refresh_token);

    Ok(SessionTokens {
        access_token,
        refresh_token,
    })
}

/// Exchange a refresh token for a new session pair.
///
/// The token comes from the options or the `X-Znx-App-Token` cookie. It is
/// verified through the same key-resolution path as the guard (header `kid`
/// against the registry), must embed `access` options, and must not be
/// blocklisted.
///
/// # Errors
///
/// `UNAUTHORIZED` when no token can be sourced, `PERMISSION_DENIED` for a
/// blocklisted token, and the usual verification failures otherwise.
pub async fn refresh_session_tokens(
    cell: &SessionCell,
    headers: &HeaderMap,
    stores: &Stores,
    opts: RefreshOptions,
) -> Result<RefreshedTokens, AuthError> {
    let old_token = source_refresh_token(opts.token.as_deref(), headers)?;
    let claims = verify_refresh_token(&old_token, opts.encryption_key.as_deref())?;

    let Some(access) = claims.access.clone() else {
        return Err(AuthError::forbidden(
            "INVALID_TOKEN",
            "Provided token is not a refresh token.",
        ));
    };

    // Without a durable tier there is nothing to consult.
    if (stores.distributed.is_some() || stores.kv.is_some())
        && let Some(jti) = claims.jti.as_deref()
        && blocklist::check(stores, jti).await?
    {
        return Err(AuthError::permission_denied(REVOKED_TOKEN_MESSAGE));
    }

    let mut access_opts: TokenOptions = serde_json::from_value(access)
        .map_err(|_| AuthError::forbidden("INVALID_TOKEN", "Malformed refresh payload."))?;
    access_opts.encryption_key = opts.encryption_key;

    let tokens = generate_session_tokens(cell, &access_opts)?;
    Ok(RefreshedTokens {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        old_token,
        claims,
    })
}

/// Blocklist one or many tokens, returning their decoded payloads.
///
/// # Errors
///
/// Fails when any token is malformed or the storage tier is unavailable.
pub async fn revoke_app_tokens(stores: &Stores, tokens: &[String]) -> Result<Vec<Claims>, AuthError> {
    try_join_all(tokens.iter().map(|token| blocklist::add(stores, token))).await
}

/// Revoke the session's refresh token(s) and mark the in-context session
/// revoked.
///
/// Collects the sourced token (argument or cookie) plus any refresh token
/// already known to the context, blocklists them all, and assigns a
/// `revoked` session with `exp = 0`.
///
/// # Errors
///
/// `UNAUTHORIZED` when no token can be sourced, plus storage failures.
pub async fn revoke_session_token(
    cell: &SessionCell,
    headers: &HeaderMap,
    stores: &Stores,
    opts: RevokeOptions,
) -> Result<Vec<Claims>, AuthError> {
    let mut tokens = Vec::new();
    if let Ok(token) = source_refresh_token(opts.token.as_deref(), headers) {
        tokens.push(token);
    }
    if let Some(context_token) = cell.get().and_then(|session| session.token)
        && !tokens.contains(&context_token)
    {
        tokens.push(context_token);
    }
    if tokens.is_empty() {
        return Err(missing_refresh_token());
    }

    let revoked = revoke_app_tokens(stores, &tokens).await?;

    let mut claims = revoked.first().cloned().unwrap_or_default();
    claims.exp = Some(0);
    cell.set(Session::from_claims(
        opts.session_type,
        claims,
        SessionStatus::Revoked,
    ));

    Ok(revoked)
}

/// Verify a refresh token using the registry key named by its own header.
fn verify_refresh_token(
    token: &str,
    encryption_key: Option<&str>,
) -> Result<Claims, AuthError> {
    let decoded = jwt::decode(token)?;
    let space = if decoded.header.alg.is_rsa() {
        KeySpace::JwkPublic
    } else {
        KeySpace::JwtHmac
    };
    let secret = registry().by_kid(space, decoded.header.kid.as_deref())?;

    jwt::verify(
        token,
        &secret,
        &VerifyOptions {
            algorithm: Some(decoded.header.alg),
            encryption_key: encryption_key.map(ToString::to_string),
            ..VerifyOptions::default()
        },
    )
}

fn source_refresh_token(token: Option<&str>, headers: &HeaderMap) -> Result<String, AuthError> {
    if let Some(token) = token.filter(|token| !token.is_empty()) {
        return Ok(token.to_string());
    }
    cookie_value(headers, APP_TOKEN_HEADER).ok_or_else(missing_refresh_token)
}

fn missing_refresh_token() -> AuthError {
    AuthError::new(
        ErrorKind::Unauthorized,
        "INVALID_TOKEN",
        "Refresh token is missing or invalid.",
    )
}

/// Build reserved claims from the open payload map: `permissions` lands in
/// `aud`, `secureData` and `rateLimit` in their claims, the rest stays open.
fn claims_from_options(opts: &TokenOptions) -> Result<Claims, AuthError> {
    let mut claims = Claims {
        sub: opts.subject.clone(),
        rate_limit: Some(DEFAULT_RATE_LIMIT),
        ..Claims::default()
    };

    let Some(payload) = &opts.payload else {
        return Ok(claims);
    };

    let mut extra = payload.clone();
    if let Some(permissions) = extra.remove("permissions") {
        claims.aud = Some(audience_from_value(permissions)?);
    }
    if let Some(value) = extra.remove("rateLimit") {
        let rate_limit = value
            .as_u64()
            .and_then(|limit| u32::try_from(limit).ok())
            .ok_or_else(|| {
                AuthError::internal("ENCODING_FAILED", "rateLimit must be a non-negative integer")
            })?;
        claims.rate_limit = Some(rate_limit);
    }
    if let Some(value) = extra.remove("secureData") {
        let Value::String(secure_data) = value else {
            return Err(AuthError::internal(
                "ENCODING_FAILED",
                "secureData must be a string",
            ));
        };
        claims.secure_data = Some(secure_data);
    }
    if let Some(Value::String(jti)) = extra.remove("jti") {
        claims.jti = Some(jti);
    }
    claims.extra = extra;

    Ok(claims)
}

fn audience_from_value(value: Value) -> Result<Audience, AuthError> {
    let audience: Audience = serde_json::from_value(value).map_err(|_| {
        AuthError::internal(
            "ENCODING_FAILED",
            "permissions must be a string or a list of strings",
        )
    })?;
    Ok(audience)
}

fn sign_claims(claims: Claims, opts: &TokenOptions) -> Result<String, AuthError> {
    if opts.kind == SessionType::Anonymous {
        return Err(AuthError::internal(
            "INVALID_SESSION_TYPE",
            "Anonymous sessions do not carry signed tokens",
        ));
    }
    if opts.kind == SessionType::Api
        && claims.secure_data.is_some()
        && opts.encryption_key.is_none()
    {
        return Err(AuthError::internal(
            "MISSING_ENCRYPTION_KEY",
            "api tokens with secureData require an encryption key",
        ));
    }

    let key = registry().active(opts.kind.signing_space(), now_unix_seconds())?;
    jwt::create(
        claims,
        &key.value,
        &SignOptions {
            algorithm: opts.kind.algorithm(),
            expiration: opts.expiration.clone(),
            kid: key.version,
            encryption_key: opts.encryption_key.clone(),
        },
    )
}
