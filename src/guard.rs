//! Request guards and the session-headers response layer.
//!
//! Flow overview per request:
//! 1) `session_headers_layer` (outermost) creates the [`SessionCell`] and,
//!    after the inner stack ran, serializes the assigned session into
//!    response headers.
//! 2) `auth_guard` extracts the bearer token, resolves the verification key,
//!    verifies the token, consults the blocklist, assigns the session and
//!    applies the rate limit.
//! 3) Failure responses short-circuit with default session headers so the
//!    client always learns the attempt's status.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, header::{AUTHORIZATION, RETRY_AFTER}},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::{
    blocklist::{self, REVOKED_TOKEN_MESSAGE},
    error::AuthError,
    headers::{
        RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER,
        default_session_headers, headers_for_session,
    },
    jwt::{self, DEFAULT_JWT_ISSUER, VerifyOptions},
    keys::registry,
    rate_limit::{self, RATE_LIMIT_KEY_PREFIX, RateLimitOptions},
    scope,
    session::{Session, SessionCell, SessionStatus, SessionType},
    store::Stores,
    ttl::now_unix_seconds,
};

/// Body message for requests without a usable bearer token.
pub const MISSING_BEARER_MESSAGE: &str = "Authorization token is missing or invalid.";

/// Authorization header consulted per session type.
const API_AUTHORIZATION_HEADER: &str = "x-znx-authorization";

/// Default per-window quota for anonymous callers of the standalone
/// rate-limit guard.
const DEFAULT_ANONYMOUS_LIMIT: u32 = 100;

/// Configured authentication guard, registered as axum middleware via
/// [`auth_guard`].
#[derive(Clone)]
pub struct AuthGuard {
    kind: SessionType,
    issuer: Option<String>,
    subject: Option<String>,
    permissions: Vec<String>,
    encryption_key: Option<String>,
    rate_limit: bool,
    stores: Stores,
}

impl AuthGuard {
    #[must_use]
    pub fn new(kind: SessionType, stores: Stores) -> Self {
        Self {
            kind,
            issuer: Some(DEFAULT_JWT_ISSUER.to_string()),
            subject: None,
            permissions: Vec::new(),
            encryption_key: None,
            rate_limit: true,
            stores,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer;
        self
    }

    /// Pin the expected subject instead of trusting the client-claimed one.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Required permissions, checked any-of against the token audience.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, enabled: bool) -> Self {
        self.rate_limit = enabled;
        self
    }

    /// Run the full authentication sequence: bearer extraction, key
    /// resolution, verification, blocklist check, session assignment, rate
    /// limit.
    ///
    /// On success the session is in the cell (status `active`, verified
    /// token recorded) and the returned headers carry the rate-limit state.
    ///
    /// # Errors
    ///
    /// Returns the finished failure response, already decorated with default
    /// session headers.
    pub async fn authorize(
        &self,
        request_headers: &HeaderMap,
        cell: &SessionCell,
    ) -> Result<HeaderMap, Box<Response>> {
        let Some(token) = bearer_token(request_headers, self.kind) else {
            return Err(self.failure(
                request_headers,
                AuthError::unauthorized(MISSING_BEARER_MESSAGE),
                SessionStatus::Failed,
                HeaderMap::new(),
                cell,
            ));
        };

        let claims = match self.verify_token(request_headers, &token) {
            Ok(claims) => claims,
            Err(err) => {
                return Err(self.failure(
                    request_headers,
                    err,
                    SessionStatus::Failed,
                    HeaderMap::new(),
                    cell,
                ));
            }
        };

        let listed = match claims.jti.as_deref() {
            Some(jti) => blocklist::check(&self.stores, jti).await,
            None => Ok(false),
        };
        match listed {
            Ok(false) => {}
            Ok(true) => {
                return Err(self.failure(
                    request_headers,
                    AuthError::permission_denied(REVOKED_TOKEN_MESSAGE),
                    SessionStatus::Failed,
                    HeaderMap::new(),
                    cell,
                ));
            }
            Err(err) => {
                return Err(self.failure(
                    request_headers,
                    err,
                    SessionStatus::Failed,
                    HeaderMap::new(),
                    cell,
                ));
            }
        }

        cell.set(Session::from_claims(
            self.kind,
            claims,
            SessionStatus::Unconfirmed,
        ));

        let mut rate_headers = HeaderMap::new();
        if self.rate_limit {
            let limiter = RateLimitGuard::new(self.stores.clone()).with_anonymous_limit(0);
            match limiter.check(request_headers, cell).await {
                Ok(headers) => rate_headers = headers,
                Err(denial) => {
                    return Err(self.failure(
                        request_headers,
                        denial.error,
                        SessionStatus::Blocked,
                        denial.headers,
                        cell,
                    ));
                }
            }
        }

        if let Some(mut session) = cell.take() {
            session.status = SessionStatus::Active;
            session.token = Some(token);
            debug!(session_id = %session.id, "session authenticated");
            cell.set(session);
        }

        Ok(rate_headers)
    }

    fn verify_token(&self, request_headers: &HeaderMap, token: &str) -> Result<jwt::Claims, AuthError> {
        let decoded = jwt::decode(token)?;
        let secret = registry().by_kid(
            self.kind.verification_space(),
            decoded.header.kid.as_deref(),
        )?;

        let subject = self
            .subject
            .clone()
            .or_else(|| crate::headers::client_subject(request_headers, self.kind));

        jwt::verify(
            token,
            &secret,
            &VerifyOptions {
                algorithm: Some(self.kind.algorithm()),
                issuer: self.issuer.clone(),
                subject,
                audience: self.permissions.clone(),
                encryption_key: self.encryption_key.clone(),
                now: None,
            },
        )
    }

    fn failure(
        &self,
        request_headers: &HeaderMap,
        error: AuthError,
        status: SessionStatus,
        extra_headers: HeaderMap,
        cell: &SessionCell,
    ) -> Box<Response> {
        // Drop any partially-assigned session so the response layer does not
        // serialize it on top of the failure headers.
        let _ = cell.take();
        let mut response = error.into_response();
        response
            .headers_mut()
            .extend(default_session_headers(request_headers, self.kind, status));
        response.headers_mut().extend(extra_headers);
        Box::new(response)
    }
}

/// axum middleware wrapper around [`AuthGuard::authorize`].
///
/// Register with
/// `middleware::from_fn_with_state(Arc::new(guard), auth_guard)`.
pub async fn auth_guard(
    State(guard): State<Arc<AuthGuard>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_headers = request.headers().clone();
    let cell = ensure_cell(&mut request);

    match guard.authorize(&request_headers, &cell).await {
        Ok(rate_headers) => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(rate_headers);
            response
        }
        Err(response) => *response,
    }
}

/// Rate-limit denial: the error plus the headers describing the window.
#[derive(Debug)]
pub struct RateLimitDenial {
    pub error: AuthError,
    pub headers: HeaderMap,
}

/// Standalone fixed-window guard, also embedded in [`AuthGuard`].
#[derive(Clone)]
pub struct RateLimitGuard {
    anonymous_limit: u32,
    stores: Stores,
}

impl RateLimitGuard {
    #[must_use]
    pub fn new(stores: Stores) -> Self {
        Self {
            anonymous_limit: DEFAULT_ANONYMOUS_LIMIT,
            stores,
        }
    }

    /// Quota for requests without a session; zero refuses anonymous access
    /// outright.
    #[must_use]
    pub fn with_anonymous_limit(mut self, limit: u32) -> Self {
        self.anonymous_limit = limit;
        self
    }

    /// Count this request against the session's window (deriving an
    /// anonymous session when none is assigned) and describe the outcome as
    /// response headers.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` when anonymous access is disabled and no session is
    /// assigned; `TOO_MANY_REQUESTS` with `Retry-After` when the window is
    /// exhausted.
    pub async fn check(
        &self,
        request_headers: &HeaderMap,
        cell: &SessionCell,
    ) -> Result<HeaderMap, RateLimitDenial> {
        let session = match cell.get() {
            Some(session) => session,
            None => {
                if self.anonymous_limit == 0 {
                    return Err(RateLimitDenial {
                        error: AuthError::unauthorized("Anonymous access is not allowed."),
                        headers: HeaderMap::new(),
                    });
                }
                let session = crate::anonymous::generate_anonymous_session(
                    self.anonymous_limit,
                    request_headers,
                );
                cell.set(session.clone());
                session
            }
        };

        let max_requests = rate_limit::plan_lookup(session.rate_limit);
        let window_seconds = rate_limit::window_from_env();
        let opts = RateLimitOptions {
            key: format!("{RATE_LIMIT_KEY_PREFIX}{}", session.id),
            max_requests,
            window_seconds,
            max_failed_attempts: 3,
        };

        let outcome = match rate_limit::check(&self.stores, &opts).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(RateLimitDenial {
                    error: err,
                    headers: HeaderMap::new(),
                });
            }
        };

        let reset_at = outcome.created_at + window_seconds;
        if outcome.can_continue {
            let mut headers = HeaderMap::new();
            insert_number(&mut headers, RATE_LIMIT_LIMIT_HEADER, i64::from(max_requests));
            insert_number(
                &mut headers,
                RATE_LIMIT_REMAINING_HEADER,
                i64::from(max_requests.saturating_sub(outcome.count)),
            );
            insert_number(&mut headers, RATE_LIMIT_RESET_HEADER, reset_at);
            return Ok(headers);
        }

        if outcome.failed_attempts >= opts.max_failed_attempts {
            warn!(
                key = %opts.key,
                failed_attempts = outcome.failed_attempts,
                "rate limit repeatedly exceeded"
            );
        }

        let retry_after = outcome.retry_after(window_seconds, now_unix_seconds());
        let mut headers = HeaderMap::new();
        insert_number(&mut headers, RETRY_AFTER.as_str(), retry_after);
        insert_number(&mut headers, RATE_LIMIT_LIMIT_HEADER, i64::from(max_requests));
        insert_number(&mut headers, RATE_LIMIT_REMAINING_HEADER, 0);
        insert_number(&mut headers, RATE_LIMIT_RESET_HEADER, reset_at);

        Err(RateLimitDenial {
            error: AuthError::too_many_requests(retry_after),
            headers,
        })
    }
}

/// axum middleware wrapper around [`RateLimitGuard::check`] for routes
/// without the auth guard.
pub async fn rate_limit_guard(
    State(guard): State<Arc<RateLimitGuard>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_headers = request.headers().clone();
    let cell = ensure_cell(&mut request);

    match guard.check(&request_headers, &cell).await {
        Ok(rate_headers) => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(rate_headers);
            response
        }
        Err(denial) => {
            let status = match denial.error.kind() {
                crate::error::ErrorKind::TooManyRequests => SessionStatus::Blocked,
                _ => SessionStatus::Failed,
            };
            let _ = cell.take();
            let mut response = denial.error.into_response();
            response.headers_mut().extend(default_session_headers(
                &request_headers,
                SessionType::User,
                status,
            ));
            response.headers_mut().extend(denial.headers);
            response
        }
    }
}

/// Guard factory requiring any of the listed permissions on the assigned
/// session.
#[derive(Clone)]
pub struct RequirePermissions {
    required: Vec<String>,
}

impl RequirePermissions {
    #[must_use]
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

/// axum middleware wrapper around [`RequirePermissions`]; expects the auth
/// guard to have assigned a session further out.
pub async fn require_permissions(
    State(guard): State<Arc<RequirePermissions>>,
    request: Request,
    next: Next,
) -> Response {
    let request_headers = request.headers().clone();
    let session = request
        .extensions()
        .get::<SessionCell>()
        .and_then(SessionCell::get);

    let held = session.as_ref().map(|s| s.scope.clone()).unwrap_or_default();
    if let Err(reason) = scope::validate(&guard.required, &held) {
        let kind = session.map_or(SessionType::User, |s| s.kind);
        let mut response = AuthError::permission_denied(reason).into_response();
        response.headers_mut().extend(default_session_headers(
            &request_headers,
            kind,
            SessionStatus::Failed,
        ));
        return response;
    }

    next.run(request).await
}

/// Response interceptor: creates the session cell for the request and, after
/// the inner stack ran, serializes any assigned session into headers and
/// cookies, then drops it.
///
/// Register outermost with `middleware::from_fn(session_headers_layer)`.
pub async fn session_headers_layer(mut request: Request, next: Next) -> Response {
    let request_headers = request.headers().clone();
    let cell = ensure_cell(&mut request);

    let mut response = next.run(request).await;

    // Taking the session keeps it from leaking across middleware boundaries.
    if let Some(session) = cell.take() {
        response
            .headers_mut()
            .extend(headers_for_session(&session, &request_headers));
    }
    response
}

/// Bearer token from the type-specific authorization header.
fn bearer_token(headers: &HeaderMap, kind: SessionType) -> Option<String> {
    let value = match kind {
        SessionType::Api => headers.get(API_AUTHORIZATION_HEADER)?,
        SessionType::User | SessionType::Anonymous => headers.get(AUTHORIZATION)?,
    };
    let trimmed = value.to_str().ok()?.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn ensure_cell(request: &mut Request) -> SessionCell {
    if let Some(cell) = request.extensions().get::<SessionCell>() {
        return cell.clone();
    }
    let cell = SessionCell::new();
    request.extensions_mut().insert(cell.clone());
    cell
}

fn insert_number(headers: &mut HeaderMap, name: &str, value: i64) {
    if let (Ok(name), Ok(value)) = (
        axum::http::HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&value.to_string()),
    ) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthGuard, RateLimitGuard, bearer_token};
    use crate::{
        keys::registry,
        session::{SessionCell, SessionStatus, SessionType, TokenOptions, generate_session_tokens},
        store::Stores,
    };
    use anyhow::Result;
    use axum::http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION};

    const SECRET: &str = "guard-secret";

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
        );
        headers
    }

    async fn with_hmac_key_async<T>(future: impl Future<Output = T>) -> T {
        temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
            registry().clear();
            let result = future.await;
            registry().clear();
            result
        })
        .await
    }

    #[test]
    fn bearer_token_strips_the_prefix() {
        let headers = bearer_headers("abc.def.ghi");
        assert_eq!(
            bearer_token(&headers, SessionType::User).as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(bearer_token(&headers, SessionType::Api), None);

        let mut api_headers = HeaderMap::new();
        api_headers.insert(
            "x-znx-authorization",
            HeaderValue::from_static("Bearer api-token"),
        );
        assert_eq!(
            bearer_token(&api_headers, SessionType::Api).as_deref(),
            Some("api-token")
        );
    }

    #[test]
    fn bearer_token_rejects_malformed_values() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert_eq!(bearer_token(&headers, SessionType::User), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers, SessionType::User), None);

        assert_eq!(bearer_token(&HeaderMap::new(), SessionType::User), None);
    }

    #[tokio::test]
    async fn missing_bearer_yields_401_with_failed_headers() {
        let guard = AuthGuard::new(SessionType::User, Stores::local_only());
        let cell = SessionCell::new();

        let response = guard
            .authorize(&HeaderMap::new(), &cell)
            .await
            .err()
            .expect("missing bearer fails");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("X-Znx-User-Session-Status").unwrap(),
            "failed"
        );
        let subject = response
            .headers()
            .get("X-Znx-User-Id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(subject.starts_with("anonymous-"));
        assert!(cell.get().is_none());
    }

    #[tokio::test]
    async fn valid_token_assigns_active_session() -> Result<()> {
        with_hmac_key_async(async {
            let stores = Stores::local_only();
            let issue_cell = SessionCell::new();
            let tokens =
                generate_session_tokens(&issue_cell, &TokenOptions::new(SessionType::User))?;

            let guard = AuthGuard::new(SessionType::User, stores).with_rate_limit(false);
            let cell = SessionCell::new();
            let rate_headers = guard
                .authorize(&bearer_headers(&tokens.access_token), &cell)
                .await
                .map_err(|response| anyhow::anyhow!("denied: {}", response.status()))?;
            assert!(rate_headers.is_empty());

            let session = cell.get().expect("session assigned");
            assert_eq!(session.status, SessionStatus::Active);
            assert_eq!(session.token.as_deref(), Some(tokens.access_token.as_str()));
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn garbage_token_yields_403() {
        with_hmac_key_async(async {
            let guard =
                AuthGuard::new(SessionType::User, Stores::local_only()).with_rate_limit(false);
            let cell = SessionCell::new();
            let response = guard
                .authorize(&bearer_headers("not.a.token"), &cell)
                .await
                .err()
                .expect("garbage token fails");
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert_eq!(
                response.headers().get("X-Znx-User-Session-Status").unwrap(),
                "failed"
            );
        })
        .await;
    }

    #[tokio::test]
    async fn missing_key_material_yields_500() -> Result<()> {
        // A well-formed token signed with an arbitrary secret; the guard
        // fails at key resolution because the environment has no JWT_KEY.
        let token = crate::jwt::create(
            crate::jwt::Claims::default(),
            "ad-hoc-secret",
            &crate::jwt::SignOptions::default(),
        )?;

        temp_env::async_with_vars([("JWT_KEY", None::<&str>)], async {
            registry().clear();
            let guard =
                AuthGuard::new(SessionType::User, Stores::local_only()).with_rate_limit(false);
            let cell = SessionCell::new();
            let response = guard
                .authorize(&bearer_headers(&token), &cell)
                .await
                .err()
                .expect("missing key fails");
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                response.headers().get("X-Znx-User-Session-Status").unwrap(),
                "failed"
            );
            registry().clear();
        })
        .await;
        Ok(())
    }

    #[tokio::test]
    async fn blocklisted_token_is_denied() -> Result<()> {
        with_hmac_key_async(async {
            let stores = Stores::local_only();
            let issue_cell = SessionCell::new();
            let tokens =
                generate_session_tokens(&issue_cell, &TokenOptions::new(SessionType::User))?;
            crate::blocklist::add(&stores, &tokens.access_token).await?;

            let guard = AuthGuard::new(SessionType::User, stores).with_rate_limit(false);
            let cell = SessionCell::new();
            let response = guard
                .authorize(&bearer_headers(&tokens.access_token), &cell)
                .await
                .err()
                .expect("blocklisted token fails");
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert!(cell.get().is_none());
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn rate_limited_session_is_blocked_with_retry_after() -> Result<()> {
        with_hmac_key_async(async {
            let stores = Stores::local_only();
            let issue_cell = SessionCell::new();
            let mut payload = serde_json::Map::new();
            payload.insert("rateLimit".to_string(), serde_json::json!(2));
            let opts = TokenOptions {
                payload: Some(payload),
                ..TokenOptions::new(SessionType::User)
            };
            let tokens = generate_session_tokens(&issue_cell, &opts)?;
            let headers = bearer_headers(&tokens.access_token);

            let guard = AuthGuard::new(SessionType::User, stores);
            for _ in 0..2 {
                let cell = SessionCell::new();
                let rate_headers = guard
                    .authorize(&headers, &cell)
                    .await
                    .map_err(|response| anyhow::anyhow!("denied: {}", response.status()))?;
                assert_eq!(
                    rate_headers
                        .get("X-Znx-RateLimit-Limit")
                        .and_then(|value| value.to_str().ok()),
                    Some("2")
                );
            }

            let cell = SessionCell::new();
            let response = guard
                .authorize(&headers, &cell)
                .await
                .err()
                .expect("third request is limited");
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(
                response.headers().get("X-Znx-User-Session-Status").unwrap(),
                "blocked"
            );
            assert!(response.headers().get("Retry-After").is_some());
            assert!(cell.get().is_none());
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn anonymous_limit_zero_refuses_sessionless_requests() {
        let guard = RateLimitGuard::new(Stores::local_only()).with_anonymous_limit(0);
        let denial = guard
            .check(&HeaderMap::new(), &SessionCell::new())
            .await
            .err()
            .expect("anonymous refused");
        assert_eq!(
            denial.error.kind(),
            crate::error::ErrorKind::Unauthorized
        );
    }

    #[tokio::test]
    async fn anonymous_sessions_share_one_window() {
        let guard = RateLimitGuard::new(Stores::local_only()).with_anonymous_limit(2);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert("user-agent", HeaderValue::from_static("agent"));

        for _ in 0..2 {
            let cell = SessionCell::new();
            let result = guard.check(&headers, &cell).await;
            assert!(result.is_ok());
            let session = cell.get().expect("anonymous session assigned");
            assert_eq!(session.kind, SessionType::Anonymous);
        }

        let denial = guard
            .check(&headers, &SessionCell::new())
            .await
            .err()
            .expect("third request limited");
        assert_eq!(
            denial.error.kind(),
            crate::error::ErrorKind::TooManyRequests
        );
        assert!(denial.headers.get("Retry-After").is_some());
        assert!(denial.error.retry_after().is_some());
    }
}
