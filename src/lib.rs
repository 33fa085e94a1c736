//! Authentication and authorization core for axum request pipelines.
//!
//! The crate bundles a JWT issuance/verification engine with key rotation
//! and optional payload encryption, an access/refresh session model backed
//! by a revocation blocklist, a fixed-window rate limiter (local or
//! distributed via an atomic script), one-time codes, and the guard
//! middleware composing them. Cache providers, KV drivers and the OAuth2
//! transport stay outside, consumed through the narrow traits in [`store`]
//! and [`oauth2`].
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{Router, middleware, routing::get};
//! use zanix_auth::{AuthGuard, SessionType, Stores, auth_guard, session_headers_layer};
//!
//! let stores = Stores::local_only();
//! let guard = Arc::new(AuthGuard::new(SessionType::User, stores));
//! let app: Router = Router::new()
//!     .route("/me", get(|| async { "hello" }))
//!     .layer(middleware::from_fn_with_state(guard, auth_guard))
//!     .layer(middleware::from_fn(session_headers_layer));
//! ```

pub mod anonymous;
pub mod blocklist;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod headers;
pub mod jwt;
pub mod keys;
pub mod oauth2;
pub mod otp;
pub mod rate_limit;
pub mod scope;
pub mod session;
pub mod store;
pub mod ttl;

pub use error::{AuthError, ErrorKind};
pub use guard::{
    AuthGuard, RateLimitGuard, RequirePermissions, auth_guard, rate_limit_guard,
    require_permissions, session_headers_layer,
};
pub use jwt::{Algorithm, Audience, Claims, DEFAULT_JWT_ISSUER, SignOptions, VerifyOptions};
pub use keys::{KeyRegistry, KeySpace, registry};
pub use session::{
    RefreshOptions, RevokeOptions, Session, SessionCell, SessionStatus, SessionTokens,
    SessionType, TokenOptions, create_access_token, create_app_token, create_refresh_token,
    generate_session_tokens, refresh_session_tokens, revoke_app_tokens, revoke_session_token,
};
pub use store::{DistributedStore, KvStore, MemoryCache, Stores};

/// User agent for outbound provider calls.
pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
