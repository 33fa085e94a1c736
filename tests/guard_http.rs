//! End-to-end guard behavior through a real axum router.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::Extension,
    http::{Request, StatusCode, header::SET_COOKIE},
    middleware,
    response::IntoResponse,
    routing::get,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use zanix_auth::{
    AuthGuard, RateLimitGuard, SessionCell, SessionType, Stores, TokenOptions, auth_guard,
    generate_session_tokens, rate_limit_guard, registry, session_headers_layer,
};

const SECRET: &str = "integration-secret";

async fn me(Extension(cell): Extension<SessionCell>) -> impl IntoResponse {
    let session = cell.get();
    Json(json!({
        "subject": session.as_ref().and_then(|s| s.subject.clone()),
        "scope": session.as_ref().map(|s| s.scope.clone()).unwrap_or_default(),
    }))
}

fn guarded_app(guard: AuthGuard) -> Router {
    Router::new()
        .route("/me", get(me))
        .layer(middleware::from_fn_with_state(Arc::new(guard), auth_guard))
        .layer(middleware::from_fn(session_headers_layer))
}

fn request(builder: axum::http::request::Builder) -> Request<Body> {
    builder.uri("/me").body(Body::empty()).expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

fn issue_tokens(payload: Option<serde_json::Map<String, Value>>) -> zanix_auth::SessionTokens {
    let opts = TokenOptions {
        payload,
        ..TokenOptions::new(SessionType::User)
    };
    generate_session_tokens(&SessionCell::new(), &opts).expect("tokens mint")
}

#[tokio::test]
async fn missing_bearer_returns_401_with_failed_session_headers() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let app = guarded_app(AuthGuard::new(SessionType::User, Stores::local_only()));

        let response = app
            .oneshot(request(Request::builder()))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("X-Znx-User-Session-Status").unwrap(),
            "failed"
        );
        let subject = response
            .headers()
            .get("X-Znx-User-Id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(subject.starts_with("anonymous-"));
        assert!(response.headers().get(SET_COOKIE).is_none());

        let body = body_json(response).await;
        assert_eq!(
            body.get("message").and_then(Value::as_str),
            Some("Authorization token is missing or invalid.")
        );
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn valid_token_reaches_the_handler_with_active_headers() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let tokens = issue_tokens(None);
        let app = guarded_app(
            AuthGuard::new(SessionType::User, Stores::local_only()).with_rate_limit(false),
        );

        let response = app
            .oneshot(request(Request::builder().header(
                "Authorization",
                format!("Bearer {}", tokens.access_token),
            )))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("X-Znx-User-Session-Status").unwrap(),
            "active"
        );
        // No subject claim, so the header falls back to the token id.
        let subject = response
            .headers()
            .get("X-Znx-User-Id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(Uuid::parse_str(&subject).is_ok());
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn permissions_flow_through_to_the_handler() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let mut payload = serde_json::Map::new();
        payload.insert("permissions".to_string(), json!(["read"]));
        let tokens = issue_tokens(Some(payload));

        let app = guarded_app(
            AuthGuard::new(SessionType::User, Stores::local_only())
                .with_permissions(vec!["read".to_string(), "admin".to_string()])
                .with_rate_limit(false),
        );

        let response = app
            .oneshot(request(Request::builder().header(
                "Authorization",
                format!("Bearer {}", tokens.access_token),
            )))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.get("scope"), Some(&json!(["read"])));
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn insufficient_permissions_return_403() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let mut payload = serde_json::Map::new();
        payload.insert("permissions".to_string(), json!(["read"]));
        let tokens = issue_tokens(Some(payload));

        let app = guarded_app(
            AuthGuard::new(SessionType::User, Stores::local_only())
                .with_permissions(vec!["admin".to_string()])
                .with_rate_limit(false),
        );

        let response = app
            .oneshot(request(Request::builder().header(
                "Authorization",
                format!("Bearer {}", tokens.access_token),
            )))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("X-Znx-User-Session-Status").unwrap(),
            "failed"
        );
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn rate_limited_session_gets_429_blocked_and_retry_after() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let mut payload = serde_json::Map::new();
        payload.insert("rateLimit".to_string(), json!(2));
        let tokens = issue_tokens(Some(payload));

        let app = guarded_app(AuthGuard::new(SessionType::User, Stores::local_only()));
        let bearer = format!("Bearer {}", tokens.access_token);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(
                    Request::builder().header("Authorization", bearer.clone()),
                ))
                .await
                .expect("router responds");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get("X-Znx-RateLimit-Limit").unwrap(),
                "2"
            );
            assert!(response.headers().get("X-Znx-RateLimit-Remaining").is_some());
            assert!(response.headers().get("X-Znx-RateLimit-Reset").is_some());
        }

        let response = app
            .oneshot(request(
                Request::builder().header("Authorization", bearer),
            ))
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-Znx-User-Session-Status").unwrap(),
            "blocked"
        );
        assert!(response.headers().get("Retry-After").is_some());
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn cookie_consenting_failure_carries_clearing_cookies() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let app = guarded_app(AuthGuard::new(SessionType::User, Stores::local_only()));

        let response = app
            .oneshot(request(
                Request::builder().header("X-Znx-Cookies-Accepted", "true"),
            ))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();

        assert!(cookies.iter().any(|cookie| cookie
            .starts_with("X-Znx-User-Session-Status=failed; Max-Age=0;")));
        assert!(cookies
            .iter()
            .any(|cookie| cookie.starts_with("X-Znx-App-Token=; Max-Age=0;")));
        assert!(cookies
            .iter()
            .any(|cookie| cookie.starts_with("X-Znx-Cookies-Accepted=true; Max-Age=0;")));
        for cookie in &cookies {
            assert!(cookie.ends_with("; Path=/; HttpOnly; SameSite=Strict"));
        }
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn api_guard_reads_its_own_authorization_header() {
    temp_env::async_with_vars([("JWT_KEY", Some(SECRET))], async {
        registry().clear();
        let tokens = issue_tokens(None);
        let app = guarded_app(
            AuthGuard::new(SessionType::Api, Stores::local_only()).with_rate_limit(false),
        );

        // A user bearer on the standard header is invisible to the api guard.
        let response = app
            .oneshot(request(Request::builder().header(
                "Authorization",
                format!("Bearer {}", tokens.access_token),
            )))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("X-Znx-Api-Session-Status").unwrap(),
            "failed"
        );
        registry().clear();
    })
    .await;
}

#[tokio::test]
async fn standalone_rate_limit_guard_covers_anonymous_clients() {
    let guard = Arc::new(RateLimitGuard::new(Stores::local_only()).with_anonymous_limit(2));
    let app = Router::new()
        .route("/public", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(guard, rate_limit_guard))
        .layer(middleware::from_fn(session_headers_layer));

    let build = || {
        Request::builder()
            .uri("/public")
            .header("x-forwarded-for", "7.7.7.7")
            .header("user-agent", "integration-agent")
            .body(Body::empty())
            .expect("request")
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(build()).await.expect("router responds");
        assert_eq!(response.status(), StatusCode::OK);
        // The derived anonymous session is serialized into the headers.
        let subject = response
            .headers()
            .get("X-Znx-User-Id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(subject.starts_with("anonymous-"));
    }

    let response = app.oneshot(build()).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("Retry-After").is_some());
    assert_eq!(
        response.headers().get("X-Znx-User-Session-Status").unwrap(),
        "blocked"
    );
}
