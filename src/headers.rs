//! Session-describing response headers and cookies.
//!
//! Every response that went through the guard stack carries the subject and
//! status headers for its session type, and, for cookie-consenting clients,
//! the matching `Set-Cookie` lines. Failure responses use the same table so
//! clients always learn what happened to their attempt.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, SET_COOKIE},
};

use crate::{
    anonymous::anonymous_id,
    session::{Session, SessionStatus, SessionType},
    ttl::now_unix_seconds,
};

/// Cookie/header carrying the refresh token for `user` sessions.
pub const APP_TOKEN_HEADER: &str = "X-Znx-App-Token";
/// Cookie/header recording cookie consent; only the literal `"true"` counts.
pub const COOKIES_ACCEPTED_HEADER: &str = "X-Znx-Cookies-Accepted";

pub const RATE_LIMIT_LIMIT_HEADER: &str = "X-Znx-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "X-Znx-RateLimit-Remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "X-Znx-RateLimit-Reset";

/// Subject header per session type; anonymous sessions ride the user table.
#[must_use]
pub const fn subject_header(kind: SessionType) -> &'static str {
    match kind {
        SessionType::Api => "X-Znx-Api-Id",
        SessionType::User | SessionType::Anonymous => "X-Znx-User-Id",
    }
}

/// Status header per session type.
#[must_use]
pub const fn status_header(kind: SessionType) -> &'static str {
    match kind {
        SessionType::Api => "X-Znx-Api-Session-Status",
        SessionType::User | SessionType::Anonymous => "X-Znx-User-Session-Status",
    }
}

/// Inputs for [`session_headers`].
#[derive(Debug, Clone)]
pub struct SessionHeaderOptions {
    pub cookies_accepted: bool,
    pub status: SessionStatus,
    pub kind: SessionType,
    pub subject: String,
    /// Session expiry (unix seconds); cookie `Max-Age` is the remaining
    /// lifetime, floored at zero.
    pub expiration: i64,
    pub refresh_token: Option<String>,
}

/// Build the session-describing headers, including the ordered `Set-Cookie`
/// lines for cookie-consenting clients.
///
/// The status and subject headers are always present; `user` sessions with a
/// known token also carry it as a plain header. Cookie order: status,
/// subject, the refresh token (user type only, emitted as a clearing cookie
/// when unknown), then the consent marker.
#[must_use]
pub fn session_headers(opts: &SessionHeaderOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();

    insert(&mut headers, status_header(opts.kind), opts.status.as_str());
    insert(&mut headers, subject_header(opts.kind), &opts.subject);
    if matches!(opts.kind, SessionType::User | SessionType::Anonymous)
        && let Some(token) = &opts.refresh_token
    {
        insert(&mut headers, APP_TOKEN_HEADER, token);
    }

    if !opts.cookies_accepted {
        return headers;
    }

    let max_age = (opts.expiration - now_unix_seconds()).max(0);
    append_cookie(
        &mut headers,
        status_header(opts.kind),
        opts.status.as_str(),
        max_age,
    );
    append_cookie(&mut headers, subject_header(opts.kind), &opts.subject, max_age);
    if matches!(opts.kind, SessionType::User | SessionType::Anonymous) {
        match &opts.refresh_token {
            Some(token) => append_cookie(&mut headers, APP_TOKEN_HEADER, token, max_age),
            // Clear any stale token cookie on responses without one.
            None => append_cookie(&mut headers, APP_TOKEN_HEADER, "", 0),
        }
    }
    append_cookie(&mut headers, COOKIES_ACCEPTED_HEADER, "true", max_age);

    headers
}

/// Session headers for a failed or anonymous attempt: the subject defaults to
/// the client-claimed one, else the derived anonymous id.
#[must_use]
pub fn default_session_headers(
    request_headers: &HeaderMap,
    kind: SessionType,
    status: SessionStatus,
) -> HeaderMap {
    let subject = client_subject(request_headers, kind)
        .unwrap_or_else(|| anonymous_id(request_headers));
    session_headers(&SessionHeaderOptions {
        cookies_accepted: cookies_accepted(request_headers),
        status,
        kind,
        subject,
        expiration: 0,
        refresh_token: None,
    })
}

/// Session headers for an assigned session, as appended by the response
/// layer: subject falls back to the session id, expiry comes from the `exp`
/// claim.
#[must_use]
pub fn headers_for_session(session: &Session, request_headers: &HeaderMap) -> HeaderMap {
    let expiration = session
        .payload
        .get("exp")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    session_headers(&SessionHeaderOptions {
        cookies_accepted: cookies_accepted(request_headers),
        status: session.status,
        kind: session.kind,
        subject: session
            .subject
            .clone()
            .unwrap_or_else(|| session.id.clone()),
        expiration,
        refresh_token: session.token.clone(),
    })
}

/// The client-claimed subject for a session type: the matching cookie first,
/// then the header of the same name.
#[must_use]
pub fn client_subject(headers: &HeaderMap, kind: SessionType) -> Option<String> {
    let name = subject_header(kind);
    cookie_value(headers, name).or_else(|| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

/// Whether the client consented to cookies: the marker must be literally
/// `"true"` in either headers or cookies.
#[must_use]
pub fn cookies_accepted(headers: &HeaderMap) -> bool {
    let from_header = headers
        .get(COOKIES_ACCEPTED_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    if from_header == Some("true") {
        return true;
    }
    cookie_value(headers, COOKIES_ACCEPTED_HEADER).as_deref() == Some("true")
}

/// Read a single cookie from the request `Cookie` header.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn append_cookie(headers: &mut HeaderMap, name: &str, value: &str, max_age: i64) {
    let line =
        format!("{name}={value}; Max-Age={max_age}; Path=/; HttpOnly; SameSite=Strict");
    if let Ok(value) = HeaderValue::from_str(&line) {
        headers.append(SET_COOKIE, value);
    }
}
