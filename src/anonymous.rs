//! Stable, privacy-preserving session ids for unauthenticated clients.
//!
//! The id is a hash of the client IP (from common proxy headers) and the
//! user-agent, so the same client keeps one rate-limit bucket without any
//! identifying value leaving the process.

use axum::http::HeaderMap;
use regex::Regex;

use crate::{
    crypto::sha256_hex,
    session::{Session, SessionStatus, SessionType},
};

const UNKNOWN_IP: &str = "unknown-ip";
const INVALID_IP: &str = "invalid-ip";
const UNKNOWN_AGENT: &str = "unknown-agent";
const MAX_USER_AGENT_LEN: usize = 256;

/// Derive the stable `anonymous-<hex>` identifier for a request.
#[must_use]
pub fn anonymous_id(headers: &HeaderMap) -> String {
    let ip = client_ip(headers);
    let agent = user_agent(headers);
    format!("anonymous-{}", sha256_hex(&format!("{ip}-{agent}")))
}

/// Build the anonymous session used by the standalone rate-limit guard.
#[must_use]
pub fn generate_anonymous_session(rate_limit: u32, headers: &HeaderMap) -> Session {
    Session {
        id: anonymous_id(headers),
        kind: SessionType::Anonymous,
        subject: None,
        rate_limit,
        scope: Vec::new(),
        status: SessionStatus::Unconfirmed,
        payload: serde_json::Map::new(),
        token: None,
    }
}

/// Client IP from proxy headers, normalized for hashing.
///
/// Values that do not look like an IPv4 address collapse to a sentinel so a
/// spoofed header cannot mint unlimited buckets.
fn client_ip(headers: &HeaderMap) -> String {
    let candidate = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            headers
                .get("cf-connecting-ip")
                .and_then(|value| value.to_str().ok())
        })
        .or_else(|| headers.get("x-real-ip").and_then(|value| value.to_str().ok()))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_IP);

    if candidate == UNKNOWN_IP || valid_ipv4(candidate) {
        candidate.to_string()
    } else {
        INVALID_IP.to_string()
    }
}

fn valid_ipv4(value: &str) -> bool {
    Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").is_ok_and(|regex| regex.is_match(value))
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(
            || UNKNOWN_AGENT.to_string(),
            |value| value.chars().take(MAX_USER_AGENT_LEN).collect(),
        )
}
