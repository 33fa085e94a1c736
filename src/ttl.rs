//! TTL-string parsing and unix-time helpers.
//!
//! Expirations, rotation cycles and cache TTLs are configured either as a
//! bare number of seconds (`"90"`) or as a duration string (`"30d"`,
//! `"12h"`, `"1mo"`). `"0"` is valid and means disabled where a caller
//! treats zero specially.

use std::time::SystemTime;

use crate::error::AuthError;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

/// Unix seconds for token expiry and window accounting.
#[must_use]
pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Parse a TTL into seconds.
///
/// Suffixes: `s`, `m` (minutes), `h`, `d`, `w`, `mo`, `y`. No suffix means
/// seconds.
///
/// # Errors
///
/// Returns an internal error when the value is empty, negative or carries an
/// unknown suffix.
pub fn parse_ttl(value: &str) -> Result<i64, AuthError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(value));
    }

    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split_at);
    let amount: i64 = digits.parse().map_err(|_| invalid(value))?;

    let unit = match suffix {
        "" | "s" => 1,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        "mo" => MONTH,
        "y" => YEAR,
        _ => return Err(invalid(value)),
    };

    amount.checked_mul(unit).ok_or_else(|| invalid(value))
}

fn invalid(value: &str) -> AuthError {
    AuthError::internal("INVALID_TTL", format!("Invalid TTL value: {value:?}"))
}
