//! Any-of permission check between required and held scope sets.

/// Validate that `held` satisfies `required`.
///
/// Rules: an empty `required` always passes; the `"*"` wildcard in `held`
/// passes everything; otherwise any overlap between the two sets passes.
///
/// # Errors
///
/// Returns the human-readable denial reason.
pub fn validate(required: &[String], held: &[String]) -> Result<(), String> {
    if required.is_empty() {
        return Ok(());
    }

    if held.iter().any(|scope| scope == "*") {
        return Ok(());
    }

    if required.iter().any(|scope| held.contains(scope)) {
        return Ok(());
    }

    Err(format!(
        "Insufficient permissions. Requires any of [{}].",
        required.join(", ")
    ))
}
