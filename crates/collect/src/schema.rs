//! Shared validation helpers for parsed source documents.
//!
//! Validation failures are permanent: callers prefix them with
//! `VALIDATION_ERROR:` so the orchestrator never retries them.

use serde_json::Value;

/// Numeric field must be within [min, max] when present.
pub fn check_bounds(doc: &Value, field: &str, min: f64, max: f64) -> Result<(), String> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| format!("{field} is not numeric: {v}"))?;
            if n < min || n > max {
                Err(format!("{field} out of bounds: {n}"))
            } else {
                Ok(())
            }
        }
    }
}

/// Non-negative when present.
pub fn check_non_negative(doc: &Value, field: &str) -> Result<(), String> {
    check_bounds(doc, field, 0.0, f64::MAX)
}

/// Required string field with a minimum length.
pub fn check_required_string(doc: &Value, field: &str, min_len: usize) -> Result<(), String> {
    match doc.get(field).and_then(Value::as_str) {
        Some(s) if s.len() >= min_len => Ok(()),
        Some(s) => Err(format!("{field} too short: {s:?}")),
        None => Err(format!("{field} is required")),
    }
}

/// Optional URL-shaped string field.
pub fn check_url(doc: &Value, field: &str) -> Result<(), String> {
    match doc.get(field).and_then(Value::as_str) {
        None => Ok(()),
        Some(s) if s.starts_with("http://") || s.starts_with("https://") => Ok(()),
        Some(s) => Err(format!("{field} is not a URL: {s:?}")),
    }
}

/// Optional enum membership.
pub fn check_enum(doc: &Value, field: &str, allowed: &[&str]) -> Result<(), String> {
    match doc.get(field).and_then(Value::as_str) {
        None => Ok(()),
        Some(s) if allowed.contains(&s) => Ok(()),
        Some(s) => Err(format!("{field} not in {allowed:?}: {s:?}")),
    }
}

/// EIN field must normalize and match the requested charity.
pub fn check_ein_matches(doc: &Value, field: &str, expected_ein: &str) -> Result<(), String> {
    let Some(actual) = doc.get(field).and_then(Value::as_str) else {
        return Err(format!("{field} is required"));
    };
    if goodmeasure_core::ein_matches(actual, expected_ein) {
        Ok(())
    } else {
        Err(format!("EIN mismatch: requested {expected_ein} but document has {actual}"))
    }
}
