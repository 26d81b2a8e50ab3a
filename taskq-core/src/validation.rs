//! Input validation: identifier patterns, duration strings, and the key
//! legality rules that keep query-language injection out of user documents.

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::document::Document;
use crate::error::{Error, Result};

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").expect("invalid name pattern"));

static DURATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)([smhd])").expect("invalid duration pattern"));

/// Validate a queue, task or worker name.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid {kind} name {name:?}: expected 1-100 characters of [A-Za-z0-9_-]"
        )))
    }
}

/// Parse a duration string such as `1h30m` or `90s` by summing the
/// `<int><unit>` groups. Units: s, m, h, d.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let mut total = Duration::zero();
    let mut matched_len = 0;
    for capture in DURATION_PATTERN.captures_iter(value) {
        let whole = capture.get(0).expect("capture group 0 always present");
        matched_len += whole.len();
        let amount: i64 = capture[1]
            .parse()
            .map_err(|_| Error::Validation(format!("invalid duration {value:?}")))?;
        total = total
            + match &capture[2] {
                "s" => Duration::seconds(amount),
                "m" => Duration::minutes(amount),
                "h" => Duration::hours(amount),
                "d" => Duration::days(amount),
                _ => unreachable!("pattern only matches smhd"),
            };
    }
    // Reject strings with unmatched residue such as "1h30x" or "".
    if matched_len != value.len() || matched_len == 0 {
        return Err(Error::Validation(format!(
            "invalid duration {value:?}: expected groups of <int><s|m|h|d>"
        )));
    }
    Ok(total)
}

/// Reject any mapping key containing `.` or `$`, recursively. Applies to the
/// user-controlled `metadata`, `args` and `summary` subtrees.
pub fn validate_document_keys(doc: &Document) -> Result<()> {
    for (key, value) in doc {
        if key.contains('.') || key.contains('$') {
            return Err(Error::Validation(format!(
                "illegal key {key:?}: keys must not contain '.' or '$'"
            )));
        }
        if let Value::Object(nested) = value {
            validate_document_keys(nested)?;
        }
    }
    Ok(())
}

/// Validate an optional user document, rejecting illegal keys.
pub fn validate_optional_keys(doc: Option<&Document>) -> Result<()> {
    match doc {
        Some(doc) => validate_document_keys(doc),
        None => Ok(()),
    }
}

pub fn validate_non_negative(field: &str, value: i64) -> Result<()> {
    if value < 0 {
        return Err(Error::Validation(format!(
            "{field} must be non-negative, got {value}"
        )));
    }
    Ok(())
}
