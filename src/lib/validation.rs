use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ReadHistoryError, Result};

pub const MAX_IDENTIFIER_LENGTH: usize = 128;
pub const MAX_TARGET_TYPE_LENGTH: usize = 64;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9_.:@-]{0,127})?$").expect("valid identifier regex")
});
static TARGET_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]{0,63}$").expect("valid target type regex")
});
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{4,20}$").expect("valid phone regex"));

/// Checks an actor id (user or session) or a target id.
pub fn ensure_identifier(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ReadHistoryError::validation(format!(
            "{label} must not be empty"
        )));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ReadHistoryError::validation(format!(
            "{label} must be at most {MAX_IDENTIFIER_LENGTH} characters"
        )));
    }
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(ReadHistoryError::validation(format!(
            "{label} must start with a letter or digit and contain only letters, digits, '_', '.', ':', '@' or '-'"
        )))
    }
}

pub fn ensure_target_type(value: &str) -> Result<()> {
    if value.len() > MAX_TARGET_TYPE_LENGTH {
        return Err(ReadHistoryError::validation(format!(
            "target_type must be at most {MAX_TARGET_TYPE_LENGTH} characters"
        )));
    }
    if TARGET_TYPE_RE.is_match(value) {
        Ok(())
    } else {
        Err(ReadHistoryError::validation(
            "target_type must start with a letter and contain only letters, digits, '_', '.' or '-'",
        ))
    }
}

/// Strips spaces and dashes and turns a leading trunk `0` into `+`.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let mut phone: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();
    if let Some(rest) = phone.strip_prefix('0') {
        phone = format!("+{rest}");
    }
    if PHONE_RE.is_match(&phone) {
        Ok(phone)
    } else {
        Err(ReadHistoryError::validation(format!(
            "`{raw}` is not a dialable phone number"
        )))
    }
}
