use std::{borrow::Borrow, fmt};

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::{ReadHistoryError, Result};

pub const MAX_TOKEN_LENGTH: usize = 256;
const SEGMENT_SEP: char = '_';

/// Opaque event position, compared as a plain string.
///
/// Tokens are produced by the event log as `<rfc3339 timestamp>_<tiebreak>`.
/// Ordering never looks inside the token; only projections that sort by
/// time extract the timestamp segment through [`Token::time_component`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(ReadHistoryError::validation("token must not be empty"));
        }
        if value.len() > MAX_TOKEN_LENGTH {
            return Err(ReadHistoryError::validation(format!(
                "token must be at most {MAX_TOKEN_LENGTH} bytes"
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(ReadHistoryError::validation(
                "token must not contain control characters",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The segment used for time ordering: the first `_` separated segment
    /// that parses as an RFC 3339 timestamp, otherwise the last segment.
    pub fn time_component(&self) -> &str {
        self.0
            .split(SEGMENT_SEP)
            .find(|segment| DateTime::parse_from_rfc3339(segment).is_ok())
            .or_else(|| self.0.rsplit(SEGMENT_SEP).next())
            .unwrap_or(self.0.as_str())
    }
}

/// Later of two optional tokens' time components. Absent sorts first.
pub fn latest_time<'a>(a: Option<&'a Token>, b: Option<&'a Token>) -> Option<&'a str> {
    let a = a.map(Token::time_component);
    let b = b.map(Token::time_component);
    a.max(b)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.0).finish()
    }
}

impl Borrow<str> for Token {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(value: &str) -> Token {
        Token::parse(value).expect("valid token")
    }

    #[test]
    fn absent_sorts_before_any_token() {
        let some = Some(token("2024-01-01T00:00:00.000Z_1"));
        assert!(None < some);
        assert!(some < Some(token("2024-01-01T00:00:00.000Z_2")));
    }

    #[test]
    fn extracts_leading_timestamp() {
        let t = token("2024-01-01T00:00:01.000Z_17");
        assert_eq!(t.time_component(), "2024-01-01T00:00:01.000Z");
    }

    #[test]
    fn falls_back_to_trailing_segment() {
        let t = token("srv3_000000123");
        assert_eq!(t.time_component(), "000000123");
        let bare = token("plain");
        assert_eq!(bare.time_component(), "plain");
    }

    #[test]
    fn latest_time_prefers_present_value() {
        let last = token("2024-01-01T00:00:00.000Z_1");
        let write = token("2024-01-02T00:00:00.000Z_1");
        assert_eq!(
            latest_time(Some(&last), Some(&write)),
            Some("2024-01-02T00:00:00.000Z")
        );
        assert_eq!(
            latest_time(None, Some(&last)),
            Some("2024-01-01T00:00:00.000Z")
        );
        assert_eq!(latest_time(None, None), None);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(Token::parse("").is_err());
        assert!(Token::parse("a\nb").is_err());
        assert!(Token::parse("x".repeat(MAX_TOKEN_LENGTH + 1)).is_err());
    }
}
