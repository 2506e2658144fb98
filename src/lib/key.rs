//! Order-preserving tuple encoding for index and counter keys.
//!
//! Each part is self-delimiting, so the encoding of a tuple prefix is a byte
//! prefix of the encoding of every longer tuple that starts with it. Byte
//! order of encoded keys equals lexicographic order of the tuples.

use std::{fmt, ops::Bound};

use crate::error::{ReadHistoryError, Result};

const TAG_ABSENT: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;
const TERMINATOR: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Absent,
    Text(String),
}

impl KeyPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn optional(value: Option<impl Into<String>>) -> Self {
        value.map_or(Self::Absent, |value| Self::Text(value.into()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Absent => None,
            Self::Text(value) => Some(value),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Absent => out.push(TAG_ABSENT),
            Self::Text(value) => {
                out.push(TAG_TEXT);
                for byte in value.bytes() {
                    out.push(byte);
                    if byte == TERMINATOR {
                        out.push(ESCAPED_NUL);
                    }
                }
                out.push(TERMINATOR);
            }
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey(Vec<KeyPart>);

impl CompositeKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, part: KeyPart) {
        self.0.push(part);
    }

    pub fn truncated(&self, len: usize) -> Self {
        Self(self.0.iter().take(len).cloned().collect())
    }

    pub fn starts_with(&self, prefix: &CompositeKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 16);
        for part in &self.0 {
            part.encode_into(&mut out);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parts = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            match bytes[pos] {
                TAG_ABSENT => {
                    parts.push(KeyPart::Absent);
                    pos += 1;
                }
                TAG_TEXT => {
                    pos += 1;
                    let mut text = Vec::new();
                    loop {
                        let Some(&byte) = bytes.get(pos) else {
                            return Err(malformed("unterminated text part"));
                        };
                        pos += 1;
                        if byte != TERMINATOR {
                            text.push(byte);
                            continue;
                        }
                        if bytes.get(pos) == Some(&ESCAPED_NUL) {
                            text.push(TERMINATOR);
                            pos += 1;
                            continue;
                        }
                        break;
                    }
                    let text = String::from_utf8(text)
                        .map_err(|_| malformed("text part is not valid utf-8"))?;
                    parts.push(KeyPart::Text(text));
                }
                tag => return Err(malformed(&format!("unknown part tag {tag:#04x}"))),
            }
        }
        Ok(Self(parts))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|err| ReadHistoryError::InvalidCursor(format!("not a key id: {err}")))?;
        Self::decode(&bytes).map_err(|err| match err {
            ReadHistoryError::Storage(message) => ReadHistoryError::InvalidCursor(message),
            other => other,
        })
    }
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for part in &self.0 {
            match part {
                KeyPart::Absent => list.entry(&"∅"),
                KeyPart::Text(value) => list.entry(value),
            };
        }
        list.finish()
    }
}

impl From<Vec<KeyPart>> for CompositeKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

fn malformed(message: &str) -> ReadHistoryError {
    ReadHistoryError::Storage(format!("malformed composite key: {message}"))
}

/// Smallest byte string greater than every string starting with `prefix`.
/// `None` when no such string exists.
pub fn strinc(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < u8::MAX {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// Half-open range over encoded keys of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn prefix(prefix: &CompositeKey) -> Self {
        let encoded = prefix.encode();
        if encoded.is_empty() {
            return Self::all();
        }
        let end = match strinc(&encoded) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Included(encoded),
            end,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(start), Bound::Included(end)) => start > end,
            (Bound::Included(start), Bound::Excluded(end))
            | (Bound::Excluded(start), Bound::Included(end))
            | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[Option<&str>]) -> CompositeKey {
        CompositeKey::new(parts.iter().map(|part| KeyPart::optional(*part)).collect())
    }

    #[test]
    fn byte_order_matches_tuple_order() {
        let mut keys = vec![
            key(&[Some("b")]),
            key(&[Some("a"), Some("z")]),
            key(&[Some("a\0")]),
            key(&[None, Some("x")]),
            key(&[Some("a")]),
            key(&[Some("a"), None]),
            key(&[Some("")]),
            key(&[Some("a_b")]),
        ];
        let mut by_bytes = keys.clone();
        keys.sort();
        by_bytes.sort_by_key(|k| k.encode());
        assert_eq!(keys, by_bytes);
    }

    #[test]
    fn prefix_encoding_is_byte_prefix() {
        let full = key(&[Some("user"), Some("u\01"), Some("2024")]);
        let prefix = full.truncated(2);
        assert!(full.encode().starts_with(&prefix.encode()));
        assert!(KeyRange::prefix(&prefix).contains(&full.encode()));
        let sibling = key(&[Some("user"), Some("u\02")]);
        assert!(!KeyRange::prefix(&prefix).contains(&sibling.encode()));
    }

    #[test]
    fn decode_restores_parts() {
        let original = key(&[Some("a\0b"), None, Some("ümlaut")]);
        let decoded = CompositeKey::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(CompositeKey::from_hex(&original.to_hex()).unwrap(), original);
    }

    #[test]
    fn rejects_garbage_cursor() {
        assert!(matches!(
            CompositeKey::from_hex("zz"),
            Err(ReadHistoryError::InvalidCursor(_))
        ));
        assert!(matches!(
            CompositeKey::from_hex("0261"),
            Err(ReadHistoryError::InvalidCursor(_))
        ));
    }

    #[test]
    fn strinc_skips_trailing_max_bytes() {
        assert_eq!(strinc(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(strinc(&[0xFF, 0xFF]), None);
    }
}
