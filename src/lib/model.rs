use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    error::{ReadHistoryError, Result},
    token::{Token, latest_time},
    validation::{ensure_identifier, ensure_target_type},
};

/// Whoever reads a conversation: a signed-in user or an anonymous session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User(String),
    Session(String),
}

impl Actor {
    /// Builds an actor from the wire pair, requiring exactly one identity.
    pub fn from_parts(user: Option<String>, session: Option<String>) -> Result<Self> {
        let actor = match (user, session) {
            (Some(user), None) => Self::User(user),
            (None, Some(session)) => Self::Session(session),
            (Some(_), Some(_)) => {
                return Err(ReadHistoryError::validation(
                    "actor must be either a user or a session, not both",
                ));
            }
            (None, None) => {
                return Err(ReadHistoryError::validation(
                    "actor requires a user or a session",
                ));
            }
        };
        actor.validate()?;
        Ok(actor)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_identifier(self.kind(), self.id())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Session(_) => "session",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Session(id) => id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            Self::Session(_) => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub target_type: String,
    pub target_id: String,
}

impl Target {
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Result<Self> {
        let target = Self {
            target_type: target_type.into(),
            target_id: target_id.into(),
        };
        ensure_target_type(&target.target_type)?;
        ensure_identifier("target_id", &target.target_id)?;
        Ok(target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target_type, self.target_id)
    }
}

/// Deterministic record id for an (actor, target) pair.
pub fn record_id(actor: &Actor, target: &Target) -> String {
    let parts = [
        actor.kind(),
        actor.id(),
        target.target_type.as_str(),
        target.target_id.as_str(),
    ];
    let mut id = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            id.push('_');
        }
        for ch in part.chars() {
            if ch == '_' || ch == '\\' {
                id.push('\\');
            }
            id.push(ch);
        }
    }
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampField {
    Last,
    Write,
    Read,
    LastEmailNotification,
    LastSmsNotification,
}

impl TimestampField {
    pub fn field_name(self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Write => "write",
            Self::Read => "read",
            Self::LastEmailNotification => "last_email_notification",
            Self::LastSmsNotification => "last_sms_notification",
        }
    }
}

/// One read-history row per (actor, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadHistory {
    pub id: String,
    pub actor: Actor,
    pub target_type: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_email_notification: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sms_notification: Option<Token>,
}

impl ReadHistory {
    pub fn empty(actor: Actor, target: Target) -> Self {
        Self {
            id: record_id(&actor, &target),
            actor,
            target_type: target.target_type,
            target_id: target.target_id,
            last: None,
            write: None,
            read: None,
            last_email_notification: None,
            last_sms_notification: None,
        }
    }

    /// Identity fields written by `createIfAbsent` on first contact.
    pub fn seed_document(actor: &Actor, target: &Target) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert("id".into(), json!(record_id(actor, target)));
        doc.insert("actor".into(), json!(actor));
        doc.insert("target_type".into(), json!(target.target_type));
        doc.insert("target_id".into(), json!(target.target_id));
        doc
    }

    pub fn target(&self) -> Target {
        Target {
            target_type: self.target_type.clone(),
            target_id: self.target_id.clone(),
        }
    }

    pub fn timestamp(&self, field: TimestampField) -> Option<&Token> {
        match field {
            TimestampField::Last => self.last.as_ref(),
            TimestampField::Write => self.write.as_ref(),
            TimestampField::Read => self.read.as_ref(),
            TimestampField::LastEmailNotification => self.last_email_notification.as_ref(),
            TimestampField::LastSmsNotification => self.last_sms_notification.as_ref(),
        }
    }

    pub fn is_unread(&self) -> bool {
        self.read < self.last
    }

    pub fn is_unanswered(&self) -> bool {
        self.write > self.last
    }

    /// Later time component of `last` and `write`.
    pub fn activity_time(&self) -> Option<&str> {
        latest_time(self.last.as_ref(), self.write.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewEvent,
    Write,
    Read,
    EmailNotification,
    SmsNotification,
}

impl EventKind {
    pub fn field(self) -> TimestampField {
        match self {
            Self::NewEvent => TimestampField::Last,
            Self::Write => TimestampField::Write,
            Self::Read => TimestampField::Read,
            Self::EmailNotification => TimestampField::LastEmailNotification,
            Self::SmsNotification => TimestampField::LastSmsNotification,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewEvent => "new_event",
            Self::Write => "write",
            Self::Read => "read",
            Self::EmailNotification => "email_notification",
            Self::SmsNotification => "sms_notification",
        }
    }
}

/// Inbound event as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadHistoryEvent {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub target_type: String,
    pub target_id: String,
    pub token: String,
}

impl ReadHistoryEvent {
    pub fn validate(self) -> Result<ValidatedEvent> {
        let actor = Actor::from_parts(self.user, self.session)?;
        let target = Target::new(self.target_type, self.target_id)?;
        let token = Token::parse(self.token)?;
        Ok(ValidatedEvent {
            kind: self.kind,
            actor,
            target,
            token,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEvent {
    pub kind: EventKind,
    pub actor: Actor,
    pub target: Target,
    pub token: Token,
}

impl ValidatedEvent {
    pub fn new(kind: EventKind, actor: Actor, target: Target, token: Token) -> Result<Self> {
        actor.validate()?;
        Ok(Self {
            kind,
            actor,
            target,
            token,
        })
    }

    pub fn record_id(&self) -> String {
        record_id(&self.actor, &self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(value: &str) -> Token {
        Token::parse(value).unwrap()
    }

    #[test]
    fn actor_requires_exactly_one_identity() {
        assert!(Actor::from_parts(None, None).is_err());
        assert!(Actor::from_parts(Some("u".into()), Some("s".into())).is_err());
        assert!(Actor::from_parts(Some("".into()), None).is_err());
        assert_eq!(
            Actor::from_parts(None, Some("s1".into())).unwrap(),
            Actor::Session("s1".into())
        );
    }

    #[test]
    fn record_ids_do_not_collide_on_separator() {
        let a = record_id(
            &Actor::User("a_b".into()),
            &Target::new("priv", "c").unwrap(),
        );
        let b = record_id(
            &Actor::User("a".into()),
            &Target::new("priv", "b_c").unwrap(),
        );
        assert_ne!(a, b);
        assert_eq!(a, "user_a\\_b_priv_c");
    }

    #[test]
    fn unread_and_unanswered_follow_token_order() {
        let actor = Actor::User("u1".into());
        let target = Target::new("priv", "t1").unwrap();
        let mut record = ReadHistory::empty(actor, target);
        assert!(!record.is_unread());
        assert!(!record.is_unanswered());

        record.last = Some(token("2024-01-01T00:00:00.000Z_1"));
        assert!(record.is_unread());
        record.read = Some(token("2024-01-01T00:00:01.000Z_1"));
        assert!(!record.is_unread());

        record.write = Some(token("2024-01-01T00:00:02.000Z_1"));
        assert!(record.is_unanswered());
        assert_eq!(record.activity_time(), Some("2024-01-01T00:00:02.000Z"));
    }

    #[test]
    fn wire_event_deserializes_and_validates() {
        let raw = r#"{"kind":"new_event","session":"s1","target_type":"priv","target_id":"t1","token":"2024-01-01T00:00:00.000Z_1"}"#;
        let event: ReadHistoryEvent = serde_json::from_str(raw).unwrap();
        let event = event.validate().unwrap();
        assert_eq!(event.kind.field(), TimestampField::Last);
        assert_eq!(event.record_id(), "session_s1_priv_t1");
    }

    #[test]
    fn record_document_round_trips_through_seed() {
        let actor = Actor::User("u1".into());
        let target = Target::new("priv", "t1").unwrap();
        let doc = ReadHistory::seed_document(&actor, &target);
        let record: ReadHistory = serde_json::from_value(Value::Object(doc)).unwrap();
        assert_eq!(record, ReadHistory::empty(actor, target));
    }
}
