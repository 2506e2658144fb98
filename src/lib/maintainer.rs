use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::Result,
    model::{ReadHistory, ReadHistoryEvent, ValidatedEvent},
    store::{Change, RecordStore, UpdateOp},
};

pub const PRIMARY_TABLE: &str = "read_history";

/// Folds domain events into the primary read-history table.
#[derive(Clone)]
pub struct RecordMaintainer {
    store: Arc<RecordStore>,
}

impl RecordMaintainer {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Validates a wire event and applies it. Nothing is written when
    /// validation fails.
    pub fn apply_raw(&self, event: ReadHistoryEvent) -> Result<Option<Arc<Change>>> {
        let event = event.validate()?;
        self.apply(&event)
    }

    /// Applies `createIfAbsent(identity)` followed by `maxMerge(field, token)`.
    ///
    /// Replays and out-of-order arrivals converge on the same document, and
    /// an event that moves nothing forward returns `None`.
    pub fn apply(&self, event: &ValidatedEvent) -> Result<Option<Arc<Change>>> {
        let id = event.record_id();
        let field = event.kind.field();
        let ops = [
            UpdateOp::CreateIfAbsent(ReadHistory::seed_document(&event.actor, &event.target)),
            UpdateOp::max_merge(
                field.field_name(),
                Value::String(event.token.as_str().to_string()),
            ),
        ];

        let change = self.store.update(PRIMARY_TABLE, id.as_bytes(), &ops)?;
        let outcome = if change.is_some() { "applied" } else { "noop" };
        counter!(
            "readdbx_events_applied_total",
            "kind" => event.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        debug!(
            record = %id,
            kind = event.kind.as_str(),
            token = %event.token,
            outcome,
            "read history event"
        );
        Ok(change)
    }

    pub fn get(&self, record_id: &str) -> Result<Option<ReadHistory>> {
        self.store.get_as(PRIMARY_TABLE, record_id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ReadHistoryError,
        model::{Actor, EventKind, Target},
        token::Token,
    };
    use rand::seq::SliceRandom;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RecordMaintainer) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path().join("store")).unwrap());
        (dir, RecordMaintainer::new(store))
    }

    fn event(kind: EventKind, token: &str) -> ValidatedEvent {
        ValidatedEvent::new(
            kind,
            Actor::User("u1".into()),
            Target::new("priv", "t1").unwrap(),
            Token::parse(token).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_actor_without_writing() {
        let (_dir, maintainer) = setup();
        let raw = ReadHistoryEvent {
            kind: EventKind::NewEvent,
            user: Some("u1".into()),
            session: Some("s1".into()),
            target_type: "priv".into(),
            target_id: "t1".into(),
            token: "2024-01-01T00:00:00.000Z_1".into(),
        };
        let err = maintainer.apply_raw(raw).unwrap_err();
        assert!(matches!(err, ReadHistoryError::Validation(_)));
        assert!(maintainer.get("user_u1_priv_t1").unwrap().is_none());
        assert!(maintainer.get("session_s1_priv_t1").unwrap().is_none());
    }

    #[test]
    fn duplicate_event_is_a_noop() {
        let (_dir, maintainer) = setup();
        let first = event(EventKind::NewEvent, "2024-01-01T00:00:00.000Z_1");
        assert!(maintainer.apply(&first).unwrap().is_some());
        assert!(maintainer.apply(&first).unwrap().is_none());
        let record = maintainer.get(&first.record_id()).unwrap().unwrap();
        assert_eq!(record.last.unwrap().as_str(), "2024-01-01T00:00:00.000Z_1");
    }

    #[test]
    fn any_order_matches_sorted_application() {
        let mut events = Vec::new();
        for (idx, kind) in [
            EventKind::NewEvent,
            EventKind::Write,
            EventKind::Read,
            EventKind::EmailNotification,
            EventKind::SmsNotification,
        ]
        .into_iter()
        .enumerate()
        {
            for second in 0..4 {
                let token = format!("2024-01-01T00:00:0{second}.000Z_{idx}");
                events.push(event(kind, &token));
            }
        }

        let (_sorted_dir, sorted) = setup();
        let mut in_order = events.clone();
        in_order.sort_by(|a, b| a.token.cmp(&b.token));
        for event in &in_order {
            sorted.apply(event).unwrap();
        }
        let expected = sorted.get(&in_order[0].record_id()).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            let (_dir, shuffled) = setup();
            let mut mixed = events.clone();
            mixed.extend(events.iter().take(7).cloned());
            mixed.shuffle(&mut rng);
            for event in &mixed {
                shuffled.apply(event).unwrap();
            }
            assert_eq!(shuffled.get(&mixed[0].record_id()).unwrap(), expected);
        }
    }
}
