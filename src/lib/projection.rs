use std::{fmt, str::FromStr, sync::Arc};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ReadHistoryError, Result},
    key::{CompositeKey, KeyPart},
    maintainer::PRIMARY_TABLE,
    model::{Actor, ReadHistory},
    store::{Change, RecordStore},
};

/// Secondary orderings maintained over the primary table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// `(target_type, target_id, record)`: every reader of one target.
    ByTarget,
    /// `(actor kind, actor id, activity time, record)`.
    ActivityByActor,
    /// `(actor kind, actor id, target_type, activity time, record)`.
    ActivityByActorType,
    /// `(actor kind, actor id, target_type, target_id)` while unread.
    UnreadByActor,
    /// `(actor kind, actor id, target_type, target_id)` while unanswered.
    UnansweredByActor,
}

impl IndexKind {
    pub const ALL: [IndexKind; 5] = [
        IndexKind::ByTarget,
        IndexKind::ActivityByActor,
        IndexKind::ActivityByActorType,
        IndexKind::UnreadByActor,
        IndexKind::UnansweredByActor,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ByTarget => "by_target",
            Self::ActivityByActor => "activity_by_actor",
            Self::ActivityByActorType => "activity_by_actor_type",
            Self::UnreadByActor => "unread_by_actor",
            Self::UnansweredByActor => "unanswered_by_actor",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::ByTarget => "idx_by_target",
            Self::ActivityByActor => "idx_activity_by_actor",
            Self::ActivityByActorType => "idx_activity_by_actor_type",
            Self::UnreadByActor => "idx_unread_by_actor",
            Self::UnansweredByActor => "idx_unanswered_by_actor",
        }
    }

    /// Number of key parts in a complete entry key.
    pub fn key_len(self) -> usize {
        match self {
            Self::ByTarget => 3,
            Self::ActivityByActor | Self::UnreadByActor | Self::UnansweredByActor => 4,
            Self::ActivityByActorType => 5,
        }
    }

    /// Leading key parts a resume cursor keeps. Time-ordered indexes resume
    /// at the time component; the rest resume at the exact entry.
    pub fn cursor_len(self) -> usize {
        match self {
            Self::ByTarget => 3,
            Self::ActivityByActor => 3,
            Self::ActivityByActorType => 4,
            Self::UnreadByActor | Self::UnansweredByActor => 4,
        }
    }

    pub fn is_time_ordered(self) -> bool {
        matches!(self, Self::ActivityByActor | Self::ActivityByActorType)
    }

    /// Entry for `record`, or `None` when the record is filtered out.
    pub fn project(self, record: &ReadHistory) -> Option<IndexEntry> {
        let actor = || {
            [
                KeyPart::text(record.actor.kind()),
                KeyPart::text(record.actor.id()),
            ]
        };
        let parts: Vec<KeyPart> = match self {
            Self::ByTarget => vec![
                KeyPart::text(&record.target_type),
                KeyPart::text(&record.target_id),
                KeyPart::text(&record.id),
            ],
            Self::ActivityByActor => actor()
                .into_iter()
                .chain([
                    KeyPart::optional(record.activity_time()),
                    KeyPart::text(&record.id),
                ])
                .collect(),
            Self::ActivityByActorType => actor()
                .into_iter()
                .chain([
                    KeyPart::text(&record.target_type),
                    KeyPart::optional(record.activity_time()),
                    KeyPart::text(&record.id),
                ])
                .collect(),
            Self::UnreadByActor | Self::UnansweredByActor => {
                let keep = match self {
                    Self::UnreadByActor => record.is_unread(),
                    _ => record.is_unanswered(),
                };
                if !keep {
                    return None;
                }
                actor()
                    .into_iter()
                    .chain([
                        KeyPart::text(&record.target_type),
                        KeyPart::text(&record.target_id),
                    ])
                    .collect()
            }
        };
        Some(IndexEntry {
            key: CompositeKey::new(parts),
            doc: IndexDocument {
                to: record.id.clone(),
                actor: record.actor.clone(),
                target_type: record.target_type.clone(),
            },
        })
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IndexKind {
    type Err = ReadHistoryError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == value)
            .ok_or_else(|| ReadHistoryError::UnknownIndex(value.to_string()))
    }
}

/// Stored value of an index entry; the sort key lives in the table key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub to: String,
    pub actor: Actor,
    pub target_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: CompositeKey,
    pub doc: IndexDocument,
}

/// Keeps secondary index tables in step with the primary table.
#[derive(Clone)]
pub struct ProjectionEngine {
    store: Arc<RecordStore>,
    kinds: Vec<IndexKind>,
}

impl ProjectionEngine {
    pub fn new(store: Arc<RecordStore>, kinds: Vec<IndexKind>) -> Self {
        Self { store, kinds }
    }

    pub fn kinds(&self) -> &[IndexKind] {
        &self.kinds
    }

    /// Reconciles every index against one primary change.
    ///
    /// Only the keys projected from `old` and `new` are touched. Each ends up
    /// holding the current record's entry or nothing, so a redelivered or
    /// superseded change can neither resurrect a moved key nor remove a
    /// live one.
    pub fn on_change(&self, change: &Change) -> Result<()> {
        if change.table != PRIMARY_TABLE {
            return Ok(());
        }
        let old = change.old_as::<ReadHistory>()?;
        let new = change.new_as::<ReadHistory>()?;
        let current = self
            .store
            .get_as::<ReadHistory>(PRIMARY_TABLE, &change.key)?;

        for kind in &self.kinds {
            let desired = current.as_ref().and_then(|record| kind.project(record));
            let old_entry = old.as_ref().and_then(|record| kind.project(record));
            let new_entry = new.as_ref().and_then(|record| kind.project(record));

            if let Some(old_entry) = &old_entry {
                let moved = new_entry
                    .as_ref()
                    .is_none_or(|new_entry| new_entry.key != old_entry.key);
                if moved {
                    self.reconcile(*kind, &old_entry.key, desired.as_ref())?;
                }
            }
            if let Some(new_entry) = &new_entry {
                self.reconcile(*kind, &new_entry.key, desired.as_ref())?;
            }
        }
        Ok(())
    }

    fn reconcile(
        &self,
        kind: IndexKind,
        key: &CompositeKey,
        desired: Option<&IndexEntry>,
    ) -> Result<()> {
        let encoded = key.encode();
        let (op, change) = match desired.filter(|entry| &entry.key == key) {
            Some(entry) => (
                "upsert",
                self.store
                    .put(kind.table(), &encoded, serde_json::to_value(&entry.doc)?)?,
            ),
            None => ("delete", self.store.delete(kind.table(), &encoded)?),
        };
        if change.is_some() {
            counter!(
                "readdbx_index_mutations_total",
                "index" => kind.name(),
                "op" => op
            )
            .increment(1);
            debug!(index = kind.name(), key = ?key, op, "index mutation");
        }
        Ok(())
    }
}
