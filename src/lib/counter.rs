//! Per-actor unread, unanswered and tracked counters.
//!
//! Three interchangeable strategies keep the same numbers:
//! guarded deltas, membership sets, and capped prefix scans over the
//! unread/unanswered/activity indexes.

use std::{fmt, sync::Arc};

use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    error::Result,
    key::{CompositeKey, KeyPart, KeyRange},
    maintainer::PRIMARY_TABLE,
    model::{Actor, ReadHistory},
    projection::{IndexDocument, IndexKind},
    seq::ChangeSeq,
    store::{Change, Document, RecordStore, ScanCount},
};

pub const DEFAULT_SCAN_LIMIT: usize = 500;

/// Last change applied per record, for guarded counters.
const GUARD_TABLE: &str = "cnt_guarded_seq";
/// Per-bucket member flags, for membership counters.
const MEMBER_TABLE: &str = "cnt_membership_member";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterStrategy {
    #[default]
    Guarded,
    Membership,
    RangeScan,
}

impl CounterStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::Guarded => "guarded",
            Self::Membership => "membership",
            Self::RangeScan => "range_scan",
        }
    }

    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Guarded => "cnt_guarded",
            Self::Membership => "cnt_membership",
            Self::RangeScan => "cnt_range_scan",
        }
    }

    /// Indexes the strategy reads from.
    pub fn required_indexes(self) -> &'static [IndexKind] {
        match self {
            Self::Guarded | Self::Membership => &[],
            Self::RangeScan => &[
                IndexKind::ActivityByActor,
                IndexKind::ActivityByActorType,
                IndexKind::UnreadByActor,
                IndexKind::UnansweredByActor,
            ],
        }
    }

    /// Tables whose change feeds drive the strategy.
    pub fn source_tables(self) -> Vec<&'static str> {
        match self {
            Self::Guarded | Self::Membership => vec![PRIMARY_TABLE],
            Self::RangeScan => self
                .required_indexes()
                .iter()
                .map(|kind| kind.table())
                .collect(),
        }
    }
}

impl fmt::Display for CounterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counter bucket: one actor, optionally narrowed to a target type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationKey {
    pub actor: Actor,
    pub target_type: Option<String>,
}

impl AggregationKey {
    pub fn global(actor: Actor) -> Self {
        Self {
            actor,
            target_type: None,
        }
    }

    pub fn per_type(actor: Actor, target_type: impl Into<String>) -> Self {
        Self {
            actor,
            target_type: Some(target_type.into()),
        }
    }

    /// Every bucket a record with this actor and type contributes to.
    pub fn buckets(actor: &Actor, target_type: &str) -> [Self; 2] {
        [
            Self::global(actor.clone()),
            Self::per_type(actor.clone(), target_type),
        ]
    }

    /// Index prefix covering the bucket in the actor-keyed indexes.
    fn index_prefix(&self) -> CompositeKey {
        let mut prefix = CompositeKey::new(vec![
            KeyPart::text(self.actor.kind()),
            KeyPart::text(self.actor.id()),
        ]);
        if let Some(target_type) = &self.target_type {
            prefix.push(KeyPart::text(target_type));
        }
        prefix
    }

    fn bucket_key(&self) -> CompositeKey {
        let mut key = self.index_prefix();
        if self.target_type.is_none() {
            key.push(KeyPart::Absent);
        }
        key
    }

    pub(crate) fn storage_key(&self) -> Vec<u8> {
        self.bucket_key().encode()
    }

    fn member_key(&self, member: &str) -> Vec<u8> {
        let mut key = self.bucket_key();
        key.push(KeyPart::text(member));
        key.encode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counts {
    pub unread: u64,
    pub unanswered: u64,
    /// Read histories in the bucket.
    pub tracked: u64,
    /// A capped scan hit its limit; the values are lower bounds.
    pub truncated: bool,
}

/// Bucket totals kept by the guarded and membership strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct Totals {
    unread: u64,
    unanswered: u64,
    tracked: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Guard {
    seq: ChangeSeq,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RangeScanRow {
    #[serde(default)]
    unread: ScanCount,
    #[serde(default)]
    unanswered: ScanCount,
    #[serde(default)]
    tracked: ScanCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct Flags {
    exists: bool,
    unread: bool,
    unanswered: bool,
}

impl Flags {
    fn of(record: Option<&ReadHistory>) -> Self {
        Self {
            exists: record.is_some(),
            unread: record.is_some_and(ReadHistory::is_unread),
            unanswered: record.is_some_and(ReadHistory::is_unanswered),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Unread,
    Unanswered,
    Tracked,
}

impl Metric {
    fn for_table(table: &str) -> Option<(Metric, IndexKind, IndexKind)> {
        match table {
            t if t == IndexKind::UnreadByActor.table() => Some((
                Metric::Unread,
                IndexKind::UnreadByActor,
                IndexKind::UnreadByActor,
            )),
            t if t == IndexKind::UnansweredByActor.table() => Some((
                Metric::Unanswered,
                IndexKind::UnansweredByActor,
                IndexKind::UnansweredByActor,
            )),
            t if t == IndexKind::ActivityByActor.table()
                || t == IndexKind::ActivityByActorType.table() =>
            {
                Some((
                    Metric::Tracked,
                    IndexKind::ActivityByActor,
                    IndexKind::ActivityByActorType,
                ))
            }
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Unanswered => "unanswered",
            Self::Tracked => "tracked",
        }
    }
}

fn apply_delta(value: &mut u64, was: bool, is: bool) {
    match (was, is) {
        (false, true) => *value += 1,
        (true, false) => *value = value.saturating_sub(1),
        _ => {}
    }
}

/// Keeps aggregate counters in step with primary or index changes.
#[derive(Clone)]
pub struct CounterMaintainer {
    store: Arc<RecordStore>,
    strategy: CounterStrategy,
    scan_limit: usize,
}

impl CounterMaintainer {
    pub fn new(store: Arc<RecordStore>, strategy: CounterStrategy, scan_limit: usize) -> Self {
        Self {
            store,
            strategy,
            scan_limit,
        }
    }

    pub fn strategy(&self) -> CounterStrategy {
        self.strategy
    }

    pub fn on_change(&self, change: &Change) -> Result<()> {
        match self.strategy {
            CounterStrategy::Guarded if change.table == PRIMARY_TABLE => self.apply_guarded(change),
            CounterStrategy::Membership if change.table == PRIMARY_TABLE => {
                self.apply_membership(change)
            }
            CounterStrategy::RangeScan => self.rescan(change),
            _ => Ok(()),
        }
    }

    pub fn counts(&self, key: &AggregationKey) -> Result<Counts> {
        let table = self.strategy.table();
        let storage_key = key.storage_key();
        Ok(match self.strategy {
            CounterStrategy::Guarded | CounterStrategy::Membership => {
                let row: Totals = self.load(table, &storage_key)?;
                Counts {
                    unread: row.unread,
                    unanswered: row.unanswered,
                    tracked: row.tracked,
                    truncated: false,
                }
            }
            CounterStrategy::RangeScan => {
                let row: RangeScanRow = self.load(table, &storage_key)?;
                Counts {
                    unread: row.unread.count,
                    unanswered: row.unanswered.count,
                    tracked: row.tracked.count,
                    truncated: row.unread.truncated
                        || row.unanswered.truncated
                        || row.tracked.truncated,
                }
            }
        })
    }

    fn load<T: DeserializeOwned + Default>(&self, table: &str, key: &[u8]) -> Result<T> {
        Ok(self.store.get_as(table, key)?.unwrap_or_default())
    }

    /// Applies `(old, new)` transitions as deltas, once per change sequence
    /// and record. The record's guard and its bucket totals commit together.
    fn apply_guarded(&self, change: &Change) -> Result<()> {
        let old = change.old_as::<ReadHistory>()?;
        let new = change.new_as::<ReadHistory>()?;
        let (was, is) = (Flags::of(old.as_ref()), Flags::of(new.as_ref()));
        if was == is {
            return Ok(());
        }
        let Some(record) = new.as_ref().or(old.as_ref()) else {
            return Ok(());
        };

        let table = self.strategy.table();
        let buckets = AggregationKey::buckets(&record.actor, &record.target_type);
        let bucket_keys = buckets.each_ref().map(AggregationKey::storage_key);
        let mut keys = vec![(GUARD_TABLE, change.key.as_slice())];
        keys.extend(bucket_keys.iter().map(|key| (table, key.as_slice())));

        let changes = self.store.modify_many(&keys, |mut docs| {
            let applied = docs[0].as_ref().map(|doc| Guard::deserialize(doc)).transpose()?;
            if applied.is_some_and(|guard| guard.seq >= change.seq) {
                return Ok(docs);
            }
            docs[0] = Some(serde_json::to_value(Guard { seq: change.seq })?);
            for doc in &mut docs[1..] {
                let mut row: Totals = decode_row(doc.as_ref())?;
                apply_delta(&mut row.tracked, was.exists, is.exists);
                apply_delta(&mut row.unread, was.unread, is.unread);
                apply_delta(&mut row.unanswered, was.unanswered, is.unanswered);
                *doc = Some(serde_json::to_value(row)?);
            }
            Ok(docs)
        })?;
        for (bucket, key) in buckets.iter().zip(&bucket_keys) {
            let updated = changes.iter().any(|c| c.table == table && &c.key == key);
            self.observe(bucket, "transition", updated);
        }
        Ok(())
    }

    /// Moves the member in or out of each bucket. Membership follows the
    /// record as currently stored, so a replayed transition cannot undo a
    /// later one. Each member keeps its own flags row; the bucket row only
    /// holds totals.
    fn apply_membership(&self, change: &Change) -> Result<()> {
        let old = change.old_as::<ReadHistory>()?;
        let new = change.new_as::<ReadHistory>()?;
        if Flags::of(old.as_ref()) == Flags::of(new.as_ref()) {
            return Ok(());
        }
        let Some(record) = new.as_ref().or(old.as_ref()) else {
            return Ok(());
        };
        let current = self
            .store
            .get_as::<ReadHistory>(PRIMARY_TABLE, &change.key)?;
        let now = Flags::of(current.as_ref());

        let table = self.strategy.table();
        for bucket in AggregationKey::buckets(&record.actor, &record.target_type) {
            let totals_key = bucket.storage_key();
            let member_key = bucket.member_key(&record.id);
            let keys = [
                (table, totals_key.as_slice()),
                (MEMBER_TABLE, member_key.as_slice()),
            ];
            let changes = self.store.modify_many(&keys, |mut docs| {
                let member: Flags = decode_row(docs[1].as_ref())?;
                let before: Totals = decode_row(docs[0].as_ref())?;
                let mut totals = before;
                apply_delta(&mut totals.tracked, member.exists, now.exists);
                apply_delta(&mut totals.unread, member.unread, now.unread);
                apply_delta(&mut totals.unanswered, member.unanswered, now.unanswered);
                if totals != before {
                    docs[0] = Some(serde_json::to_value(totals)?);
                }
                docs[1] = if now.exists {
                    Some(serde_json::to_value(now)?)
                } else {
                    None
                };
                Ok(docs)
            })?;
            self.observe(&bucket, "membership", !changes.is_empty());
        }
        Ok(())
    }

    /// Recounts the prefixes an index mutation touched, up to the scan cap.
    fn rescan(&self, change: &Change) -> Result<()> {
        let Some((metric, global_index, typed_index)) = Metric::for_table(&change.table) else {
            return Ok(());
        };
        let Some(doc) = change.new_as::<IndexDocument>()?.or(change.old_as()?) else {
            return Ok(());
        };

        for bucket in AggregationKey::buckets(&doc.actor, &doc.target_type) {
            let index = if bucket.target_type.is_some() {
                typed_index
            } else {
                global_index
            };
            let range = KeyRange::prefix(&bucket.index_prefix());
            let updated = self.store.modify(
                self.strategy.table(),
                &bucket.storage_key(),
                |current| {
                    let mut row: RangeScanRow = decode_row(current)?;
                    let count = self
                        .store
                        .count(index.table(), &range, Some(self.scan_limit))?;
                    match metric {
                        Metric::Unread => row.unread = count,
                        Metric::Unanswered => row.unanswered = count,
                        Metric::Tracked => row.tracked = count,
                    }
                    Ok(Some(serde_json::to_value(&row)?))
                },
            )?;
            self.observe(&bucket, metric.name(), updated.is_some());
        }
        Ok(())
    }

    fn observe(&self, bucket: &AggregationKey, reason: &'static str, changed: bool) {
        let outcome = if changed { "updated" } else { "unchanged" };
        counter!(
            "readdbx_counter_updates_total",
            "strategy" => self.strategy.name(),
            "outcome" => outcome
        )
        .increment(1);
        debug!(
            strategy = self.strategy.name(),
            actor = %bucket.actor,
            target_type = bucket.target_type.as_deref().unwrap_or("*"),
            reason,
            outcome,
            "counter update"
        );
    }
}

fn decode_row<T: DeserializeOwned + Default>(doc: Option<&Document>) -> Result<T> {
    Ok(doc
        .map(|doc| T::deserialize(doc))
        .transpose()?
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        maintainer::RecordMaintainer,
        model::{EventKind, Target, ValidatedEvent},
        projection::ProjectionEngine,
        token::Token,
    };
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        maintainer: RecordMaintainer,
        projection: ProjectionEngine,
        counters: CounterMaintainer,
    }

    fn fixture(strategy: CounterStrategy, scan_limit: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path().join("store")).unwrap());
        Fixture {
            maintainer: RecordMaintainer::new(Arc::clone(&store)),
            projection: ProjectionEngine::new(Arc::clone(&store), IndexKind::ALL.to_vec()),
            counters: CounterMaintainer::new(Arc::clone(&store), strategy, scan_limit),
            _dir: dir,
        }
    }

    impl Fixture {
        /// Applies an event and feeds the resulting changes through the
        /// handlers the way the pipeline would.
        fn apply(&self, kind: EventKind, target_type: &str, target: &str, token: &str) -> Option<Arc<Change>> {
            let event = ValidatedEvent::new(
                kind,
                Actor::User("u1".into()),
                Target::new(target_type, target).unwrap(),
                Token::parse(token).unwrap(),
            )
            .unwrap();
            let change = self.maintainer.apply(&event).unwrap()?;
            self.deliver(&change);
            Some(change)
        }

        fn deliver(&self, change: &Change) {
            match self.counters.strategy() {
                CounterStrategy::RangeScan => {
                    let mut feeds: Vec<_> = CounterStrategy::RangeScan
                        .source_tables()
                        .into_iter()
                        .map(|table| self.projection_store().subscribe(table))
                        .collect();
                    self.projection.on_change(change).unwrap();
                    for feed in &mut feeds {
                        while let Some(index_change) = feed.try_next() {
                            self.counters.on_change(&index_change).unwrap();
                        }
                    }
                }
                _ => {
                    self.projection.on_change(change).unwrap();
                    self.counters.on_change(change).unwrap();
                }
            }
        }

        fn projection_store(&self) -> &RecordStore {
            &self.counters.store
        }

        fn counts(&self, target_type: Option<&str>) -> Counts {
            let key = AggregationKey {
                actor: Actor::User("u1".into()),
                target_type: target_type.map(str::to_string),
            };
            self.counters.counts(&key).unwrap()
        }
    }

    fn scenario(strategy: CounterStrategy) {
        let f = fixture(strategy, DEFAULT_SCAN_LIMIT);
        f.apply(EventKind::NewEvent, "priv", "t1", "2024-01-01T00:00:00.000Z_1");
        assert_eq!(f.counts(None).unread, 1);
        f.apply(EventKind::Read, "priv", "t1", "2024-01-01T00:00:01.000Z_1");
        assert_eq!(f.counts(None).unread, 0);
        let change = f
            .apply(EventKind::NewEvent, "priv", "t1", "2024-01-01T00:00:02.000Z_1")
            .unwrap();
        assert_eq!(f.counts(None).unread, 1);

        f.deliver(&change);
        assert!(
            f.apply(EventKind::NewEvent, "priv", "t1", "2024-01-01T00:00:02.000Z_1")
                .is_none()
        );
        let counts = f.counts(None);
        assert_eq!(counts.unread, 1);
        assert_eq!(counts.tracked, 1);

        f.apply(EventKind::NewEvent, "chat", "c1", "2024-01-01T00:00:03.000Z_1");
        f.apply(EventKind::Write, "chat", "c1", "2024-01-01T00:00:04.000Z_1");
        assert_eq!(f.counts(None).unread, 2);
        assert_eq!(f.counts(None).unanswered, 1);
        assert_eq!(f.counts(Some("chat")).unread, 1);
        assert_eq!(f.counts(Some("priv")).unanswered, 0);
        assert_eq!(f.counts(Some("chat")).tracked, 1);
    }

    #[test]
    fn guarded_counts_follow_transitions() {
        scenario(CounterStrategy::Guarded);
    }

    #[test]
    fn membership_counts_follow_transitions() {
        scenario(CounterStrategy::Membership);
    }

    #[test]
    fn range_scan_counts_follow_transitions() {
        scenario(CounterStrategy::RangeScan);
    }

    #[test]
    fn guarded_ignores_replayed_transitions() {
        let f = fixture(CounterStrategy::Guarded, DEFAULT_SCAN_LIMIT);
        let unread = f
            .apply(EventKind::NewEvent, "priv", "t1", "2024-01-01T00:00:00.000Z_1")
            .unwrap();
        let read = f
            .apply(EventKind::Read, "priv", "t1", "2024-01-01T00:00:01.000Z_1")
            .unwrap();
        for _ in 0..3 {
            f.counters.on_change(&unread).unwrap();
            f.counters.on_change(&read).unwrap();
        }
        let counts = f.counts(None);
        assert_eq!(counts.unread, 0);
        assert_eq!(counts.tracked, 1);
    }

    #[test]
    fn membership_ignores_replayed_transitions() {
        let f = fixture(CounterStrategy::Membership, DEFAULT_SCAN_LIMIT);
        let unread = f
            .apply(EventKind::NewEvent, "priv", "t1", "2024-01-01T00:00:00.000Z_1")
            .unwrap();
        f.apply(EventKind::Read, "priv", "t1", "2024-01-01T00:00:01.000Z_1");
        f.counters.on_change(&unread).unwrap();
        assert_eq!(f.counts(None).unread, 0);
    }

    #[test]
    fn range_scan_flags_truncation_at_cap() {
        let f = fixture(CounterStrategy::RangeScan, 3);
        for idx in 0..5 {
            f.apply(
                EventKind::NewEvent,
                "priv",
                &format!("t{idx}"),
                "2024-01-01T00:00:00.000Z_1",
            );
        }
        let counts = f.counts(None);
        assert_eq!(counts.unread, 3);
        assert!(counts.truncated);
        assert!(!f.counts(Some("other")).truncated);
    }

    fn bucket_rows_hold_totals_only(strategy: CounterStrategy, side_table: &str) {
        let f = fixture(strategy, DEFAULT_SCAN_LIMIT);
        for idx in 0..40 {
            f.apply(
                EventKind::NewEvent,
                "priv",
                &format!("t{idx}"),
                "2024-01-01T00:00:00.000Z_1",
            );
        }
        f.apply(EventKind::Read, "priv", "t0", "2024-01-01T00:00:01.000Z_1");

        let store = f.projection_store();
        let bucket = AggregationKey::global(Actor::User("u1".into()));
        let row = store
            .get(strategy.table(), &bucket.storage_key())
            .unwrap()
            .unwrap();
        assert_eq!(
            row,
            serde_json::json!({ "unread": 39, "unanswered": 0, "tracked": 40 })
        );
        let side_rows = store.count(side_table, &KeyRange::all(), None).unwrap();
        assert!(side_rows.count >= 40);
    }

    #[test]
    fn guarded_bucket_row_stays_constant_size() {
        bucket_rows_hold_totals_only(CounterStrategy::Guarded, GUARD_TABLE);
    }

    #[test]
    fn membership_bucket_row_stays_constant_size() {
        bucket_rows_hold_totals_only(CounterStrategy::Membership, MEMBER_TABLE);
    }

    #[test]
    fn membership_drops_member_row_when_record_leaves() {
        let f = fixture(CounterStrategy::Membership, DEFAULT_SCAN_LIMIT);
        let created = f
            .apply(EventKind::NewEvent, "priv", "t1", "2024-01-01T00:00:00.000Z_1")
            .unwrap();
        let store = f.projection_store();
        store.delete(PRIMARY_TABLE, &created.key).unwrap();
        let deleted = Change {
            seq: created.seq,
            table: PRIMARY_TABLE.to_string(),
            key: created.key.clone(),
            old: created.new.clone(),
            new: None,
        };
        f.counters.on_change(&deleted).unwrap();

        assert_eq!(f.counts(None), Counts::default());
        let members = store.count(MEMBER_TABLE, &KeyRange::all(), None).unwrap();
        assert_eq!(members.count, 0);
    }
}
