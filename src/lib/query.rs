//! Live, cursor-paginated range queries over the secondary indexes.
//!
//! A query follows its index range plus one primary-record watch per
//! distinct target. Entries that point at the same record share that watch;
//! record updates fan out to every entry, tagged with the entry's id.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    ops::Bound,
    sync::Arc,
};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

use crate::{
    error::{ReadHistoryError, Result},
    feed::{ChangeFeed, Delivery, DeliveryReceiver, DeliverySender, Subscription, SubscriptionId},
    key::{CompositeKey, KeyPart, KeyRange, strinc},
    maintainer::PRIMARY_TABLE,
    model::{Actor, ReadHistory},
    projection::{IndexDocument, IndexKind},
    store::{Change, RecordStore},
};

/// Cursor naming the far end of a selector's range.
pub const END_CURSOR: &str = "\u{FF}\u{FF}\u{FF}\u{FF}";
pub const DEFAULT_LIMIT: usize = 100;
pub const DEFAULT_MAX_LIMIT: usize = 1000;

/// Which index to read and which slice of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "index", rename_all = "snake_case")]
pub enum IndexSelector {
    ByTarget {
        target_type: String,
        target_id: String,
    },
    ActivityByActor {
        actor: Actor,
    },
    ActivityByActorType {
        actor: Actor,
        target_type: String,
    },
    UnreadByActor {
        actor: Actor,
        #[serde(default)]
        target_type: Option<String>,
    },
    UnansweredByActor {
        actor: Actor,
        #[serde(default)]
        target_type: Option<String>,
    },
}

impl IndexSelector {
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::ByTarget { .. } => IndexKind::ByTarget,
            Self::ActivityByActor { .. } => IndexKind::ActivityByActor,
            Self::ActivityByActorType { .. } => IndexKind::ActivityByActorType,
            Self::UnreadByActor { .. } => IndexKind::UnreadByActor,
            Self::UnansweredByActor { .. } => IndexKind::UnansweredByActor,
        }
    }

    pub fn prefix(&self) -> CompositeKey {
        let actor_parts = |actor: &Actor| vec![KeyPart::text(actor.kind()), KeyPart::text(actor.id())];
        let parts = match self {
            Self::ByTarget {
                target_type,
                target_id,
            } => vec![KeyPart::text(target_type), KeyPart::text(target_id)],
            Self::ActivityByActor { actor } => actor_parts(actor),
            Self::ActivityByActorType { actor, target_type } => {
                let mut parts = actor_parts(actor);
                parts.push(KeyPart::text(target_type));
                parts
            }
            Self::UnreadByActor { actor, target_type }
            | Self::UnansweredByActor { actor, target_type } => {
                let mut parts = actor_parts(actor);
                if let Some(target_type) = target_type {
                    parts.push(KeyPart::text(target_type));
                }
                parts
            }
        };
        CompositeKey::new(parts)
    }
}

/// Bounds and paging for a range read. Cursors are `""`, [`END_CURSOR`] or
/// an id previously returned by the same selector. `""` leaves that side
/// open whichever operator carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub reverse: bool,
}

enum Position {
    Open,
    Key(Vec<u8>),
    End,
}

/// Translates cursors into a key range inside the selector's prefix.
pub fn resolve_range(selector: &IndexSelector, request: &RangeRequest) -> Result<KeyRange> {
    if request.gt.is_some() && request.gte.is_some() {
        return Err(ReadHistoryError::validation("use either gt or gte, not both"));
    }
    if request.lt.is_some() && request.lte.is_some() {
        return Err(ReadHistoryError::validation("use either lt or lte, not both"));
    }

    let kind = selector.kind();
    let prefix = selector.prefix();
    let whole = KeyRange::prefix(&prefix);
    let prefix_end = whole.end.clone();

    let position = |cursor: &str| -> Result<Position> {
        if cursor.is_empty() {
            return Ok(Position::Open);
        }
        if cursor == END_CURSOR {
            return Ok(Position::End);
        }
        let key = CompositeKey::from_hex(cursor)?;
        if !key.starts_with(&prefix) || key.len() <= prefix.len() {
            return Err(ReadHistoryError::InvalidCursor(format!(
                "`{cursor}` does not belong to the {kind} range"
            )));
        }
        Ok(Position::Key(key.truncated(kind.cursor_len()).encode()))
    };
    let after = |key: Vec<u8>| strinc(&key).map_or(Bound::Unbounded, Bound::Included);
    let to_end = |bound: &Bound<Vec<u8>>| match bound {
        Bound::Excluded(end) | Bound::Included(end) => Bound::Included(end.clone()),
        Bound::Unbounded => Bound::Unbounded,
    };

    let start = match (&request.gt, &request.gte) {
        (Some(cursor), _) => match position(cursor)? {
            Position::Open => whole.start.clone(),
            Position::Key(key) => after(key),
            Position::End => to_end(&prefix_end),
        },
        (_, Some(cursor)) => match position(cursor)? {
            Position::Open => whole.start.clone(),
            Position::Key(key) => Bound::Included(key),
            Position::End => to_end(&prefix_end),
        },
        (None, None) => whole.start.clone(),
    };
    let end = match (&request.lt, &request.lte) {
        (Some(cursor), _) => match position(cursor)? {
            Position::Key(key) => Bound::Excluded(key),
            Position::Open | Position::End => prefix_end.clone(),
        },
        (_, Some(cursor)) => match position(cursor)? {
            Position::Key(key) => strinc(&key).map_or(Bound::Unbounded, Bound::Excluded),
            Position::Open | Position::End => prefix_end.clone(),
        },
        (None, None) => prefix_end.clone(),
    };

    Ok(KeyRange { start, end })
}

/// One result row: the entry's id and the record it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryItem {
    pub id: String,
    pub record: Option<ReadHistory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueryEvent {
    Added(QueryItem),
    Updated {
        item: QueryItem,
        previous: Option<ReadHistory>,
    },
    Removed {
        id: String,
        last: Option<ReadHistory>,
    },
}

impl QueryEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Added(item) | Self::Updated { item, .. } => &item.id,
            Self::Removed { id, .. } => id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Opens queries against the enabled indexes.
#[derive(Clone)]
pub struct RangeQueryEngine {
    store: Arc<RecordStore>,
    indexes: Vec<IndexKind>,
    default_limit: usize,
    max_limit: usize,
}

impl RangeQueryEngine {
    pub fn new(
        store: Arc<RecordStore>,
        indexes: Vec<IndexKind>,
        default_limit: usize,
        max_limit: usize,
    ) -> Self {
        Self {
            store,
            indexes,
            default_limit,
            max_limit,
        }
    }

    fn plan(&self, selector: &IndexSelector, request: &RangeRequest) -> Result<(KeyRange, usize)> {
        let kind = selector.kind();
        if !self.indexes.contains(&kind) {
            return Err(ReadHistoryError::UnknownIndex(kind.name().to_string()));
        }
        let range = resolve_range(selector, request)?;
        let limit = request
            .limit
            .unwrap_or(self.default_limit)
            .min(self.max_limit);
        Ok((range, limit))
    }

    /// One-shot read of the current window, joined to primary records.
    pub fn scan(&self, selector: &IndexSelector, request: &RangeRequest) -> Result<Vec<QueryItem>> {
        let (range, limit) = self.plan(selector, request)?;
        let rows = self
            .store
            .range(selector.kind().table(), &range, Some(limit), request.reverse)?;
        rows.into_iter()
            .map(|(key, doc)| {
                let doc: IndexDocument = serde_json::from_value(doc)?;
                Ok(QueryItem {
                    id: hex::encode(&key),
                    record: self.store.get_as(PRIMARY_TABLE, doc.to.as_bytes())?,
                })
            })
            .collect()
    }

    pub fn open(&self, selector: &IndexSelector, request: &RangeRequest) -> Result<LiveRangeQuery> {
        let (range, limit) = self.plan(selector, request)?;
        LiveRangeQuery::open(
            Arc::clone(&self.store),
            selector.kind(),
            range,
            limit,
            request.reverse,
        )
    }
}

#[derive(Debug)]
struct EntryState {
    target: String,
    /// Add deliveries seen for this entry minus removals.
    refs: usize,
}

struct TargetState {
    snapshot: Option<ReadHistory>,
    entries: BTreeSet<Vec<u8>>,
    subscription: Subscription,
}

/// Open range query. Dropping it cancels every subscription it holds.
pub struct LiveRangeQuery {
    store: Arc<RecordStore>,
    kind: IndexKind,
    range: KeyRange,
    limit: usize,
    reverse: bool,
    index_subscription: Subscription,
    sender: DeliverySender,
    receiver: DeliveryReceiver,
    entries: BTreeMap<Vec<u8>, EntryState>,
    targets: HashMap<String, TargetState>,
    watches: HashMap<SubscriptionId, String>,
    pending: VecDeque<QueryEvent>,
}

impl LiveRangeQuery {
    fn open(
        store: Arc<RecordStore>,
        kind: IndexKind,
        range: KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Result<Self> {
        let (sender, receiver) = ChangeFeed::channel();
        let (index_subscription, rows) = store.with_barrier(|| {
            let subscription = store.subscribe_with(kind.table(), sender.clone());
            let rows = store.range(kind.table(), &range, Some(limit), reverse)?;
            Ok::<_, ReadHistoryError>((subscription, rows))
        })?;

        let mut query = Self {
            store,
            kind,
            range,
            limit,
            reverse,
            index_subscription,
            sender,
            receiver,
            entries: BTreeMap::new(),
            targets: HashMap::new(),
            watches: HashMap::new(),
            pending: VecDeque::new(),
        };
        for (key, doc) in rows {
            query.add_entry(key, serde_json::from_value(doc)?)?;
        }
        debug!(
            index = kind.name(),
            entries = query.entries.len(),
            targets = query.targets.len(),
            "range query opened"
        );
        Ok(query)
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Current window in query order.
    pub fn items(&self) -> Vec<QueryItem> {
        let item = |(key, entry): (&Vec<u8>, &EntryState)| QueryItem {
            id: hex::encode(key),
            record: self
                .targets
                .get(&entry.target)
                .and_then(|target| target.snapshot.clone()),
        };
        if self.reverse {
            self.entries.iter().rev().map(item).collect()
        } else {
            self.entries.iter().map(item).collect()
        }
    }

    /// Number of distinct records currently watched.
    pub fn watched_targets(&self) -> usize {
        self.targets.len()
    }

    /// Waits for the next non-empty batch of events.
    pub async fn next_batch(&mut self) -> Result<Vec<QueryEvent>> {
        loop {
            if !self.pending.is_empty() {
                return Ok(self.drain_pending());
            }
            let Some(delivery) = self.receiver.recv().await else {
                return Ok(Vec::new());
            };
            let index_changed = self.ingest(delivery)?;
            let drained = self.drain_channel()?;
            if index_changed || drained {
                self.reconcile_window()?;
            }
        }
    }

    /// Processes whatever is buffered and returns the resulting events.
    pub fn poll_pending(&mut self) -> Result<Vec<QueryEvent>> {
        if self.drain_channel()? {
            self.reconcile_window()?;
        }
        Ok(self.drain_pending())
    }

    /// Applies one delivery. Returns whether it came from the index feed.
    pub fn ingest(&mut self, delivery: Delivery) -> Result<bool> {
        if delivery.subscription == self.index_subscription.id() {
            self.on_index_change(&delivery.change)?;
            Ok(true)
        } else {
            self.on_record_change(delivery.subscription, &delivery.change)?;
            Ok(false)
        }
    }

    pub fn close(self) {
        debug!(index = self.kind.name(), "range query closed");
    }

    fn drain_channel(&mut self) -> Result<bool> {
        let mut index_changed = false;
        loop {
            match self.receiver.try_recv() {
                Ok(delivery) => index_changed |= self.ingest(delivery)?,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(index_changed),
            }
        }
    }

    fn drain_pending(&mut self) -> Vec<QueryEvent> {
        let events: Vec<_> = self.pending.drain(..).collect();
        for event in &events {
            counter!("readdbx_query_events_total", "event" => event.label()).increment(1);
        }
        events
    }

    fn on_index_change(&mut self, change: &Change) -> Result<()> {
        if !self.range.contains(&change.key) {
            return Ok(());
        }
        let old = change.old_as::<IndexDocument>()?;
        let new = change.new_as::<IndexDocument>()?;
        match (old, new) {
            (None, Some(doc)) => {
                if self.fits_window(&change.key) {
                    self.add_entry(change.key.clone(), doc)?;
                }
            }
            (Some(_), None) => self.remove_entry(&change.key),
            (Some(old), Some(new)) if old.to != new.to => {
                self.evict(&change.key);
                self.add_entry(change.key.clone(), new)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_record_change(&mut self, watch: SubscriptionId, change: &Change) -> Result<()> {
        let Some(target_id) = self.watches.get(&watch).cloned() else {
            debug!(?watch, "dropping delivery for a released watch");
            return Ok(());
        };
        let record = change.new_as::<ReadHistory>()?;
        let Some(target) = self.targets.get_mut(&target_id) else {
            return Ok(());
        };

        match record {
            Some(record) => {
                if target.snapshot.as_ref() == Some(&record) {
                    return Ok(());
                }
                let previous = target.snapshot.replace(record.clone());
                for key in &target.entries {
                    self.pending.push_back(QueryEvent::Updated {
                        item: QueryItem {
                            id: hex::encode(key),
                            record: Some(record.clone()),
                        },
                        previous: previous.clone(),
                    });
                }
            }
            None => {
                let keys: Vec<_> = target.entries.iter().cloned().collect();
                for key in keys {
                    self.evict(&key);
                }
            }
        }
        Ok(())
    }

    /// Whether a new key belongs in a full window.
    fn fits_window(&self, key: &[u8]) -> bool {
        if self.entries.len() < self.limit {
            return true;
        }
        if self.reverse {
            self.entries
                .keys()
                .next()
                .is_some_and(|lowest| key > lowest.as_slice())
        } else {
            self.entries
                .keys()
                .next_back()
                .is_some_and(|highest| key < highest.as_slice())
        }
    }

    fn add_entry(&mut self, key: Vec<u8>, doc: IndexDocument) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refs += 1;
            return Ok(());
        }

        let snapshot = match self.targets.get_mut(&doc.to) {
            Some(target) => {
                target.entries.insert(key.clone());
                target.snapshot.clone()
            }
            None => {
                let (subscription, snapshot) =
                    self.store
                        .watch_key(PRIMARY_TABLE, doc.to.as_bytes(), self.sender.clone())?;
                let snapshot: Option<ReadHistory> = snapshot
                    .map(serde_json::from_value)
                    .transpose()?;
                self.watches.insert(subscription.id(), doc.to.clone());
                self.targets.insert(
                    doc.to.clone(),
                    TargetState {
                        snapshot: snapshot.clone(),
                        entries: BTreeSet::from([key.clone()]),
                        subscription,
                    },
                );
                snapshot
            }
        };

        self.entries.insert(
            key.clone(),
            EntryState {
                target: doc.to,
                refs: 1,
            },
        );
        self.pending.push_back(QueryEvent::Added(QueryItem {
            id: hex::encode(&key),
            record: snapshot,
        }));
        Ok(())
    }

    fn remove_entry(&mut self, key: &[u8]) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let Some(entry) = self.entries.remove(key) else {
            return;
        };

        let mut last = None;
        let mut released = None;
        if let Some(target) = self.targets.get_mut(&entry.target) {
            target.entries.remove(key);
            last = target.snapshot.clone();
            if target.entries.is_empty() {
                released = self.targets.remove(&entry.target);
            }
        }
        if let Some(target) = released {
            self.watches.remove(&target.subscription.id());
        }
        self.pending.push_back(QueryEvent::Removed {
            id: hex::encode(key),
            last,
        });
    }

    /// Removes an entry regardless of how many adds it has seen.
    fn evict(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refs = 1;
        }
        self.remove_entry(key);
    }

    /// Brings the window back to the first `limit` entries of the range.
    fn reconcile_window(&mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        store.with_barrier(|| {
            self.drain_channel()?;
            let rows = store.range(self.kind.table(), &self.range, Some(self.limit), self.reverse)?;
            let desired: BTreeSet<&Vec<u8>> = rows.iter().map(|(key, _)| key).collect();
            let stale: Vec<Vec<u8>> = self
                .entries
                .keys()
                .filter(|key| !desired.contains(key))
                .cloned()
                .collect();
            for key in stale {
                self.evict(&key);
            }
            for (key, doc) in &rows {
                if !self.entries.contains_key(key) {
                    self.add_entry(key.clone(), serde_json::from_value(doc.clone())?)?;
                }
            }
            Ok(())
        })
    }
}
