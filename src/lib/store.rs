use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    ops::Bound,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    error::{ReadHistoryError, Result},
    feed::{ChangeFeed, DeliverySender, FeedRegistry, Subscription},
    key::KeyRange,
    seq::{ChangeSeq, SeqGenerator},
};

const SEP: u8 = 0x1F;
const META_TABLE: &str = "meta";
const META_LAST_SEQ: &[u8] = b"last_seq";
const STRIPES: usize = 64;

pub type Document = Value;

/// One committed mutation of a single key.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub seq: ChangeSeq,
    pub table: String,
    pub key: Vec<u8>,
    pub old: Option<Document>,
    pub new: Option<Document>,
}

impl Change {
    pub fn old_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode_document(self.old.as_ref())
    }

    pub fn new_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode_document(self.new.as_ref())
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }
}

fn decode_document<T: DeserializeOwned>(doc: Option<&Document>) -> Result<Option<T>> {
    doc.map(|doc| T::deserialize(doc).map_err(ReadHistoryError::from))
        .transpose()
}

/// Idempotent merge instruction for [`RecordStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Fill each listed field that the document does not have yet.
    CreateIfAbsent(Map<String, Value>),
    /// Raise `field` to `value` when `value` is strictly greater.
    MaxMerge { field: String, value: Value },
}

impl UpdateOp {
    pub fn max_merge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::MaxMerge {
            field: field.into(),
            value: value.into(),
        }
    }

    fn apply(&self, doc: &mut Map<String, Value>) -> Result<()> {
        match self {
            Self::CreateIfAbsent(fields) => {
                for (field, value) in fields {
                    doc.entry(field.clone()).or_insert_with(|| value.clone());
                }
                Ok(())
            }
            Self::MaxMerge { field, value } => {
                let replace = match doc.get(field) {
                    None | Some(Value::Null) => true,
                    Some(current) => is_greater(value, current).ok_or_else(|| {
                        ReadHistoryError::Storage(format!(
                            "cannot max-merge {value} into `{field}` holding {current}"
                        ))
                    })?,
                };
                if replace {
                    doc.insert(field.clone(), value.clone());
                }
                Ok(())
            }
        }
    }
}

fn is_greater(candidate: &Value, current: &Value) -> Option<bool> {
    match (candidate, current) {
        (Value::String(a), Value::String(b)) => Some(a > b),
        (Value::Number(a), Value::Number(b)) => match (a.as_u64(), b.as_u64()) {
            (Some(a), Some(b)) => Some(a > b),
            _ => Some(a.as_f64()? > b.as_f64()?),
        },
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanCount {
    pub count: u64,
    /// The scan stopped at its cap; `count` is a lower bound.
    pub truncated: bool,
}

/// Ordered key-value tables over RocksDB with per-key atomic updates and a
/// change feed.
pub struct RecordStore {
    db: DBWithThreadMode<MultiThreaded>,
    stripes: Vec<RwLock<()>>,
    seq: Mutex<SeqGenerator>,
    feeds: Arc<FeedRegistry>,
}

impl RecordStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)
            .map_err(|err| ReadHistoryError::Storage(err.to_string()))?;

        let last_seq = db
            .get(full_key(META_TABLE, META_LAST_SEQ))?
            .map(|bytes| {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    ReadHistoryError::Storage("corrupt change sequence marker".into())
                })?;
                Ok::<_, ReadHistoryError>(ChangeSeq::from_u64(u64::from_be_bytes(raw)))
            })
            .transpose()?
            .unwrap_or(ChangeSeq::ZERO);

        Ok(Self {
            db,
            stripes: (0..STRIPES).map(|_| RwLock::new(())).collect(),
            seq: Mutex::new(SeqGenerator::resume(last_seq)),
            feeds: Arc::new(FeedRegistry::default()),
        })
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Document>> {
        let start = Instant::now();
        let result = self.read_document(table, key);
        record_store_op("get", status(&result), start.elapsed().as_secs_f64());
        result
    }

    pub fn get_as<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>> {
        decode_document(self.get(table, key)?.as_ref())
    }

    /// Applies merge operations atomically. Returns `None` when the document
    /// was already in the merged state; nothing is written or published then.
    pub fn update(&self, table: &str, key: &[u8], ops: &[UpdateOp]) -> Result<Option<Arc<Change>>> {
        self.modify(table, key, |current| {
            let mut doc = match current {
                Some(Value::Object(map)) => map.clone(),
                Some(other) => {
                    return Err(ReadHistoryError::Storage(format!(
                        "cannot merge into non-object document {other}"
                    )));
                }
                None => Map::new(),
            };
            for op in ops {
                op.apply(&mut doc)?;
            }
            Ok(Some(Value::Object(doc)))
        })
    }

    /// Atomic read-modify-write of one key. `f` sees the current document
    /// and returns the replacement, or `None` to delete.
    pub fn modify<F>(&self, table: &str, key: &[u8], f: F) -> Result<Option<Arc<Change>>>
    where
        F: FnOnce(Option<&Document>) -> Result<Option<Document>>,
    {
        let start = Instant::now();
        let result = (|| {
            let _guard = self.stripe(table, key).write();
            let old = self.read_document(table, key)?;
            let new = f(old.as_ref())?;
            if old == new {
                return Ok(None);
            }

            let seq = self.seq.lock().next_seq();
            let mut batch = WriteBatch::default();
            let full = full_key(table, key);
            match &new {
                Some(doc) => batch.put(&full, serde_json::to_vec(doc)?),
                None => batch.delete(&full),
            }
            batch.put(full_key(META_TABLE, META_LAST_SEQ), seq.to_be_bytes());
            self.db
                .write(batch)
                .map_err(|err| ReadHistoryError::Storage(err.to_string()))?;

            let change = Arc::new(Change {
                seq,
                table: table.to_string(),
                key: key.to_vec(),
                old,
                new,
            });
            self.feeds.publish(&change);
            Ok(Some(change))
        })();
        record_store_op("modify", status(&result), start.elapsed().as_secs_f64());
        result
    }

    /// Atomic read-modify-write across several keys. `f` sees the current
    /// documents in `keys` order and returns their replacements in the same
    /// order. Changed keys commit in one batch and publish in `keys` order.
    pub fn modify_many<F>(&self, keys: &[(&str, &[u8])], f: F) -> Result<Vec<Arc<Change>>>
    where
        F: FnOnce(Vec<Option<Document>>) -> Result<Vec<Option<Document>>>,
    {
        let start = Instant::now();
        let result = (|| {
            if let Some(i) = (1..keys.len()).find(|&i| keys[..i].contains(&keys[i])) {
                return Err(ReadHistoryError::Storage(format!(
                    "key listed twice in one update: {}",
                    String::from_utf8_lossy(keys[i].1)
                )));
            }
            let mut stripes: Vec<usize> = keys
                .iter()
                .map(|(table, key)| self.stripe_index(table, key))
                .collect();
            stripes.sort_unstable();
            stripes.dedup();
            let _guards: Vec<_> = stripes.iter().map(|&i| self.stripes[i].write()).collect();

            let old = keys
                .iter()
                .map(|(table, key)| self.read_document(table, key))
                .collect::<Result<Vec<_>>>()?;
            let new = f(old.clone())?;
            if new.len() != keys.len() {
                return Err(ReadHistoryError::Storage(format!(
                    "expected {} documents, got {}",
                    keys.len(),
                    new.len()
                )));
            }

            let mut batch = WriteBatch::default();
            let mut pending = Vec::new();
            for (((table, key), old), new) in keys.iter().zip(old).zip(new) {
                if old == new {
                    continue;
                }
                let full = full_key(table, key);
                match &new {
                    Some(doc) => batch.put(&full, serde_json::to_vec(doc)?),
                    None => batch.delete(&full),
                }
                pending.push((table.to_string(), key.to_vec(), old, new));
            }
            if pending.is_empty() {
                return Ok(Vec::new());
            }

            let changes: Vec<_> = {
                let mut seq = self.seq.lock();
                pending
                    .into_iter()
                    .map(|(table, key, old, new)| {
                        Arc::new(Change {
                            seq: seq.next_seq(),
                            table,
                            key,
                            old,
                            new,
                        })
                    })
                    .collect()
            };
            if let Some(last) = changes.last() {
                batch.put(full_key(META_TABLE, META_LAST_SEQ), last.seq.to_be_bytes());
            }
            self.db
                .write(batch)
                .map_err(|err| ReadHistoryError::Storage(err.to_string()))?;

            for change in &changes {
                self.feeds.publish(change);
            }
            Ok(changes)
        })();
        record_store_op("modify_many", status(&result), start.elapsed().as_secs_f64());
        result
    }

    pub fn put(&self, table: &str, key: &[u8], doc: Document) -> Result<Option<Arc<Change>>> {
        self.modify(table, key, |_| Ok(Some(doc)))
    }

    pub fn delete(&self, table: &str, key: &[u8]) -> Result<Option<Arc<Change>>> {
        self.modify(table, key, |_| Ok(None))
    }

    /// Ordered scan of `range` within `table`. Keys are returned relative to
    /// the table.
    pub fn range(
        &self,
        table: &str,
        range: &KeyRange,
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Document)>> {
        let start = Instant::now();
        let result = (|| {
            let mut rows = Vec::new();
            if limit == Some(0) || range.is_empty() {
                return Ok(rows);
            }
            self.scan(table, range, reverse, |key, value| {
                let doc: Document = serde_json::from_slice(value)?;
                rows.push((key.to_vec(), doc));
                Ok(limit.is_none_or(|limit| rows.len() < limit))
            })?;
            Ok(rows)
        })();
        record_store_op("range", status(&result), start.elapsed().as_secs_f64());
        result
    }

    /// Counts keys in `range`, stopping after `cap` keys when given.
    pub fn count(&self, table: &str, range: &KeyRange, cap: Option<usize>) -> Result<ScanCount> {
        let start = Instant::now();
        let result = (|| {
            let mut seen = 0usize;
            if range.is_empty() {
                return Ok(ScanCount::default());
            }
            self.scan(table, range, false, |_, _| {
                seen += 1;
                Ok(cap.is_none_or(|cap| seen <= cap))
            })?;
            Ok(match cap {
                Some(cap) if seen > cap => ScanCount {
                    count: cap as u64,
                    truncated: true,
                },
                _ => ScanCount {
                    count: seen as u64,
                    truncated: false,
                },
            })
        })();
        record_store_op("count", status(&result), start.elapsed().as_secs_f64());
        result
    }

    /// Subscribes to every change of `table`.
    pub fn subscribe(&self, table: &str) -> ChangeFeed {
        let (sender, receiver) = ChangeFeed::channel();
        ChangeFeed::new(self.feeds.subscribe_table(table, sender), receiver)
    }

    /// Registers `sender` for `table`, delivering into a shared channel.
    pub fn subscribe_with(&self, table: &str, sender: DeliverySender) -> Subscription {
        self.feeds.subscribe_table(table, sender)
    }

    /// Reads one key and subscribes to it with no change falling between the
    /// snapshot and the first delivery.
    pub fn watch_key(
        &self,
        table: &str,
        key: &[u8],
        sender: DeliverySender,
    ) -> Result<(Subscription, Option<Document>)> {
        let _guard = self.stripe(table, key).read_recursive();
        let snapshot = self.read_document(table, key)?;
        let subscription = self.feeds.subscribe_key(table, key, sender);
        Ok((subscription, snapshot))
    }

    /// Runs `f` while no write is in flight on any key. Subscriptions made
    /// inside `f` see exactly the changes committed after the reads in `f`.
    pub fn with_barrier<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guards: Vec<_> = self
            .stripes
            .iter()
            .map(|stripe| stripe.read_recursive())
            .collect();
        f()
    }

    fn read_document(&self, table: &str, key: &[u8]) -> Result<Option<Document>> {
        self.db
            .get(full_key(table, key))
            .map_err(|err| ReadHistoryError::Storage(err.to_string()))?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(ReadHistoryError::from))
            .transpose()
    }

    fn stripe(&self, table: &str, key: &[u8]) -> &RwLock<()> {
        &self.stripes[self.stripe_index(table, key)]
    }

    fn stripe_index(&self, table: &str, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Walks `range` in order, handing table-relative keys to `visit` until
    /// it returns `false`.
    fn scan<F>(&self, table: &str, range: &KeyRange, reverse: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let prefix = table_prefix(table);
        let seek = if reverse {
            match &range.end {
                Bound::Included(end) | Bound::Excluded(end) => full_key(table, end),
                Bound::Unbounded => table_upper_bound(table),
            }
        } else {
            match &range.start {
                Bound::Included(start) | Bound::Excluded(start) => full_key(table, start),
                Bound::Unbounded => prefix.clone(),
            }
        };
        let direction = if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };

        for item in self.db.iterator(IteratorMode::From(seek.as_slice(), direction)) {
            let (key, value) = item.map_err(|err| ReadHistoryError::Storage(err.to_string()))?;
            if !key.starts_with(prefix.as_slice()) {
                if reverse && &key[..] > prefix.as_slice() {
                    continue;
                }
                break;
            }
            let relative = &key[prefix.len()..];
            if !range.contains(relative) {
                // Only the seek boundary itself can fall outside on the near
                // side; anything else means the range is exhausted.
                let near_side = if reverse {
                    !below_end(&range.end, relative)
                } else {
                    !above_start(&range.start, relative)
                };
                if near_side {
                    continue;
                }
                break;
            }
            if !visit(relative, &value)? {
                break;
            }
        }
        Ok(())
    }
}

fn above_start(start: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match start {
        Bound::Included(start) => key >= start.as_slice(),
        Bound::Excluded(start) => key > start.as_slice(),
        Bound::Unbounded => true,
    }
}

fn below_end(end: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match end {
        Bound::Included(end) => key <= end.as_slice(),
        Bound::Excluded(end) => key < end.as_slice(),
        Bound::Unbounded => true,
    }
}

fn table_prefix(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 1);
    key.extend_from_slice(table.as_bytes());
    key.push(SEP);
    key
}

fn table_upper_bound(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 1);
    key.extend_from_slice(table.as_bytes());
    key.push(SEP + 1);
    key
}

fn full_key(table: &str, key: &[u8]) -> Vec<u8> {
    let mut full = table_prefix(table);
    full.extend_from_slice(key);
    full
}

fn status<T>(result: &Result<T>) -> &'static str {
    if result.is_ok() { "ok" } else { "err" }
}

fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("readdbx_store_operations_total", &labels).increment(1);
    histogram!("readdbx_store_operation_duration_seconds", &labels).record(duration);
}
