use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::info;

use crate::{
    config::Config,
    counter::{AggregationKey, CounterMaintainer, Counts},
    error::Result,
    maintainer::RecordMaintainer,
    model::{Actor, EventKind, ReadHistory, ReadHistoryEvent, Target, ValidatedEvent, record_id},
    notify::{NotificationContent, NotificationScheduler, NotificationSender, TimerService},
    pipeline::Pipeline,
    projection::ProjectionEngine,
    query::{IndexSelector, LiveRangeQuery, QueryItem, RangeQueryEngine, RangeRequest},
    store::{Change, RecordStore},
    token::Token,
};

/// Owns the store and every component that reads or maintains it.
///
/// Derived tables are kept current by the [`Pipeline`]. Call [`pump`] to
/// drain it inline, or [`spawn_pipeline`] to run it in the background.
///
/// [`pump`]: ReadHistoryService::pump
/// [`spawn_pipeline`]: ReadHistoryService::spawn_pipeline
pub struct ReadHistoryService {
    config: Config,
    store: Arc<RecordStore>,
    maintainer: RecordMaintainer,
    counters: CounterMaintainer,
    queries: RangeQueryEngine,
    pipeline: Mutex<Option<Pipeline>>,
}

impl ReadHistoryService {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_data_dir()?;
        let store = Arc::new(RecordStore::open(config.store_path())?);

        let maintainer = RecordMaintainer::new(Arc::clone(&store));
        let projection = ProjectionEngine::new(Arc::clone(&store), config.indexes.clone());
        let counters = CounterMaintainer::new(
            Arc::clone(&store),
            config.counters.strategy,
            config.counters.scan_limit,
        );
        let queries = RangeQueryEngine::new(
            Arc::clone(&store),
            config.indexes.clone(),
            config.query.default_limit,
            config.query.max_limit,
        );
        let pipeline = Pipeline::new(&store, projection, counters.clone());

        info!(
            path = %config.store_path().display(),
            strategy = %config.counters.strategy,
            indexes = config.indexes.len(),
            "read history service opened"
        );
        Ok(Self {
            config,
            store,
            maintainer,
            counters,
            queries,
            pipeline: Mutex::new(Some(pipeline)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn maintainer(&self) -> &RecordMaintainer {
        &self.maintainer
    }

    pub fn apply(&self, event: ReadHistoryEvent) -> Result<Option<Arc<Change>>> {
        self.maintainer.apply_raw(event)
    }

    pub fn apply_validated(&self, event: &ValidatedEvent) -> Result<Option<Arc<Change>>> {
        self.maintainer.apply(event)
    }

    pub fn mark_read(
        &self,
        actor: Actor,
        target_type: &str,
        target_id: &str,
        token: &str,
    ) -> Result<Option<Arc<Change>>> {
        let event = ValidatedEvent::new(
            EventKind::Read,
            actor,
            Target::new(target_type, target_id)?,
            Token::parse(token)?,
        )?;
        self.maintainer.apply(&event)
    }

    pub fn get_record(
        &self,
        actor: &Actor,
        target_type: &str,
        target_id: &str,
    ) -> Result<Option<ReadHistory>> {
        actor.validate()?;
        let target = Target::new(target_type, target_id)?;
        self.maintainer.get(&record_id(actor, &target))
    }

    /// Every read history for one target, in actor order.
    pub fn list_records(
        &self,
        target_type: &str,
        target_id: &str,
        request: &RangeRequest,
    ) -> Result<Vec<QueryItem>> {
        Target::new(target_type, target_id)?;
        let selector = IndexSelector::ByTarget {
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
        };
        self.queries.scan(&selector, request)
    }

    pub fn range_query(
        &self,
        selector: &IndexSelector,
        request: &RangeRequest,
    ) -> Result<Vec<QueryItem>> {
        self.queries.scan(selector, request)
    }

    pub fn open_query(
        &self,
        selector: &IndexSelector,
        request: &RangeRequest,
    ) -> Result<LiveRangeQuery> {
        self.queries.open(selector, request)
    }

    pub fn get_count(&self, key: &AggregationKey) -> Result<Counts> {
        key.actor.validate()?;
        self.counters.counts(key)
    }

    pub fn notification_scheduler(
        &self,
        timers: Arc<dyn TimerService>,
        content: Arc<dyn NotificationContent>,
        sender: Arc<dyn NotificationSender>,
    ) -> NotificationScheduler {
        NotificationScheduler::new(
            self.maintainer.clone(),
            timers,
            content,
            sender,
            self.config.notifications.clone(),
        )
    }

    /// Drains pending changes through the pipeline. Returns 0 once the
    /// pipeline has moved to a background task.
    pub fn pump(&self) -> Result<usize> {
        match self.pipeline.lock().as_mut() {
            Some(pipeline) => pipeline.pump(),
            None => Ok(0),
        }
    }

    /// Moves the pipeline onto a tokio task. Returns `None` if it was
    /// already spawned.
    pub fn spawn_pipeline(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let pipeline = self.pipeline.lock().take()?;
        Some(tokio::spawn(pipeline.run(shutdown)))
    }
}
