use std::sync::Arc;

use anyhow::{Context, Result};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use readdbx::{
    ReadHistoryService,
    config::Config,
    counter::{AggregationKey, CounterMaintainer, CounterStrategy, Counts, DEFAULT_SCAN_LIMIT},
    feed::ChangeFeed,
    maintainer::{PRIMARY_TABLE, RecordMaintainer},
    model::{Actor, EventKind, ReadHistory, ReadHistoryEvent, Target, record_id},
    pipeline::Pipeline,
    projection::{IndexKind, ProjectionEngine},
    store::{Change, RecordStore},
};

const USERS: [&str; 3] = ["u1", "u2", "u3"];
const TYPES: [&str; 2] = ["priv", "group"];
const TARGETS: [&str; 3] = ["t1", "t2", "t3"];
const KINDS: [EventKind; 3] = [EventKind::NewEvent, EventKind::Read, EventKind::Write];

fn random_events(rng: &mut StdRng, count: usize) -> Vec<ReadHistoryEvent> {
    let mut events = Vec::with_capacity(count * 2);
    for _ in 0..count {
        let second = rng.gen_range(0..60);
        let event = ReadHistoryEvent {
            kind: *KINDS.choose(rng).unwrap(),
            user: Some(USERS.choose(rng).unwrap().to_string()),
            session: None,
            target_type: TYPES.choose(rng).unwrap().to_string(),
            target_id: TARGETS.choose(rng).unwrap().to_string(),
            token: format!("2024-01-01T00:00:{second:02}.000Z_{}", rng.gen_range(0..4)),
        };
        if rng.gen_bool(0.3) {
            events.push(event.clone());
        }
        events.push(event);
    }
    events.shuffle(rng);
    events
}

fn expected(records: &[ReadHistory], key: &AggregationKey) -> Counts {
    let members = records.iter().filter(|record| {
        record.actor == key.actor
            && key
                .target_type
                .as_deref()
                .is_none_or(|target_type| record.target_type == target_type)
    });
    let mut counts = Counts::default();
    for record in members {
        counts.tracked += 1;
        counts.unread += u64::from(record.is_unread());
        counts.unanswered += u64::from(record.is_unanswered());
    }
    counts
}

fn all_records(maintainer: &RecordMaintainer) -> Result<Vec<ReadHistory>> {
    let mut records = Vec::new();
    for user in USERS {
        for target_type in TYPES {
            for target_id in TARGETS {
                let actor = Actor::User(user.into());
                let target = Target::new(target_type, target_id)?;
                if let Some(record) = maintainer.get(&record_id(&actor, &target))? {
                    records.push(record);
                }
            }
        }
    }
    Ok(records)
}

fn assert_counters_match(
    maintainer: &RecordMaintainer,
    counts: impl Fn(&AggregationKey) -> readdbx::Result<Counts>,
    label: &str,
) -> Result<()> {
    let records = all_records(maintainer)?;
    for user in USERS {
        let actor = Actor::User(user.into());
        let mut keys = vec![AggregationKey::global(actor.clone())];
        keys.extend(
            TYPES
                .iter()
                .map(|target_type| AggregationKey::per_type(actor.clone(), *target_type)),
        );
        for key in keys {
            let actual = counts(&key)?;
            assert_eq!(actual, expected(&records, &key), "{label}: {key:?}");
        }
    }
    Ok(())
}

#[tokio::test]
async fn counters_match_records_under_random_interleavings() -> Result<()> {
    for strategy in [
        CounterStrategy::Guarded,
        CounterStrategy::Membership,
        CounterStrategy::RangeScan,
    ] {
        for seed in 0..4u64 {
            let dir = tempfile::tempdir().context("failed to create temp dir")?;
            let mut config = Config::default();
            config.data_dir = dir.path().join("data");
            config.counters.strategy = strategy;
            let service = ReadHistoryService::open(config)?;

            let mut rng = StdRng::seed_from_u64(seed);
            let events = random_events(&mut rng, 60);
            for (index, event) in events.into_iter().enumerate() {
                service.apply(event)?;
                // Let the pipeline fall behind by a random amount.
                if index % rng.gen_range(1..8) == 0 {
                    service.pump()?;
                }
            }
            service.pump()?;
            assert_counters_match(
                service.maintainer(),
                |key| service.get_count(key),
                &format!("{strategy} seed {seed}"),
            )?;
        }
    }
    Ok(())
}

/// Handlers fed the way the pipeline feeds them, plus taps that record
/// every change the handlers saw so it can be delivered again.
struct Replay {
    _dir: tempfile::TempDir,
    maintainer: RecordMaintainer,
    projection: ProjectionEngine,
    counters: CounterMaintainer,
    pipeline: Pipeline,
    taps: Vec<ChangeFeed>,
    seen: Vec<Arc<Change>>,
}

impl Replay {
    fn open(strategy: CounterStrategy) -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let store = Arc::new(RecordStore::open(dir.path().join("store"))?);
        let counters = CounterMaintainer::new(Arc::clone(&store), strategy, DEFAULT_SCAN_LIMIT);
        let pipeline = Pipeline::new(
            &store,
            ProjectionEngine::new(Arc::clone(&store), IndexKind::ALL.to_vec()),
            counters.clone(),
        );
        let mut tables = vec![PRIMARY_TABLE];
        tables.extend(
            strategy
                .source_tables()
                .into_iter()
                .filter(|table| *table != PRIMARY_TABLE),
        );
        Ok(Self {
            maintainer: RecordMaintainer::new(Arc::clone(&store)),
            projection: ProjectionEngine::new(Arc::clone(&store), IndexKind::ALL.to_vec()),
            counters,
            pipeline,
            taps: tables.into_iter().map(|table| store.subscribe(table)).collect(),
            seen: Vec::new(),
            _dir: dir,
        })
    }

    fn pump(&mut self) -> Result<()> {
        self.pipeline.pump()?;
        for tap in &mut self.taps {
            while let Some(change) = tap.try_next() {
                self.seen.push(change);
            }
        }
        Ok(())
    }

    /// Hands an already handled change to its handlers again.
    fn redeliver(&self, change: &Change) -> Result<()> {
        if change.table == PRIMARY_TABLE {
            self.projection.on_change(change)?;
        }
        self.counters.on_change(change)?;
        Ok(())
    }
}

#[tokio::test]
async fn counters_survive_duplicate_and_stale_deliveries() -> Result<()> {
    for strategy in [
        CounterStrategy::Guarded,
        CounterStrategy::Membership,
        CounterStrategy::RangeScan,
    ] {
        for seed in 0..4u64 {
            let mut replay = Replay::open(strategy)?;
            let mut rng = StdRng::seed_from_u64(seed);
            let mut redelivered = 0;
            for event in random_events(&mut rng, 60) {
                replay.maintainer.apply_raw(event)?;
                replay.pump()?;
                if replay.seen.is_empty() || !rng.gen_bool(0.4) {
                    continue;
                }
                // Old changes come back too, not just the latest one.
                let picks: Vec<_> = replay
                    .seen
                    .choose_multiple(&mut rng, 3)
                    .cloned()
                    .collect();
                for change in &picks {
                    replay.redeliver(change)?;
                    redelivered += 1;
                }
                replay.pump()?;
            }
            for change in replay.seen.clone() {
                replay.redeliver(&change)?;
            }
            replay.pump()?;

            assert!(redelivered > 0, "{strategy} seed {seed}: nothing redelivered");
            assert_counters_match(
                &replay.maintainer,
                |key| replay.counters.counts(key),
                &format!("{strategy} seed {seed} with redelivery"),
            )?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn sessions_count_separately_from_users() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.data_dir = dir.path().join("data");
    let service = ReadHistoryService::open(config)?;

    for (user, session) in [(Some("u1"), None), (None, Some("u1"))] {
        service.apply(ReadHistoryEvent {
            kind: EventKind::NewEvent,
            user: user.map(str::to_string),
            session: session.map(str::to_string),
            target_type: "priv".into(),
            target_id: "t1".into(),
            token: "2024-01-01T00:00:00.000Z_1".into(),
        })?;
    }
    service.pump()?;

    let user = service.get_count(&AggregationKey::global(Actor::User("u1".into())))?;
    let session = service.get_count(&AggregationKey::global(Actor::Session("u1".into())))?;
    assert_eq!(user.unread, 1);
    assert_eq!(session.unread, 1);
    Ok(())
}
