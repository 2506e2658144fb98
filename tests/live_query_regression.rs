use std::time::Duration;

use anyhow::{Context, Result};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use readdbx::{
    ReadHistoryService,
    config::Config,
    model::{Actor, EventKind, ReadHistoryEvent},
    query::{IndexSelector, QueryEvent, QueryItem, RangeRequest},
};
use tempfile::TempDir;
use tokio::sync::watch;

fn open_service() -> Result<(TempDir, ReadHistoryService)> {
    let dir = tempfile::tempdir().context("failed to create temp dir")?;
    let mut config = Config::default();
    config.data_dir = dir.path().join("data");
    let service = ReadHistoryService::open(config)?;
    Ok((dir, service))
}

fn event(kind: EventKind, user: &str, target_id: &str, second: u32) -> ReadHistoryEvent {
    ReadHistoryEvent {
        kind,
        user: Some(user.into()),
        session: None,
        target_type: "priv".into(),
        target_id: target_id.into(),
        token: format!("2024-01-01T00:00:{second:02}.000Z_1"),
    }
}

fn ids(items: &[QueryItem]) -> Vec<&str> {
    items.iter().map(|item| item.id.as_str()).collect()
}

#[tokio::test]
async fn live_window_converges_to_scan() -> Result<()> {
    let (_dir, service) = open_service()?;
    let actor = Actor::User("u1".into());
    let targets = ["t1", "t2", "t3", "t4", "t5", "t6"];

    for reverse in [false, true] {
        let selector = IndexSelector::ActivityByActor {
            actor: actor.clone(),
        };
        let request = RangeRequest {
            limit: Some(4),
            reverse,
            ..RangeRequest::default()
        };
        let mut query = service.open_query(&selector, &request)?;

        let mut rng = StdRng::seed_from_u64(u64::from(reverse));
        for _ in 0..40 {
            let kind = *[EventKind::NewEvent, EventKind::Write, EventKind::Read]
                .choose(&mut rng)
                .unwrap();
            let target = targets.choose(&mut rng).unwrap();
            service.apply(event(kind, "u1", target, rng.gen_range(0..60)))?;
            if rng.gen_bool(0.5) {
                service.pump()?;
                query.poll_pending()?;
            }
        }
        service.pump()?;
        query.poll_pending()?;

        let expected = service.range_query(&selector, &request)?;
        assert_eq!(ids(&query.items()), ids(&expected), "reverse={reverse}");
        assert_eq!(query.items(), expected, "reverse={reverse}");
        assert!(query.watched_targets() <= 4);
        query.close();
    }
    Ok(())
}

#[tokio::test]
async fn unread_query_emits_added_then_removed() -> Result<()> {
    let (_dir, service) = open_service()?;
    let selector = IndexSelector::UnreadByActor {
        actor: Actor::User("u1".into()),
        target_type: None,
    };
    let mut query = service.open_query(&selector, &RangeRequest::default())?;
    assert!(query.items().is_empty());

    service.apply(event(EventKind::NewEvent, "u1", "t1", 1))?;
    service.pump()?;
    let events = query.poll_pending()?;
    assert!(matches!(events.as_slice(), [QueryEvent::Added(item)] if item.record.is_some()));
    let added_id = events[0].id().to_string();

    service.apply(event(EventKind::Read, "u1", "t1", 2))?;
    service.pump()?;
    let events = query.poll_pending()?;
    let removed: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, QueryEvent::Removed { .. }))
        .collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id(), added_id);
    assert_eq!(query.watched_targets(), 0);
    Ok(())
}

#[tokio::test]
async fn record_updates_reach_open_queries() -> Result<()> {
    let (_dir, service) = open_service()?;
    service.apply(event(EventKind::NewEvent, "u1", "t1", 1))?;
    service.pump()?;

    let selector = IndexSelector::ByTarget {
        target_type: "priv".into(),
        target_id: "t1".into(),
    };
    let mut query = service.open_query(&selector, &RangeRequest::default())?;
    assert_eq!(query.items().len(), 1);

    service.apply(event(EventKind::Read, "u1", "t1", 2))?;
    service.pump()?;
    let events = query.poll_pending()?;
    let [QueryEvent::Updated { item, previous }] = events.as_slice() else {
        panic!("expected one update, got {events:?}");
    };
    assert!(previous.as_ref().is_some_and(|record| record.is_unread()));
    assert!(item.record.as_ref().is_some_and(|record| !record.is_unread()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn next_batch_follows_background_pipeline() -> Result<()> {
    let (_dir, service) = open_service()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = service
        .spawn_pipeline(shutdown_rx)
        .context("pipeline already running")?;

    let selector = IndexSelector::ActivityByActor {
        actor: Actor::User("u1".into()),
    };
    let mut query = service.open_query(&selector, &RangeRequest::default())?;
    service.apply(event(EventKind::NewEvent, "u1", "t1", 1))?;

    let batch = tokio::time::timeout(Duration::from_secs(5), query.next_batch())
        .await
        .context("no batch before timeout")??;
    assert!(
        batch
            .iter()
            .any(|event| matches!(event, QueryEvent::Added(_)))
    );

    shutdown_tx.send(true)?;
    handle.await?;
    Ok(())
}
