use std::{collections::HashMap, sync::Arc, time::Duration};

use metrics::counter;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    counter::CounterMaintainer,
    error::Result,
    feed::{ChangeFeed, Delivery, DeliveryReceiver, Subscription, SubscriptionId},
    maintainer::PRIMARY_TABLE,
    projection::ProjectionEngine,
    store::RecordStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Projection,
    Counter,
}

impl Handler {
    fn name(self) -> &'static str {
        match self {
            Self::Projection => "projection",
            Self::Counter => "counter",
        }
    }
}

const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// Routes store changes to the projection engine and the counter maintainer.
///
/// A change whose handler fails is held and retried before anything newer,
/// so every change is handled at least once and in commit order.
pub struct Pipeline {
    projection: ProjectionEngine,
    counters: CounterMaintainer,
    receiver: DeliveryReceiver,
    routes: HashMap<SubscriptionId, Handler>,
    held: Option<Delivery>,
    failures: u32,
    _subscriptions: Vec<Subscription>,
}

impl Pipeline {
    pub fn new(
        store: &Arc<RecordStore>,
        projection: ProjectionEngine,
        counters: CounterMaintainer,
    ) -> Self {
        let (sender, receiver) = ChangeFeed::channel();
        let mut routes = HashMap::new();
        let mut subscriptions = Vec::new();

        let primary = store.subscribe_with(PRIMARY_TABLE, sender.clone());
        routes.insert(primary.id(), Handler::Projection);
        subscriptions.push(primary);

        for table in counters.strategy().source_tables() {
            let subscription = store.subscribe_with(table, sender.clone());
            routes.insert(subscription.id(), Handler::Counter);
            subscriptions.push(subscription);
        }

        Self {
            projection,
            counters,
            receiver,
            routes,
            held: None,
            failures: 0,
            _subscriptions: subscriptions,
        }
    }

    pub fn handle(&self, delivery: &Delivery) -> Result<()> {
        let Some(handler) = self.routes.get(&delivery.subscription).copied() else {
            return Ok(());
        };
        let result = match handler {
            Handler::Projection => self.projection.on_change(&delivery.change),
            Handler::Counter => self.counters.on_change(&delivery.change),
        };
        let status = if result.is_ok() { "ok" } else { "err" };
        counter!(
            "readdbx_pipeline_deliveries_total",
            "handler" => handler.name(),
            "status" => status
        )
        .increment(1);
        result
    }

    /// Handles buffered changes, including the ones handling produces,
    /// until nothing is left. Returns how many were handled.
    ///
    /// On failure the change stays queued and the next call starts with it.
    pub fn pump(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(delivery) = self.held.take().or_else(|| self.receiver.try_recv().ok()) {
            self.attempt(delivery)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Handles changes until `shutdown` flips to `true`. A failing change
    /// is retried with doubling backoff and blocks the ones behind it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(strategy = %self.counters.strategy(), "pipeline started");
        loop {
            let delivery = match self.held.take() {
                Some(delivery) => delivery,
                None => tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    delivery = self.receiver.recv() => {
                        let Some(delivery) = delivery else {
                            break;
                        };
                        delivery
                    }
                },
            };
            if let Err(err) = self.attempt(delivery) {
                let delay = self.retry_delay();
                error!(
                    failures = self.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "failed to handle change: {err}"
                );
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        if let Some(delivery) = &self.held {
            warn!(
                table = %delivery.change.table,
                seq = %delivery.change.seq,
                "pipeline stopped with an unhandled change"
            );
        }
        info!("pipeline stopped");
    }

    fn attempt(&mut self, delivery: Delivery) -> Result<()> {
        match self.handle(&delivery) {
            Ok(()) => {
                self.failures = 0;
                Ok(())
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                warn!(
                    table = %delivery.change.table,
                    seq = %delivery.change.seq,
                    failures = self.failures,
                    "change held for retry"
                );
                self.held = Some(delivery);
                Err(err)
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(10);
        RETRY_BASE.saturating_mul(1 << exponent).min(RETRY_MAX)
    }
}
