//! In-process change notification.
//!
//! The store publishes every committed change to the subscribers registered
//! for its table and for its exact key. Delivery goes through unbounded
//! channels, so a slow consumer never stalls a writer and nothing is dropped.
//! Publishing happens while the writer still holds the key's stripe lock,
//! which keeps deliveries for one key in commit order.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::store::Change;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub change: Arc<Change>,
}

pub type DeliverySender = UnboundedSender<Delivery>;
pub type DeliveryReceiver = UnboundedReceiver<Delivery>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Table(String),
    Key(String, Vec<u8>),
}

#[derive(Default)]
struct Subscribers {
    tables: HashMap<String, HashMap<SubscriptionId, DeliverySender>>,
    keys: HashMap<(String, Vec<u8>), HashMap<SubscriptionId, DeliverySender>>,
}

#[derive(Default)]
pub(crate) struct FeedRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Subscribers>,
}

impl FeedRegistry {
    pub(crate) fn subscribe_table(
        self: &Arc<Self>,
        table: &str,
        sender: DeliverySender,
    ) -> Subscription {
        self.register(Scope::Table(table.to_string()), sender)
    }

    pub(crate) fn subscribe_key(
        self: &Arc<Self>,
        table: &str,
        key: &[u8],
        sender: DeliverySender,
    ) -> Subscription {
        self.register(Scope::Key(table.to_string(), key.to_vec()), sender)
    }

    fn register(self: &Arc<Self>, scope: Scope, sender: DeliverySender) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        {
            let mut subscribers = self.subscribers.write();
            match &scope {
                Scope::Table(table) => subscribers
                    .tables
                    .entry(table.clone())
                    .or_default()
                    .insert(id, sender),
                Scope::Key(table, key) => subscribers
                    .keys
                    .entry((table.clone(), key.clone()))
                    .or_default()
                    .insert(id, sender),
            };
        }
        Subscription {
            id,
            scope,
            registry: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: SubscriptionId, scope: &Scope) {
        let mut subscribers = self.subscribers.write();
        match scope {
            Scope::Table(table) => {
                if let Some(map) = subscribers.tables.get_mut(table) {
                    map.remove(&id);
                    if map.is_empty() {
                        subscribers.tables.remove(table);
                    }
                }
            }
            Scope::Key(table, key) => {
                let slot = (table.clone(), key.clone());
                if let Some(map) = subscribers.keys.get_mut(&slot) {
                    map.remove(&id);
                    if map.is_empty() {
                        subscribers.keys.remove(&slot);
                    }
                }
            }
        }
    }

    pub(crate) fn publish(&self, change: &Arc<Change>) {
        let subscribers = self.subscribers.read();
        let by_table = subscribers.tables.get(&change.table);
        let by_key = subscribers
            .keys
            .get(&(change.table.clone(), change.key.clone()));
        for (id, sender) in by_table.into_iter().chain(by_key).flatten() {
            // A closed receiver unregisters itself when its guard drops.
            let _ = sender.send(Delivery {
                subscription: *id,
                change: Arc::clone(change),
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.read();
        subscribers.tables.values().map(HashMap::len).sum::<usize>()
            + subscribers.keys.values().map(HashMap::len).sum::<usize>()
    }
}

/// Registration guard. Dropping it stops delivery immediately.
pub struct Subscription {
    id: SubscriptionId,
    scope: Scope,
    registry: Weak<FeedRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id, &self.scope);
        }
    }
}

/// A table subscription with its own receiving end.
pub struct ChangeFeed {
    subscription: Subscription,
    receiver: DeliveryReceiver,
}

impl ChangeFeed {
    pub(crate) fn new(subscription: Subscription, receiver: DeliveryReceiver) -> Self {
        Self {
            subscription,
            receiver,
        }
    }

    pub(crate) fn channel() -> (DeliverySender, DeliveryReceiver) {
        mpsc::unbounded_channel()
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub async fn recv(&mut self) -> Option<Arc<Change>> {
        self.receiver.recv().await.map(|delivery| delivery.change)
    }

    /// Next buffered change without waiting.
    pub fn try_next(&mut self) -> Option<Arc<Change>> {
        match self.receiver.try_recv() {
            Ok(delivery) => Some(delivery.change),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}
