//! In-process fan-out of write notifications.
//!
//! The bus keeps a subscriber list per namespace. Publishing walks the list,
//! checks each subscriber's filter, and enqueues the poke with a
//! non-blocking send: a full channel drops the poke and bumps the
//! subscriber's missed counter. Pokes are hints, not a reliable feed;
//! subscribers that care re-read from the store on every poke.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use runnel::stream_name::CardinalId;
use runnel::{ConsumerGroup, Poke};
use tokio::sync::mpsc;
use tracing::debug;

/// Per-subscriber queue depth. Matches the write-notification channel size
/// used elsewhere in the stack; a subscriber that falls further behind than
/// this starts missing pokes.
const POKE_CHANNEL_CAPACITY: usize = 64;

/// What a subscriber wants to be poked about.
#[derive(Clone, Debug)]
pub enum SubscriptionFilter {
    Stream {
        stream_name: String,
    },
    Category {
        /// Empty matches every message in the namespace.
        category: String,
        correlation: Option<String>,
        consumer_group: Option<ConsumerGroup>,
    },
}

impl SubscriptionFilter {
    pub fn matches(&self, poke: &Poke) -> bool {
        match self {
            SubscriptionFilter::Stream { stream_name } => poke.stream_name == *stream_name,
            SubscriptionFilter::Category {
                category,
                correlation,
                consumer_group,
            } => {
                if !category.is_empty() && poke.category != *category {
                    return false;
                }
                if let Some(correlation) = correlation {
                    if poke.correlation_category.as_deref() != Some(correlation.as_str()) {
                        return false;
                    }
                }
                if let Some(group) = consumer_group {
                    if !group.includes(CardinalId::of(&poke.stream_name).as_ref()) {
                        return false;
                    }
                }

                true
            }
        }
    }
}

struct SubscriberEntry {
    id: u64,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Poke>,
    missed: Arc<AtomicU64>,
}

type SubscriberList = Arc<Mutex<Vec<SubscriberEntry>>>;

#[derive(Clone, Default)]
pub struct SubscriptionBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    namespaces: DashMap<String, SubscriberList>,
    next_id: AtomicU64,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        SubscriptionBus::default()
    }

    /// Registers a subscriber; the returned guard unsubscribes on drop.
    pub fn subscribe(&self, ns: &str, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(POKE_CHANNEL_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let missed = Arc::new(AtomicU64::new(0));

        let list = self
            .inner
            .namespaces
            .entry(ns.to_string())
            .or_default()
            .clone();
        list.lock().unwrap().push(SubscriberEntry {
            id,
            filter,
            tx,
            missed: Arc::clone(&missed),
        });

        Subscription {
            bus: self.clone(),
            namespace: ns.to_string(),
            id,
            rx,
            missed,
        }
    }

    /// Fans a poke out to every matching subscriber of the namespace.
    /// Never blocks: subscribers with a full queue miss the poke.
    pub fn publish(&self, ns: &str, poke: &Poke) {
        let Some(list) = self.inner.namespaces.get(ns).map(|list| list.clone()) else {
            return;
        };

        let subscribers = list.lock().unwrap();
        for entry in subscribers.iter() {
            if !entry.filter.matches(poke) {
                continue;
            }
            match entry.tx.try_send(poke.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let missed = entry.missed.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(
                        namespace = ns,
                        subscriber = entry.id,
                        missed,
                        "subscriber queue full, poke dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Closes every live subscription. Used by graceful shutdown.
    pub fn shutdown(&self) {
        for entry in self.inner.namespaces.iter() {
            entry.value().lock().unwrap().clear();
        }
        self.inner.namespaces.clear();
    }

    fn remove(&self, ns: &str, id: u64) {
        if let Some(list) = self.inner.namespaces.get(ns) {
            list.lock().unwrap().retain(|entry| entry.id != id);
        }
    }
}

/// A live subscription. Dropping it removes the subscriber from the bus and
/// closes the channel.
pub struct Subscription {
    bus: SubscriptionBus,
    namespace: String,
    id: u64,
    rx: mpsc::Receiver<Poke>,
    missed: Arc<AtomicU64>,
}

impl Subscription {
    /// The next poke, or `None` once the bus shut down.
    pub async fn recv(&mut self) -> Option<Poke> {
        self.rx.recv().await
    }

    /// Pokes dropped because this subscriber's queue was full.
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove(&self.namespace, self.id);
    }
}
