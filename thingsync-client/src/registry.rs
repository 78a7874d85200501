//! Subscription registry and message dispatch
//!
//! The registry maps topic filters to the handler that receives matching
//! messages. It is safe to read and write from any thread; dispatch iterates a
//! point-in-time snapshot, so a concurrent subscribe or unsubscribe never
//! breaks an in-progress dispatch.
//!
//! Entries keep their registration order. Resubscription after a reconnect
//! replays filters in that order.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::message::{Message, Qos};
use crate::scheduler::TaskScheduler;
use crate::topic;

/// Receiver of messages delivered to a subscription.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// A topic filter, the QoS it is requested at and the handler for matching messages.
#[derive(Clone)]
pub struct Subscription {
    filter: String,
    qos: Qos,
    handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn new<H>(filter: impl Into<String>, qos: Qos, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        Self {
            filter: filter.into(),
            qos,
            handler: Arc::new(handler),
        }
    }

    /// Build a subscription around an already shared handler
    pub fn from_shared(filter: impl Into<String>, qos: Qos, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            filter: filter.into(),
            qos,
            handler,
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Concurrent map that remembers insertion order.
///
/// Replacing the value under an existing key keeps the key's original position.
pub(crate) struct SequencedMap<K, V> {
    entries: DashMap<K, (u64, V)>,
    next_seq: AtomicU64,
}

impl<K, V> SequencedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace, returning the previous value.
    pub(crate) fn insert(&self, key: K, value: V) -> Option<V> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let seq = occupied.get().0;
                Some(occupied.insert((seq, value)).1)
            }
            Entry::Vacant(vacant) => {
                let seq = self.seq();
                vacant.insert((seq, value));
                None
            }
        }
    }

    /// Insert only if absent. Returns the value already present otherwise.
    pub(crate) fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().1.clone()),
            Entry::Vacant(vacant) => {
                let seq = self.seq();
                vacant.insert((seq, value));
                None
            }
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, (_, value))| value)
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.1.clone())
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Values in insertion order
    pub(crate) fn snapshot(&self) -> Vec<(K, V)> {
        let mut items: Vec<(u64, K, V)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().0, entry.key().clone(), entry.value().1.clone()))
            .collect();
        items.sort_by_key(|(seq, _, _)| *seq);
        items.into_iter().map(|(_, key, value)| (key, value)).collect()
    }
}

/// Thread-safe filter to subscription table
pub struct SubscriptionRegistry {
    subscriptions: SequencedMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: SequencedMap::new(),
        }
    }

    /// Register a subscription, replacing any entry with the same filter.
    pub fn insert(&self, subscription: Subscription) -> Option<Subscription> {
        self.subscriptions
            .insert(subscription.filter.clone(), subscription)
    }

    pub fn remove(&self, filter: &str) -> Option<Subscription> {
        self.subscriptions.remove(&filter.to_string())
    }

    pub fn get(&self, filter: &str) -> Option<Subscription> {
        self.subscriptions.get(&filter.to_string())
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.subscriptions.contains_key(&filter.to_string())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.subscriptions.clear();
    }

    /// All subscriptions in registration order
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions
            .snapshot()
            .into_iter()
            .map(|(_, subscription)| subscription)
            .collect()
    }

    /// Subscriptions whose filter matches `topic`, in registration order
    pub fn matching(&self, topic: &str) -> Vec<Subscription> {
        self.snapshot()
            .into_iter()
            .filter(|subscription| topic::matches(&subscription.filter, topic))
            .collect()
    }

    /// Deliver `message` to every matching handler on the scheduler.
    ///
    /// Each handler receives its own copy of the message. Returns the number
    /// of handlers the message was scheduled for.
    pub fn dispatch(&self, message: &Message, scheduler: &TaskScheduler) -> usize {
        let matching = self.matching(message.topic());
        let mut delivered = 0;

        for subscription in matching {
            let handler = subscription.handler();
            let copy = message.clone();
            match scheduler.schedule_once(Duration::ZERO, move || handler.on_message(copy)) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "Dropping message on {} for filter {}: {}",
                        message.topic(),
                        subscription.filter,
                        e
                    );
                }
            }
        }

        delivered
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn noop(filter: &str) -> Subscription {
        Subscription::new(filter, Qos::AtMostOnce, |_message: Message| {})
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let registry = SubscriptionRegistry::new();
        for filter in ["c/#", "a/+", "b"] {
            registry.insert(noop(filter));
        }

        // Replacing keeps the original position
        registry.insert(Subscription::new("a/+", Qos::AtLeastOnce, |_message: Message| {}));

        let filters: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|s| s.filter().to_string())
            .collect();
        assert_eq!(filters, vec!["c/#", "a/+", "b"]);
        assert_eq!(registry.get("a/+").unwrap().qos(), Qos::AtLeastOnce);
    }

    #[test]
    fn test_remove_and_reinsert_moves_to_end() {
        let registry = SubscriptionRegistry::new();
        registry.insert(noop("a"));
        registry.insert(noop("b"));
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        registry.insert(noop("a"));

        let filters: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|s| s.filter().to_string())
            .collect();
        assert_eq!(filters, vec!["b", "a"]);
    }

    #[test]
    fn test_matching_selects_by_filter() {
        let registry = SubscriptionRegistry::new();
        registry.insert(noop("sensor/+/value"));
        registry.insert(noop("sensor/#"));
        registry.insert(noop("other"));

        assert_eq!(registry.matching("sensor/1/value").len(), 2);
        assert_eq!(registry.matching("sensor").len(), 1);
        assert!(registry.matching("nothing").is_empty());
    }

    #[test]
    fn test_dispatch_delivers_copy_to_each_match() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::channel();

        for filter in ["sensor/+", "sensor/#"] {
            let tx = tx.clone();
            let name = filter.to_string();
            registry.insert(Subscription::new(filter, Qos::AtMostOnce, move |m: Message| {
                tx.send((name.clone(), m.string_payload())).unwrap();
            }));
        }

        let message = Message::with_payload("sensor/1", Qos::AtMostOnce, "21.5");
        assert_eq!(registry.dispatch(&message, &scheduler), 2);

        let mut seen: Vec<(String, Option<String>)> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen[0], ("sensor/#".to_string(), Some("21.5".to_string())));
        assert_eq!(seen[1], ("sensor/+".to_string(), Some("21.5".to_string())));
    }

    #[test]
    fn test_dispatch_without_match_returns_zero() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let registry = SubscriptionRegistry::new();
        registry.insert(noop("a/b"));
        let message = Message::new("a/c", Qos::AtMostOnce);
        assert_eq!(registry.dispatch(&message, &scheduler), 0);
    }

    #[test]
    fn test_sequenced_map_insert_if_absent() {
        let map: SequencedMap<String, u32> = SequencedMap::new();
        assert_eq!(map.insert_if_absent("lamp".to_string(), 1), None);
        assert_eq!(map.insert_if_absent("lamp".to_string(), 2), Some(1));
        assert_eq!(map.get(&"lamp".to_string()), Some(1));
    }
}
