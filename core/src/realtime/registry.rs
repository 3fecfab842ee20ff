// Subscription registry: maps channel topics to change observers

use super::protocol::{ChangeEvent, TopicFilter};
use crate::gate::CallbackGate;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type ChangeCallback = Box<dyn FnMut(ChangeEvent) + Send>;

#[derive(Clone)]
struct Observer {
    filter: TopicFilter,
    callback: Arc<Mutex<ChangeCallback>>,
    gate: Arc<CallbackGate>,
}

/// Registered subscriptions, keyed by their channel topic.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    observers: Mutex<BTreeMap<String, Observer>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer under a fresh topic.
    pub fn insert(
        &self,
        filter: TopicFilter,
        callback: ChangeCallback,
    ) -> (String, Arc<CallbackGate>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let topic = format!("realtime:rvois-{}-{}", filter.table, id);
        let gate = Arc::new(CallbackGate::new());
        self.observers.lock().insert(
            topic.clone(),
            Observer {
                filter,
                callback: Arc::new(Mutex::new(callback)),
                gate: Arc::clone(&gate),
            },
        );
        (topic, gate)
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.observers.lock().remove(topic).is_some()
    }

    /// Topics and filters to (re)join, in registration order.
    pub fn snapshot(&self) -> Vec<(String, TopicFilter)> {
        let observers = self.observers.lock();
        let mut entries: Vec<_> = observers
            .iter()
            .map(|(topic, o)| (topic.clone(), o.filter.clone()))
            .collect();
        entries.sort_by_key(|(topic, _)| topic_number(topic));
        entries
    }

    pub fn filter_for(&self, topic: &str) -> Option<TopicFilter> {
        self.observers.lock().get(topic).map(|o| o.filter.clone())
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Deliver an event to the observer on `topic`. Returns whether a
    /// callback ran.
    pub fn dispatch(&self, topic: &str, event: ChangeEvent) -> bool {
        // Clone out so the callback may unsubscribe without deadlocking
        let Some(observer) = self.observers.lock().get(topic).cloned() else {
            tracing::debug!("Change for unknown topic {} dropped", topic);
            return false;
        };
        if !observer.filter.matches(&event) {
            tracing::debug!("Change on {} did not match {}", topic, observer.filter);
            return false;
        }
        observer.gate.run(|| {
            let mut callback = observer.callback.lock();
            (*callback)(event)
        })
    }
}

fn topic_number(topic: &str) -> u64 {
    topic
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}
