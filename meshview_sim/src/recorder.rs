//! Bus observer that keeps every message it sees.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meshview_core::topics::{self, routing_key};
use meshview_core::{BusMessage, Envelope, EventBus, Subscription};

/// Every base topic of the bus contract.
pub const ALL_TOPICS: [&str; 5] = [
    topics::MONITORING,
    topics::MONITORING_PACKETS,
    topics::DEPLOYMENT_LOGS,
    topics::EXPERIMENT_PROGRESS,
    topics::EXPERIMENT_SCENARIOS,
];

type Log = Arc<Mutex<BTreeMap<String, Vec<Envelope>>>>;

/// Records envelopes per routing key until dropped.
pub struct TopicRecorder {
    bus: EventBus,
    subscriptions: Vec<Subscription>,
    log: Log,
}

impl TopicRecorder {
    /// Subscribes to `topics`. A stateful topic's retained message is
    /// recorded immediately.
    pub fn attach(bus: &EventBus, topics: &[&str]) -> Self {
        let log: Log = Arc::default();
        let subscriptions = topics
            .iter()
            .map(|topic| {
                let log = Arc::clone(&log);
                bus.subscribe(topic, move |envelope: &Envelope| {
                    lock(&log)
                        .entry(routing_key(&envelope.topic).to_string())
                        .or_default()
                        .push(envelope.clone());
                    Ok(())
                })
            })
            .collect();
        Self {
            bus: bus.clone(),
            subscriptions,
            log,
        }
    }

    /// Records every topic of the contract.
    pub fn attach_all(bus: &EventBus) -> Self {
        Self::attach(bus, &ALL_TOPICS)
    }

    /// Messages seen on the routing key of `topic`.
    pub fn count(&self, topic: &str) -> usize {
        lock(&self.log).get(routing_key(topic)).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        lock(&self.log).values().map(Vec::len).sum()
    }

    /// Copies of the envelopes seen on the routing key of `topic`.
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        lock(&self.log)
            .get(routing_key(topic))
            .cloned()
            .unwrap_or_default()
    }

    /// Messages published on exactly `topic`, query suffix included.
    pub fn on_exact(&self, topic: &str) -> Vec<BusMessage> {
        lock(&self.log)
            .get(routing_key(topic))
            .map(|all| {
                all.iter()
                    .filter(|e| e.topic == topic)
                    .map(|e| e.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }
}

impl Drop for TopicRecorder {
    fn drop(&mut self) {
        for token in self.subscriptions.drain(..) {
            self.bus.unsubscribe(token);
        }
    }
}

fn lock(log: &Log) -> MutexGuard<'_, BTreeMap<String, Vec<Envelope>>> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}
