//! In-process publish/subscribe bus.
//!
//! Delivery is synchronous: `publish` calls every current subscriber of the
//! topic's routing key, in subscription order, before returning. Nothing is
//! persisted except the last message of topics declared
//! [`TopicKind::Stateful`], which is pushed to each new subscriber.
//!
//! The registry lock is never held while a handler runs, so handlers may
//! publish, subscribe or unsubscribe (themselves included) freely. A message
//! published to a handler's own topic from inside that handler is queued and
//! delivered to it right after the current call returns.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::messages::{BusMessage, Envelope};
use crate::topics::{routing_key, TopicKind};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type BoxedHandler = Box<dyn FnMut(&Envelope) -> HandlerResult + Send>;
type SharedHandler = Arc<Mutex<HandlerCell>>;

struct HandlerCell {
    handler: BoxedHandler,
    /// Sequence number of the newest message this handler has been given.
    last_seq: u64,
}

/// Tokens are unique across every bus in the process.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Subscriptions whose handler is running on this thread, with the
    /// messages published to them in the meantime.
    static RUNNING: RefCell<Vec<(Subscription, VecDeque<(u64, Envelope)>)>> =
        const { RefCell::new(Vec::new()) };
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subscription(u64);

impl Subscription {
    pub fn raw(self) -> u64 {
        self.0
    }
}

struct Slot {
    token: Subscription,
    key: String,
    handler: SharedHandler,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    /// Stateful routing keys and their retained message.
    retained: HashMap<String, Option<(u64, Envelope)>>,
    next_seq: u64,
}

/// Cloneable handle to one bus. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.registry();
        f.debug_struct("EventBus")
            .field("subscribers", &reg.slots.len())
            .field("stateful", &reg.retained.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the routing key of `topic` as stateful.
    pub fn declare_stateful(&self, topic: &str) {
        self.registry()
            .retained
            .entry(routing_key(topic).to_string())
            .or_insert(None);
    }

    pub fn topic_kind(&self, topic: &str) -> TopicKind {
        if self.registry().retained.contains_key(routing_key(topic)) {
            TopicKind::Stateful
        } else {
            TopicKind::Event
        }
    }

    /// Registers `handler` for the routing key of `topic`.
    ///
    /// On a stateful topic with a retained message the handler receives that
    /// message before this call returns.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: FnMut(&Envelope) -> HandlerResult + Send + 'static,
    {
        let (token, handler, retained) = self.register(topic, Box::new(handler));
        self.replay(token, &handler, retained);
        token
    }

    fn register(
        &self,
        topic: &str,
        handler: BoxedHandler,
    ) -> (Subscription, SharedHandler, Option<(u64, Envelope)>) {
        let key = routing_key(topic).to_string();
        let token = Subscription(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        let handler: SharedHandler = Arc::new(Mutex::new(HandlerCell {
            handler,
            last_seq: 0,
        }));

        let retained = {
            let mut reg = self.registry();
            reg.slots.push(Slot {
                token,
                key: key.clone(),
                handler: Arc::clone(&handler),
            });
            reg.retained.get(&key).cloned().flatten()
        };
        debug!(topic = %key, subscription = token.0, "subscribed");
        (token, handler, retained)
    }

    /// Pushes the retained message unless the handler already saw a newer one
    /// from a publish that raced the subscription.
    fn replay(&self, token: Subscription, handler: &SharedHandler, retained: Option<(u64, Envelope)>) {
        let Some((seq, envelope)) = retained else {
            return;
        };
        let cell = handler.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.last_seq >= seq {
            trace!(subscription = token.0, seq, "retained message superseded");
            return;
        }
        drop(cell);
        self.deliver(token, handler, seq, &envelope);
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, token: Subscription) -> bool {
        let mut reg = self.registry();
        let before = reg.slots.len();
        reg.slots.retain(|slot| slot.token != token);
        let removed = reg.slots.len() != before;
        if removed {
            debug!(subscription = token.0, "unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self, token: Subscription) -> bool {
        self.registry().slots.iter().any(|slot| slot.token == token)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let key = routing_key(topic);
        self.registry().slots.iter().filter(|s| s.key == key).count()
    }

    /// Last message published on a stateful topic.
    pub fn retained(&self, topic: &str) -> Option<Envelope> {
        self.registry()
            .retained
            .get(routing_key(topic))
            .cloned()
            .flatten()
            .map(|(_, envelope)| envelope)
    }

    /// Delivers `message` to every current subscriber of `topic`.
    ///
    /// Returns the number of handlers invoked. A subscriber removed while the
    /// publish is under way is skipped if it has not been reached yet.
    pub fn publish(&self, topic: &str, message: BusMessage) -> usize {
        let key = routing_key(topic);
        let envelope = Envelope {
            topic: topic.to_string(),
            message,
        };

        let (seq, targets): (u64, Vec<(Subscription, SharedHandler)>) = {
            let mut reg = self.registry();
            reg.next_seq += 1;
            let seq = reg.next_seq;
            if let Some(slot) = reg.retained.get_mut(key) {
                *slot = Some((seq, envelope.clone()));
            }
            let targets = reg
                .slots
                .iter()
                .filter(|slot| slot.key == key)
                .map(|slot| (slot.token, Arc::clone(&slot.handler)))
                .collect();
            (seq, targets)
        };

        let mut reached = 0;
        for (token, handler) in targets {
            if !self.is_subscribed(token) {
                continue;
            }
            if self.deliver(token, &handler, seq, &envelope) {
                reached += 1;
            }
        }
        trace!(topic = %envelope.topic, reached, "published");
        reached
    }

    /// Runs one handler, then anything published to it while it ran.
    ///
    /// A delivery to a handler that is already running on this thread is
    /// queued for that outer call instead.
    fn deliver(&self, token: Subscription, handler: &SharedHandler, seq: u64, envelope: &Envelope) -> bool {
        let queued = RUNNING.with(|running| {
            let mut running = running.borrow_mut();
            match running.iter_mut().find(|(t, _)| *t == token) {
                Some((_, pending)) => {
                    pending.push_back((seq, envelope.clone()));
                    true
                }
                None => false,
            }
        });
        if queued {
            trace!(topic = %envelope.topic, subscription = token.0, "queued re-entrant delivery");
            return true;
        }

        let mut cell = handler.lock().unwrap_or_else(PoisonError::into_inner);
        RUNNING.with(|running| running.borrow_mut().push((token, VecDeque::new())));
        invoke(&mut cell, token, seq, envelope);
        loop {
            let next = RUNNING.with(|running| {
                running
                    .borrow_mut()
                    .iter_mut()
                    .find(|(t, _)| *t == token)
                    .and_then(|(_, pending)| pending.pop_front())
            });
            let Some((seq, envelope)) = next else {
                break;
            };
            if self.is_subscribed(token) {
                invoke(&mut cell, token, seq, &envelope);
            }
        }
        RUNNING.with(|running| running.borrow_mut().retain(|(t, _)| *t != token));
        true
    }
}

/// Calls the handler, isolating its errors and panics.
fn invoke(cell: &mut HandlerCell, token: Subscription, seq: u64, envelope: &Envelope) {
    cell.last_seq = cell.last_seq.max(seq);
    let outcome = catch_unwind(AssertUnwindSafe(|| (cell.handler)(envelope)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(
            topic = %envelope.topic,
            subscription = token.0,
            error = %err,
            "subscriber failed"
        ),
        Err(panic) => warn!(
            topic = %envelope.topic,
            subscription = token.0,
            panic = panic_message(panic.as_ref()),
            "subscriber panicked"
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
