//! Thread-safe handle around one engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use meshview_env::{Pacer, RandomSource, Scheduler, SeededRandom, VirtualScheduler};
use tracing::trace;

use crate::bus::EventBus;
use crate::engine::{Engine, Timer};
use crate::error::CoreResult;

/// Shares an [`Engine`] between threads or tasks behind one mutex.
///
/// Bus handlers run while the engine lock is held, so a handler must not
/// lock the same `SharedEngine` again.
pub struct SharedEngine<R = SeededRandom, S = VirtualScheduler<Timer>> {
    inner: Arc<Mutex<Engine<R, S>>>,
}

impl<R, S> Clone for SharedEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RandomSource, S: Scheduler<Timer>> SharedEngine<R, S> {
    pub fn new(engine: Engine<R, S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Engine<R, S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with<T>(&self, f: impl FnOnce(&mut Engine<R, S>) -> T) -> T {
        f(&mut *self.lock())
    }

    /// A clone of the engine's bus, usable without holding the lock.
    pub fn bus(&self) -> EventBus {
        self.lock().bus().clone()
    }

    /// Dispatches timers as the pacer reaches their due times, up to
    /// `horizon` of engine time. Returns the number of timers dispatched.
    ///
    /// The lock is released while waiting, so other tasks can call engine
    /// operations in between.
    pub async fn run_paced<P: Pacer + ?Sized>(&self, pacer: &P, horizon: Duration) -> CoreResult<usize> {
        let mut dispatched = 0;
        loop {
            let due = {
                let engine = self.lock();
                match engine.next_due() {
                    Some(due) if due <= horizon => due,
                    _ => break,
                }
            };
            pacer.wait_until(due).await;
            let mut engine = self.lock();
            let to = due.max(engine.now());
            dispatched += engine.advance_to(to)?;
            trace!(at = ?to, dispatched, "paced step");
        }
        pacer.wait_until(horizon).await;
        let mut engine = self.lock();
        let to = horizon.max(engine.now());
        engine.advance_to(to)?;
        Ok(dispatched)
    }
}
