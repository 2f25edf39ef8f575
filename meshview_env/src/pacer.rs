//! Pacing between the virtual schedule and the outside world.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Decides how long it takes to reach a scheduled instant.
///
/// The engine itself only knows logical time. A driver loop asks the pacer
/// to wait until the next due time before dispatching it.
///
/// # Implementations
///
/// - **Simulation**: [`VirtualPacer`] - returns immediately, time is free
/// - **Live**: [`TokioPacer`](crate::TokioPacer) - sleeps on `tokio::time`
#[async_trait]
pub trait Pacer: Send + Sync + 'static {
    /// Time elapsed since the pacer was created.
    fn elapsed(&self) -> Duration;

    /// Suspends until `at` (measured from pacer creation) has been reached.
    async fn wait_until(&self, at: Duration);

    /// Whether waiting costs wall-clock time.
    fn is_realtime(&self) -> bool;
}

/// Pacer for simulation: every wait completes instantly and only moves the
/// recorded clock forward.
#[derive(Debug, Clone, Default)]
pub struct VirtualPacer {
    reached: Arc<Mutex<Duration>>,
}

impl VirtualPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped pacer for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Pacer for VirtualPacer {
    fn elapsed(&self) -> Duration {
        *self.reached.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn wait_until(&self, at: Duration) {
        let mut reached = self.reached.lock().unwrap_or_else(|p| p.into_inner());
        if at > *reached {
            *reached = at;
        }
    }

    fn is_realtime(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_virtual_pacer_never_rewinds() {
        let pacer = VirtualPacer::new();
        pacer.wait_until(Duration::from_secs(5)).await;
        assert_eq!(pacer.elapsed(), Duration::from_secs(5));

        pacer.wait_until(Duration::from_secs(2)).await;
        assert_eq!(pacer.elapsed(), Duration::from_secs(5));
        assert!(!pacer.is_realtime());
    }

    #[tokio::test]
    async fn test_virtual_pacer_clone_shares_clock() {
        let a = VirtualPacer::new();
        let b = a.clone();
        a.wait_until(Duration::from_millis(700)).await;
        assert_eq!(b.elapsed(), Duration::from_millis(700));
    }
}
