//! Real-time pacer backed by Tokio.

use crate::Pacer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Live pacer: waiting for a due time sleeps on the Tokio timer.
///
/// This is the implementation used when the core backs a running
/// dashboard. One logical millisecond is one wall-clock millisecond.
pub struct TokioPacer {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioPacer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped pacer for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioPacer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pacer for TokioPacer {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    async fn wait_until(&self, at: Duration) {
        let now = self.elapsed();
        if at > now {
            tokio::time::sleep(at - now).await;
        }
    }

    fn is_realtime(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_pacer_waits() {
        let pacer = TokioPacer::new();
        let target = pacer.elapsed() + Duration::from_millis(10);
        pacer.wait_until(target).await;
        assert!(pacer.elapsed() >= target);
        assert!(pacer.is_realtime());
    }

    #[tokio::test]
    async fn test_tokio_pacer_past_deadline_returns() {
        let pacer = TokioPacer::new();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Already past: must not block.
        pacer.wait_until(Duration::from_millis(1)).await;
        assert!(pacer.elapsed() >= Duration::from_millis(5));
    }
}
