use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Backend, BucketOutcome, FixedOutcome, PeekOutcome, SlidingOutcome};
use crate::error::{RateLimitError, Result};
use crate::policy::Algorithm;
use crate::reliability::{BreakerCheck, BreakerConfig, CircuitBreakerRegistry};

/// How a `MultiBackend` picks which child to try first on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiStrategy {
    FirstHealthy,
    RoundRobin,
}

struct Child {
    name: String,
    backend: Arc<Backend>,
}

/// Composite backend that fans a call out to an ordered list of children,
/// skipping any whose circuit is open and falling through on failure.
/// Each child gets its own breaker in a shared registry, the
/// same per-backend isolation the reliability layer gives standalone
/// backends sitting behind the facade directly.
pub struct MultiBackend {
    children: Vec<Child>,
    strategy: MultiStrategy,
    breaker_config: BreakerConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    round_robin_cursor: AtomicUsize,
}

impl MultiBackend {
    pub fn new(
        children: Vec<(String, Arc<Backend>)>,
        strategy: MultiStrategy,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            children: children
                .into_iter()
                .map(|(name, backend)| Child { name, backend })
                .collect(),
            strategy,
            breaker_config,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Ordering to attempt children in for this call: identity order for
    /// `FirstHealthy`, rotated by an atomic cursor for `RoundRobin`.
    fn attempt_order(&self) -> Vec<usize> {
        let n = self.children.len();
        match self.strategy {
            MultiStrategy::FirstHealthy => (0..n).collect(),
            MultiStrategy::RoundRobin => {
                let start = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % n.max(1);
                (0..n).map(|i| (start + i) % n).collect()
            }
        }
    }

    async fn try_each<'a, T, F>(&'a self, op: F) -> Result<T>
    where
        F: Fn(&'a Arc<Backend>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>,
    {
        let mut last_err: Option<RateLimitError> = None;
        for idx in self.attempt_order() {
            let child = &self.children[idx];
            match self.breakers.check(&child.name, self.breaker_config) {
                BreakerCheck::Rejected => continue,
                BreakerCheck::Allowed | BreakerCheck::Probe => {}
            }

            match op(&child.backend).await {
                Ok(v) => {
                    self.breakers.record_success(&child.name, self.breaker_config);
                    return Ok(v);
                }
                Err(e) => {
                    let weight = e.circuit_weight();
                    if weight > 0 {
                        self.breakers
                            .record_failure(&child.name, self.breaker_config, weight);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RateLimitError::BackendUnavailable))
    }

    pub async fn incr_fixed(
        &self,
        key: &str,
        period_secs: u64,
        align_to_clock: bool,
        now_ms: u64,
    ) -> Result<FixedOutcome> {
        self.try_each(|b: &Arc<Backend>| b.incr_fixed(key, period_secs, align_to_clock, now_ms))
            .await
    }

    pub async fn check_sliding(
        &self,
        key: &str,
        period_secs: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<SlidingOutcome> {
        self.try_each(|b: &Arc<Backend>| b.check_sliding(key, period_secs, limit, now_ms))
            .await
    }

    pub async fn check_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: f64,
        now_ms: u64,
        cost: u64,
        ttl_hint_secs: u64,
    ) -> Result<BucketOutcome> {
        self.try_each(|b: &Arc<Backend>| b.check_bucket(key, capacity, refill_rate, now_ms, cost, ttl_hint_secs))
            .await
    }

    pub async fn peek(&self, key: &str, algo: Algorithm, now_ms: u64) -> Result<PeekOutcome> {
        self.try_each(|b: &Arc<Backend>| b.peek(key, algo, now_ms)).await
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        self.try_each(|b: &Arc<Backend>| b.reset(key)).await
    }

    pub async fn probe(&self) -> Result<()> {
        self.try_each(|b: &Arc<Backend>| b.probe()).await
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.iter().map(|c| c.name.clone()).collect()
    }

    /// Each child's name paired with its backend handle, for callers that
    /// need to probe children individually rather than through `try_each`'s
    /// first-success fallthrough (e.g. `Limiter::health`'s fan-out).
    pub fn children(&self) -> Vec<(String, Arc<Backend>)> {
        self.child_names()
            .into_iter()
            .zip(self.children.iter().map(|c| c.backend.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn memory_child(name: &str) -> (String, Arc<Backend>) {
        (name.to_string(), Arc::new(Backend::Memory(MemoryBackend::new(name))))
    }

    #[tokio::test]
    async fn first_healthy_uses_primary_when_available() {
        let multi = MultiBackend::new(
            vec![memory_child("a"), memory_child("b")],
            MultiStrategy::FirstHealthy,
            BreakerConfig::default(),
        );
        let r = multi.incr_fixed("k", 60, true, 0).await.unwrap();
        assert_eq!(r.count, 1);
    }

    #[tokio::test]
    async fn failure_of_all_children_returns_unavailable() {
        let mut a = MemoryBackend::new("a");
        a.shutdown().await;
        let backend_a: Arc<Backend> = Arc::new(Backend::Memory(a));
        let mut b = MemoryBackend::new("b");
        b.shutdown().await;
        let backend_b: Arc<Backend> = Arc::new(Backend::Memory(b));

        let multi = MultiBackend::new(
            vec![("a".into(), backend_a), ("b".into(), backend_b)],
            MultiStrategy::FirstHealthy,
            BreakerConfig::default(),
        );
        let err = multi.incr_fixed("k", 60, true, 0).await.unwrap_err();
        assert!(err.is_backend_failure());
    }

    #[tokio::test]
    async fn round_robin_rotates_starting_child() {
        let multi = MultiBackend::new(
            vec![memory_child("a"), memory_child("b")],
            MultiStrategy::RoundRobin,
            BreakerConfig::default(),
        );
        let first = multi.attempt_order();
        let second = multi.attempt_order();
        assert_ne!(first[0], second[0]);
    }

    #[tokio::test]
    async fn open_circuit_skips_child() {
        let multi = MultiBackend::new(
            vec![memory_child("a"), memory_child("b")],
            MultiStrategy::FirstHealthy,
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        );
        multi
            .breakers()
            .record_failure("a", BreakerConfig { failure_threshold: 1, ..BreakerConfig::default() }, 2);

        let r = multi.incr_fixed("k", 60, true, 0).await.unwrap();
        assert_eq!(r.count, 1);
    }
}
