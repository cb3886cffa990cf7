use std::collections::HashMap;
use std::sync::Arc;

use crate::algorithm::{self, Outcome};
use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};
use crate::key::{storage_key, KeyContext};
use crate::policy::{Algorithm, Policy};
use crate::reliability::{BreakerCheck, BreakerConfig, CircuitBreakerRegistry, HealthRegistry};

/// What a caller does with the result of a check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_secs: u64,
    pub retry_after_secs: Option<u64>,
    pub reason: DecisionReason,
    /// Token-bucket capacity and refill rate, populated only when the
    /// policy's algorithm is `TokenBucket`.
    pub bucket_capacity: Option<u64>,
    pub bucket_refill_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Ok,
    LimitExceeded,
    Skipped,
    FailOpen,
    FailClosed,
}

/// The user-facing entry point: wraps one backend, one circuit breaker,
/// and a key prefix, and exposes both an async `check` and a blocking
/// wrapper for call sites with no ambient runtime.
pub struct Limiter {
    key_prefix: String,
    backend: Arc<Backend>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_config: BreakerConfig,
    health: Arc<HealthRegistry>,
    clock: Arc<dyn Clock>,
    blocking_runtime: Option<tokio::runtime::Runtime>,
}

impl Limiter {
    pub fn new(key_prefix: impl Into<String>, backend: Arc<Backend>) -> Self {
        Self::with_clock(key_prefix, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(key_prefix: impl Into<String>, backend: Arc<Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            backend,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            breaker_config: BreakerConfig::default(),
            health: Arc::new(HealthRegistry::new()),
            clock,
            blocking_runtime: None,
        }
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Build a small dedicated runtime so `check_blocking` can be called
    /// from non-async call sites without requiring the caller to already
    /// be inside a Tokio runtime.
    pub fn with_blocking_support(mut self) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RateLimitError::BadConfig(format!("failed to start blocking runtime: {e}")))?;
        self.blocking_runtime = Some(rt);
        Ok(self)
    }

    /// Evaluate `policy` for `ctx`, consulting the circuit breaker first and
    /// applying the policy's fail-open/fail-closed choice if the backend
    /// errors.
    pub async fn check(&self, policy: &Policy, ctx: &KeyContext) -> Decision {
        if policy.should_skip(ctx) {
            return Decision {
                allowed: true,
                limit: policy.limit,
                remaining: policy.limit,
                reset_at_secs: self.clock.now_secs(),
                retry_after_secs: None,
                reason: DecisionReason::Skipped,
                bucket_capacity: None,
                bucket_refill_rate: None,
            };
        }

        let breaker_name = self.backend.name().to_string();
        let check = self.breakers.check(&breaker_name, self.breaker_config);
        if check == BreakerCheck::Rejected {
            return self.fallback_decision(policy, "circuit open");
        }

        let raw_key = match policy.key.canonicalize(ctx) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "key canonicalization failed");
                return self.fallback_decision(policy, "bad key configuration");
            }
        };
        let storage_key = storage_key(&self.key_prefix, policy.algorithm.tag(), &raw_key);
        let now_ms = self.clock.now_ms();

        match algorithm::evaluate(&self.backend, policy, &storage_key, now_ms).await {
            Ok(outcome) => {
                self.breakers.record_success(&breaker_name, self.breaker_config);
                self.decision_from_outcome(policy, outcome, now_ms)
            }
            Err(e) => {
                let weight = e.circuit_weight();
                if weight > 0 {
                    self.breakers
                        .record_failure(&breaker_name, self.breaker_config, weight);
                }
                tracing::warn!(backend = %breaker_name, error = %e, "rate limit check failed");
                self.fallback_decision(policy, "backend error")
            }
        }
    }

    /// Synchronous wrapper over `check`. Requires `with_blocking_support()`
    /// to have been called at construction time.
    pub fn check_blocking(&self, policy: &Policy, ctx: &KeyContext) -> Decision {
        match &self.blocking_runtime {
            Some(rt) => rt.block_on(self.check(policy, ctx)),
            None => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    tokio::task::block_in_place(|| handle.block_on(self.check(policy, ctx)))
                } else {
                    tracing::error!("check_blocking called without a runtime; failing open");
                    Decision {
                        allowed: true,
                        limit: policy.limit,
                        remaining: policy.limit,
                        reset_at_secs: self.clock.now_secs(),
                        retry_after_secs: None,
                        reason: DecisionReason::FailOpen,
                        bucket_capacity: None,
                        bucket_refill_rate: None,
                    }
                }
            }
        }
    }

    pub async fn reset(&self, policy: &Policy, ctx: &KeyContext) -> Result<()> {
        let raw_key = policy.key.canonicalize(ctx)?;
        let storage_key = storage_key(&self.key_prefix, policy.algorithm.tag(), &raw_key);
        self.backend.reset(&storage_key).await
    }

    /// Run one probe round against the wrapped backend and return the
    /// resulting health snapshots. A `Multi` backend is fanned out over its
    /// children so each gets its own snapshot instead of being collapsed
    /// into one opaque "multi" entry.
    pub async fn health(&self) -> HashMap<String, crate::reliability::BackendHealth> {
        match self.backend.as_ref() {
            Backend::Multi(multi) => {
                let children = multi.children();
                let concurrency = children.len().max(1);
                let targets: Vec<(String, _)> = children
                    .into_iter()
                    .map(|(name, backend)| {
                        (name, move || async move { backend.probe().await.is_ok() })
                    })
                    .collect();
                crate::reliability::health::run_probe_round(&self.health, targets, concurrency, |_, _| {}).await;
            }
            _ => {
                let name = self.backend.name().to_string();
                let backend = self.backend.clone();
                let targets = vec![(name, move || async move { backend.probe().await.is_ok() })];
                crate::reliability::health::run_probe_round(&self.health, targets, 1, |_, _| {}).await;
            }
        }
        self.health.all()
    }

    fn decision_from_outcome(&self, policy: &Policy, outcome: Outcome, now_ms: u64) -> Decision {
        let retry_after_secs = if outcome.admitted {
            None
        } else {
            Some(outcome.reset_at_secs.saturating_sub(now_ms / 1000).max(1))
        };
        let (bucket_capacity, bucket_refill_rate) = if policy.algorithm == Algorithm::TokenBucket {
            (Some(policy.effective_bucket_size()), policy.refill_rate)
        } else {
            (None, None)
        };
        Decision {
            allowed: outcome.admitted,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at_secs: outcome.reset_at_secs,
            retry_after_secs,
            reason: if outcome.admitted {
                DecisionReason::Ok
            } else {
                DecisionReason::LimitExceeded
            },
            bucket_capacity,
            bucket_refill_rate,
        }
        .tap_exceed(policy)
    }

    fn fallback_decision(&self, policy: &Policy, reason: &str) -> Decision {
        tracing::debug!(fail_open = policy.fail_open, reason, "applying fallback policy");
        let (bucket_capacity, bucket_refill_rate) = if policy.algorithm == Algorithm::TokenBucket {
            (Some(policy.effective_bucket_size()), policy.refill_rate)
        } else {
            (None, None)
        };
        Decision {
            allowed: policy.fail_open,
            limit: policy.limit,
            remaining: if policy.fail_open { policy.limit } else { 0 },
            reset_at_secs: self.clock.now_secs(),
            retry_after_secs: if policy.fail_open { None } else { Some(1) },
            reason: if policy.fail_open {
                DecisionReason::FailOpen
            } else {
                DecisionReason::FailClosed
            },
            bucket_capacity,
            bucket_refill_rate,
        }
    }
}

trait TapExceed {
    fn tap_exceed(self, policy: &Policy) -> Self;
}

impl TapExceed for Decision {
    /// `block_on_exceed` only changes caller-side behavior (it's advisory
    /// to the caller, not enforced by the library); here it just gets
    /// logged so the intent is visible in traces.
    fn tap_exceed(self, policy: &Policy) -> Self {
        if !self.allowed && policy.block_on_exceed {
            tracing::trace!("block_on_exceed set; caller is expected to stall the request");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::clock::FixedClock;
    use crate::policy::{Algorithm, PolicyBuilder};

    fn limiter_with_clock(clock: FixedClock) -> Limiter {
        let backend = Arc::new(Backend::Memory(MemoryBackend::new("mem")));
        Limiter::with_clock("rl", backend, Arc::new(clock))
    }

    #[tokio::test]
    async fn allows_within_limit() {
        let limiter = limiter_with_clock(FixedClock::new(0));
        let policy = PolicyBuilder::new(2, 60, Algorithm::Fixed).build().unwrap();
        let ctx = KeyContext::default();
        assert!(limiter.check(&policy, &ctx).await.allowed);
        assert!(limiter.check(&policy, &ctx).await.allowed);
        assert!(!limiter.check(&policy, &ctx).await.allowed);
    }

    #[tokio::test]
    async fn skip_predicate_always_admits() {
        let limiter = limiter_with_clock(FixedClock::new(0));
        let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed)
            .skip_if(|ctx| ctx.path.as_deref() == Some("/health"))
            .build()
            .unwrap();
        let ctx = KeyContext {
            path: Some("/health".into()),
            ..Default::default()
        };
        for _ in 0..5 {
            let d = limiter.check(&policy, &ctx).await;
            assert!(d.allowed);
            assert_eq!(d.reason, DecisionReason::Skipped);
        }
    }

    #[tokio::test]
    async fn exceeding_limit_sets_retry_after() {
        let limiter = limiter_with_clock(FixedClock::new(0));
        let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed).build().unwrap();
        let ctx = KeyContext::default();
        limiter.check(&policy, &ctx).await;
        let denied = limiter.check(&policy, &ctx).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn reset_clears_counter() {
        let limiter = limiter_with_clock(FixedClock::new(0));
        let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed).build().unwrap();
        let ctx = KeyContext::default();
        limiter.check(&policy, &ctx).await;
        limiter.reset(&policy, &ctx).await.unwrap();
        assert!(limiter.check(&policy, &ctx).await.allowed);
    }

    #[test]
    fn check_blocking_works_without_ambient_runtime() {
        let backend = Arc::new(Backend::Memory(MemoryBackend::new("mem")));
        let limiter = Limiter::with_clock("rl", backend, Arc::new(FixedClock::new(0)))
            .with_blocking_support()
            .unwrap();
        let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed).build().unwrap();
        let ctx = KeyContext::default();
        assert!(limiter.check_blocking(&policy, &ctx).allowed);
        assert!(!limiter.check_blocking(&policy, &ctx).allowed);
    }
}
