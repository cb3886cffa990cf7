pub mod memory;
pub mod multi;
pub mod remote;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::policy::Algorithm;

/// Result of `incr_fixed`: the post-increment count and the current
/// window's expiry, as epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedOutcome {
    pub count: u64,
    pub reset_at_secs: u64,
}

/// Result of `check_sliding`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingOutcome {
    pub count_after: u64,
    pub reset_at_secs: u64,
    pub admitted: bool,
}

/// Result of `check_bucket`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub tokens_after: f64,
    pub reset_at_secs: u64,
    pub admitted: bool,
}

/// Result of a read-only `Peek`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeekOutcome {
    pub value: f64,
    pub reset_at_secs: u64,
}

/// The backend capability set: every operation every storage driver must
/// implement atomically per key.
///
/// Modeled as a tagged enum with static dispatch rather than a `dyn Trait` —
/// `Multi` holding `Vec<Arc<Backend>>` needs no object safety or
/// `async_trait` boxing, and the match arms dispatch per-variant the same
/// way a request-phase enum would.
pub enum Backend {
    Memory(memory::MemoryBackend),
    Remote(remote::RemoteBackend),
    Multi(multi::MultiBackend),
}

impl Backend {
    pub fn name(&self) -> &str {
        match self {
            Backend::Memory(b) => b.name(),
            Backend::Remote(b) => b.name(),
            Backend::Multi(_) => "multi",
        }
    }

    pub fn incr_fixed<'a>(
        &'a self,
        key: &'a str,
        period_secs: u64,
        align_to_clock: bool,
        now_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<FixedOutcome>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Backend::Memory(b) => b.incr_fixed(key, period_secs, align_to_clock, now_ms).await,
                Backend::Remote(b) => b.incr_fixed(key, period_secs, align_to_clock, now_ms).await,
                Backend::Multi(b) => b.incr_fixed(key, period_secs, align_to_clock, now_ms).await,
            }
        })
    }

    pub fn check_sliding<'a>(
        &'a self,
        key: &'a str,
        period_secs: u64,
        limit: u64,
        now_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<SlidingOutcome>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Backend::Memory(b) => b.check_sliding(key, period_secs, limit, now_ms).await,
                Backend::Remote(b) => b.check_sliding(key, period_secs, limit, now_ms).await,
                Backend::Multi(b) => b.check_sliding(key, period_secs, limit, now_ms).await,
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn check_bucket<'a>(
        &'a self,
        key: &'a str,
        capacity: u64,
        refill_rate: f64,
        now_ms: u64,
        cost: u64,
        ttl_hint_secs: u64,
    ) -> Pin<Box<dyn Future<Output = Result<BucketOutcome>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Backend::Memory(b) => {
                    b.check_bucket(key, capacity, refill_rate, now_ms, cost, ttl_hint_secs)
                        .await
                }
                Backend::Remote(b) => {
                    b.check_bucket(key, capacity, refill_rate, now_ms, cost, ttl_hint_secs)
                        .await
                }
                Backend::Multi(b) => {
                    b.check_bucket(key, capacity, refill_rate, now_ms, cost, ttl_hint_secs)
                        .await
                }
            }
        })
    }

    pub fn peek<'a>(
        &'a self,
        key: &'a str,
        algo: Algorithm,
        now_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PeekOutcome>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Backend::Memory(b) => b.peek(key, algo, now_ms).await,
                Backend::Remote(b) => b.peek(key, algo, now_ms).await,
                Backend::Multi(b) => b.peek(key, algo, now_ms).await,
            }
        })
    }

    pub fn reset<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Backend::Memory(b) => b.reset(key).await,
                Backend::Remote(b) => b.reset(key).await,
                Backend::Multi(b) => b.reset(key).await,
            }
        })
    }

    pub fn probe<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Backend::Memory(b) => b.probe().await,
                Backend::Remote(b) => b.probe().await,
                Backend::Multi(b) => b.probe().await,
            }
        })
    }
}

pub fn arc_memory(backend: memory::MemoryBackend) -> Arc<Backend> {
    Arc::new(Backend::Memory(backend))
}

pub fn arc_remote(backend: remote::RemoteBackend) -> Arc<Backend> {
    Arc::new(Backend::Remote(backend))
}

pub fn arc_multi(backend: multi::MultiBackend) -> Arc<Backend> {
    Arc::new(Backend::Multi(backend))
}
