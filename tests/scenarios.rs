//! End-to-end scenario and property tests exercising the public `Limiter`
//! facade the way an embedding application would.

use std::sync::Arc;

use proptest::prelude::*;
use ratewall_core::{
    Algorithm, Backend, BreakerConfig, FixedClock, KeyContext, Limiter, MemoryBackend, MultiBackend, MultiStrategy,
    PolicyBuilder,
};

fn limiter_at(start_ms: u64) -> (Limiter, FixedClock) {
    let clock = FixedClock::new(start_ms);
    let backend = Arc::new(Backend::Memory(MemoryBackend::new("scenario")));
    (Limiter::with_clock("scn", backend, Arc::new(clock.clone())), clock)
}

/// S1: a burst exactly at the limit is fully admitted, the next call is not.
#[tokio::test]
async fn scenario_burst_at_limit_then_one_more() {
    let (limiter, _clock) = limiter_at(0);
    let policy = PolicyBuilder::new(5, 60, Algorithm::Fixed).build().unwrap();
    let ctx = KeyContext::default();

    for _ in 0..5 {
        assert!(limiter.check(&policy, &ctx).await.allowed);
    }
    let sixth = limiter.check(&policy, &ctx).await;
    assert!(!sixth.allowed);
    assert!(sixth.retry_after_secs.is_some());
}

/// S2: a fixed window fully resets once its period elapses.
#[tokio::test]
async fn scenario_fixed_window_resets_after_period() {
    let (limiter, clock) = limiter_at(0);
    let policy = PolicyBuilder::new(2, 10, Algorithm::Fixed).build().unwrap();
    let ctx = KeyContext::default();

    assert!(limiter.check(&policy, &ctx).await.allowed);
    assert!(limiter.check(&policy, &ctx).await.allowed);
    assert!(!limiter.check(&policy, &ctx).await.allowed);

    clock.advance_secs(11);
    assert!(limiter.check(&policy, &ctx).await.allowed);
}

/// S3: distinct keys never share a counter.
#[tokio::test]
async fn scenario_distinct_keys_are_independent() {
    let (limiter, _clock) = limiter_at(0);
    let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed)
        .key(ratewall_core::KeySpec::selectors(["client-address"]))
        .build()
        .unwrap();

    let a = KeyContext {
        client_address: Some("1.1.1.1".into()),
        ..Default::default()
    };
    let b = KeyContext {
        client_address: Some("2.2.2.2".into()),
        ..Default::default()
    };

    assert!(limiter.check(&policy, &a).await.allowed);
    assert!(!limiter.check(&policy, &a).await.allowed);
    assert!(limiter.check(&policy, &b).await.allowed);
}

/// S4: a fail-open policy admits once the backend is closed.
#[tokio::test]
async fn scenario_fail_open_admits_on_backend_closure() {
    let mut mem = MemoryBackend::new("closing");
    mem.shutdown().await;
    let backend = Arc::new(Backend::Memory(mem));
    let limiter = Limiter::with_clock("scn", backend, Arc::new(FixedClock::new(0)));

    let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed)
        .fail_open(true)
        .build()
        .unwrap();
    let decision = limiter.check(&policy, &KeyContext::default()).await;
    assert!(decision.allowed);
}

/// S5: a fail-closed policy (the default) denies once the backend is closed.
#[tokio::test]
async fn scenario_fail_closed_denies_on_backend_closure() {
    let mut mem = MemoryBackend::new("closing");
    mem.shutdown().await;
    let backend = Arc::new(Backend::Memory(mem));
    let limiter = Limiter::with_clock("scn", backend, Arc::new(FixedClock::new(0)));

    let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed).build().unwrap();
    let decision = limiter.check(&policy, &KeyContext::default()).await;
    assert!(!decision.allowed);
}

/// S6: a token bucket never admits more than its configured capacity in a
/// burst, even when calls arrive back-to-back with no elapsed time.
#[tokio::test]
async fn scenario_token_bucket_caps_burst_at_capacity() {
    let (limiter, _clock) = limiter_at(0);
    let policy = PolicyBuilder::new(3, 60, Algorithm::TokenBucket)
        .refill_rate(1.0)
        .build()
        .unwrap();
    let ctx = KeyContext::default();

    let mut admitted = 0;
    for _ in 0..10 {
        if limiter.check(&policy, &ctx).await.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);
}

/// S7: a sliding window admits up to the limit, denies a call over it, and
/// admits again once the earlier hits have slid out of the window.
#[tokio::test]
async fn scenario_sliding_window_admits_after_hits_slide_out() {
    let (limiter, clock) = limiter_at(0);
    let policy = PolicyBuilder::new(2, 10, Algorithm::Sliding).build().unwrap();
    let ctx = KeyContext::default();

    assert!(limiter.check(&policy, &ctx).await.allowed);
    assert!(limiter.check(&policy, &ctx).await.allowed);
    assert!(!limiter.check(&policy, &ctx).await.allowed);

    clock.advance_secs(11);
    assert!(limiter.check(&policy, &ctx).await.allowed);
}

/// S8: a `Multi` backend fails over to its secondary child when the
/// primary is closed, and the caller still gets served.
#[tokio::test]
async fn scenario_multi_backend_fails_over_to_secondary() {
    let mut primary = MemoryBackend::new("primary");
    primary.shutdown().await;
    let primary: Arc<Backend> = Arc::new(Backend::Memory(primary));
    let secondary: Arc<Backend> = Arc::new(Backend::Memory(MemoryBackend::new("secondary")));

    let multi = MultiBackend::new(
        vec![("primary".into(), primary), ("secondary".into(), secondary)],
        MultiStrategy::FirstHealthy,
        BreakerConfig::default(),
    );
    let backend = Arc::new(Backend::Multi(multi));
    let limiter = Limiter::with_clock("scn", backend, Arc::new(FixedClock::new(0)));

    let policy = PolicyBuilder::new(1, 60, Algorithm::Fixed).build().unwrap();
    let ctx = KeyContext::default();
    assert!(limiter.check(&policy, &ctx).await.allowed);
    assert!(!limiter.check(&policy, &ctx).await.allowed);
}

proptest! {
    /// Remaining is never reported as exceeding the configured limit.
    #[test]
    fn remaining_never_exceeds_limit(limit in 1u64..50, calls in 0u32..80) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (limiter, _clock) = limiter_at(0);
            let policy = PolicyBuilder::new(limit, 60, Algorithm::Fixed).build().unwrap();
            let ctx = KeyContext::default();
            for _ in 0..calls {
                let d = limiter.check(&policy, &ctx).await;
                prop_assert!(d.remaining <= limit);
            }
            Ok(())
        })?;
    }

    /// Once a fixed window denies a call, every subsequent call in the same
    /// window is also denied (monotonicity of the quota within a window).
    #[test]
    fn fixed_window_denial_is_sticky_within_window(limit in 1u64..10, extra_calls in 1u32..20) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (limiter, _clock) = limiter_at(0);
            let policy = PolicyBuilder::new(limit, 3600, Algorithm::Fixed).build().unwrap();
            let ctx = KeyContext::default();

            for _ in 0..limit {
                prop_assert!(limiter.check(&policy, &ctx).await.allowed);
            }
            for _ in 0..extra_calls {
                prop_assert!(!limiter.check(&policy, &ctx).await.allowed);
            }
            Ok(())
        })?;
    }
}
