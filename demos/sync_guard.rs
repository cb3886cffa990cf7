//! Minimal example of calling the limiter from a plain synchronous call
//! site that has no ambient Tokio runtime of its own.

use std::sync::Arc;

use ratewall_core::{Backend, KeyContext, Limiter, MemoryBackend, Policy, PolicyBuilder};

fn main() {
    tracing_subscriber::fmt::init();

    let backend = Arc::new(Backend::Memory(MemoryBackend::new("local")));
    let limiter = Limiter::new("demo", backend)
        .with_blocking_support()
        .expect("failed to start blocking runtime");

    let policy: Policy = PolicyBuilder::new(5, 60, ratewall_core::Algorithm::Fixed)
        .build()
        .expect("valid policy");

    let ctx = KeyContext {
        client_address: Some("127.0.0.1".into()),
        ..Default::default()
    };

    for attempt in 1..=7 {
        let decision = limiter.check_blocking(&policy, &ctx);
        println!(
            "attempt {attempt}: allowed={} remaining={} reason={:?}",
            decision.allowed, decision.remaining, decision.reason
        );
    }
}
