//! Shows wiring a `Limiter` in front of an async request handler, with a
//! per-route policy and a token-bucket burst allowance.

use std::sync::Arc;

use ratewall_core::{Algorithm, Backend, KeyContext, Limiter, MemoryBackend, PolicyBuilder};

async fn handle_request(limiter: &Limiter, client_ip: &str) -> &'static str {
    let policy = PolicyBuilder::new(10, 1, Algorithm::TokenBucket)
        .refill_rate(10.0)
        .bucket_size(20)
        .fail_open(true)
        .build()
        .expect("valid policy");

    let ctx = KeyContext {
        client_address: Some(client_ip.to_string()),
        ..Default::default()
    };

    let decision = limiter.check(&policy, &ctx).await;
    if decision.allowed {
        "200 OK"
    } else {
        "429 Too Many Requests"
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let backend = Arc::new(Backend::Memory(MemoryBackend::new("edge")));
    let limiter = Limiter::new("http", backend);

    for i in 0..25 {
        let response = handle_request(&limiter, "203.0.113.7").await;
        println!("request {i}: {response}");
    }

    let health = limiter.health().await;
    println!("backend health: {health:?}");
}
