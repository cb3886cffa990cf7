use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::time::{SystemTime, UNIX_EPOCH};

/// Health state for a single backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Dead,
}

#[derive(Debug, Clone, Copy)]
pub struct BackendHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_probe_at: u64,
    pub last_failure_at: Option<u64>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_probe_at: 0,
            last_failure_at: None,
        }
    }
}

/// How many consecutive probe failures move a backend from `Healthy` to
/// `Degraded`, and from `Degraded` to `Dead`.
const DEGRADED_THRESHOLD: u32 = 1;
const DEAD_THRESHOLD: u32 = 3;

/// Tracks health snapshots for every named backend a `Multi` (or a
/// standalone facade) probes, feeding both the circuit breaker and any
/// caller inspecting `Limiter::health()`.
///
/// Fans probes out with bounded concurrency (`buffer_unordered` over
/// independent probe futures), generalized from "HTTP GET an upstream
/// node" to "call `Backend::probe`".
pub struct HealthRegistry {
    snapshots: DashMap<String, BackendHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            snapshots: DashMap::new(),
        }
    }

    pub fn snapshot(&self, name: &str) -> BackendHealth {
        self.snapshots.get(name).map(|e| *e).unwrap_or_default()
    }

    pub fn all(&self) -> std::collections::HashMap<String, BackendHealth> {
        self.snapshots
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn record_success(&self, name: &str) {
        let mut entry = self.snapshots.entry(name.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.state = HealthState::Healthy;
        entry.last_probe_at = now_secs();
    }

    fn record_failure(&self, name: &str) {
        let mut entry = self.snapshots.entry(name.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_probe_at = now_secs();
        entry.last_failure_at = Some(entry.last_probe_at);
        entry.state = if entry.consecutive_failures >= DEAD_THRESHOLD {
            HealthState::Dead
        } else if entry.consecutive_failures >= DEGRADED_THRESHOLD {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Run one round of probes across `targets` (name, probe future factory),
/// with up to `concurrency` probes in flight at once, updating `registry`
/// and the caller-supplied `on_result` hook (used to also poke the circuit
/// breaker — kept decoupled from `CircuitBreakerRegistry` so this module
/// has no dependency on it).
pub async fn run_probe_round<F, Fut>(
    registry: &HealthRegistry,
    targets: Vec<(String, F)>,
    concurrency: usize,
    on_result: impl Fn(&str, bool) + Send + Sync,
) where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = bool> + Send,
{
    let on_result = &on_result;
    stream::iter(targets)
        .map(|(name, probe)| async move {
            let healthy = probe().await;
            (name, healthy)
        })
        .buffer_unordered(concurrency.max(1))
        .for_each(|(name, healthy)| async move {
            if healthy {
                registry.record_success(&name);
            } else {
                registry.record_failure(&name);
            }
            on_result(&name, healthy);
        })
        .await;
}
