use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-backend granularity — each named backend (a `Memory`/`Remote` child
/// of a `Multi`, or a standalone backend behind the facade) gets its own
/// breaker, so one unhealthy backend can be isolated without punishing the
/// others.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<Breaker>>,
}

struct Breaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    failures_in_window: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: std::sync::Mutex<Option<Instant>>,
    window_started_at: std::sync::Mutex<Instant>,
    config: BreakerConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    /// Sliding window over which failures are counted in `Closed` state.
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the circuit before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Closed — proceed normally.
    Allowed,
    /// Half-open — this call is the probe.
    Probe,
    /// Open — reject without touching the backend.
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn check(&self, name: &str, config: BreakerConfig) -> BreakerCheck {
        self.get_or_create(name, config).check()
    }

    /// Record success with a given weight (weight is ignored for success —
    /// only failures are weighted — kept for call-site symmetry).
    pub fn record_success(&self, name: &str, config: BreakerConfig) {
        self.get_or_create(name, config).record_success();
    }

    /// Record a failure with the given weight (1 for transient, 2 for
    /// a fatal backend error).
    pub fn record_failure(&self, name: &str, config: BreakerConfig, weight: u32) {
        self.get_or_create(name, config).record_failure(weight);
    }

    pub fn is_open(&self, name: &str, config: BreakerConfig) -> bool {
        let breaker = self.get_or_create(name, config);
        let state = breaker.state.load(Ordering::Acquire);
        if state != STATE_OPEN {
            return false;
        }
        let opened_at = breaker.opened_at.lock().unwrap();
        match *opened_at {
            Some(at) => at.elapsed() < config.open_duration,
            None => false,
        }
    }

    fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<Breaker> {
        if let Some(entry) = self.breakers.get(name) {
            return entry.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Breaker {
                    state: AtomicU8::new(STATE_CLOSED),
                    failures_in_window: AtomicU32::new(0),
                    half_open_successes: AtomicU32::new(0),
                    opened_at: std::sync::Mutex::new(None),
                    window_started_at: std::sync::Mutex::new(Instant::now()),
                    config,
                })
            })
            .clone()
    }

    pub fn remove(&self, name: &str) {
        self.breakers.remove(name);
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Breaker {
    fn check(&self) -> BreakerCheck {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                self.roll_failure_window();
                BreakerCheck::Allowed
            }
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= self.config.open_duration {
                        drop(opened_at);
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Relaxed);
                            return BreakerCheck::Probe;
                        }
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    /// Reset the failure counter once the 60s counting window elapses, so
    /// a stale trickle of old failures can't accumulate indefinitely.
    fn roll_failure_window(&self) {
        let mut started = self.window_started_at.lock().unwrap();
        if started.elapsed() >= self.config.failure_window {
            *started = Instant::now();
            self.failures_in_window.store(0, Ordering::Relaxed);
        }
    }

    fn record_success(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                self.failures_in_window.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.failures_in_window.store(0, Ordering::Relaxed);
                    tracing::info!("circuit_breaker: closed (recovered after {count} successes)");
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self, weight: u32) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                self.roll_failure_window();
                let count = self
                    .failures_in_window
                    .fetch_add(weight.max(1), Ordering::Relaxed)
                    + weight.max(1);
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    tracing::warn!("circuit_breaker: opened (after {count} weighted failures)");
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                tracing::warn!("circuit_breaker: re-opened (probe failed in half-open)");
            }
            _ => {}
        }
    }
}
