use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic-ish wall-clock source, injectable so algorithm tests can
/// control time precisely instead of sleeping real seconds.
///
/// `now_ms` is wall-clock (epoch) time, not `Instant`-based, because
/// `reset_at` values are communicated to callers as epoch seconds and
/// because the remote backend's TTLs are relative to wall-clock time on
/// a separate machine.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Default clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }
}

/// A clock whose value is set explicitly, for deterministic tests of the
/// algorithm engine and backends that advance time in exact, reproducible
/// steps.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now_ms: Arc<AtomicU64>,
}

impl FixedClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta_secs: u64) {
        self.advance_ms(delta_secs * 1000);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
