use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::{BucketOutcome, FixedOutcome, PeekOutcome, SlidingOutcome};
use crate::error::{RateLimitError, Result};
use crate::policy::Algorithm;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_KEYS: usize = 10_000;
const DEFAULT_MIN_RETAIN: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a single entry remembers, shaped by which algorithm wrote it.
/// The storage key already embeds the algorithm tag, so one `DashMap`
/// suffices for all three algorithms — there's no risk of a fixed-window
/// and a bucket entry colliding on the same key.
enum EntryState {
    Fixed { count: u64, window_start_ms: u64 },
    Sliding { hits: Vec<u64>, period_ms: u64 },
    Bucket { tokens: f64, last_refill_ms: u64 },
}

struct Entry {
    inner: AsyncMutex<EntryState>,
    last_access_ms: AtomicU64,
    expires_at_ms: AtomicU64,
}

/// In-process storage driver: no network hop, bounded by a background
/// sweep rather than per-key TTLs.
pub struct MemoryBackend {
    name: String,
    entries: Arc<DashMap<String, Arc<Entry>>>,
    max_keys: usize,
    min_retain: Duration,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    gc_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_KEYS, DEFAULT_MIN_RETAIN)
    }

    pub fn with_config(
        name: impl Into<String>,
        cleanup_interval: Duration,
        max_keys: usize,
        min_retain: Duration,
    ) -> Self {
        let entries: Arc<DashMap<String, Arc<Entry>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let gc_entries = entries.clone();
        let gc_shutdown = shutdown.clone();
        let gc_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        evict_stale(&gc_entries, max_keys, min_retain);
                    }
                    _ = gc_shutdown.cancelled() => {
                        tracing::debug!("memory backend: gc task shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            name: name.into(),
            entries,
            max_keys,
            min_retain,
            closed,
            shutdown,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            gc_handle: Some(gc_handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the background sweeper to stop and wait up to the configured
    /// grace period for it to finish its current pass.
    pub async fn shutdown(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        if let Some(handle) = self.gc_handle.take() {
            let _ = tokio::time::timeout(self.shutdown_grace, handle).await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::BackendClosed);
        }
        Ok(())
    }

    fn get_or_create(&self, key: &str, ttl_ms: u64, now_ms: u64) -> Arc<Entry> {
        if let Some(entry) = self.entries.get(key) {
            entry.last_access_ms.store(now_ms, Ordering::Relaxed);
            return entry.value().clone();
        }
        self.maybe_evict_on_insert();
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    inner: AsyncMutex::new(EntryState::Fixed {
                        count: 0,
                        window_start_ms: now_ms,
                    }),
                    last_access_ms: AtomicU64::new(now_ms),
                    expires_at_ms: AtomicU64::new(now_ms + ttl_ms),
                })
            })
            .clone()
    }

    fn maybe_evict_on_insert(&self) {
        if self.entries.len() >= self.max_keys {
            evict_stale(&self.entries, self.max_keys, self.min_retain);
        }
    }

    pub async fn incr_fixed(
        &self,
        key: &str,
        period_secs: u64,
        align_to_clock: bool,
        now_ms: u64,
    ) -> Result<FixedOutcome> {
        self.ensure_open()?;
        let period_ms = period_secs.saturating_mul(1000);
        let entry = self.get_or_create(key, period_ms, now_ms);
        entry.last_access_ms.store(now_ms, Ordering::Relaxed);

        let mut state = entry.inner.lock().await;
        let window_start_ms = if align_to_clock {
            (now_ms / period_ms) * period_ms
        } else {
            match &*state {
                EntryState::Fixed { window_start_ms, .. } if now_ms - *window_start_ms < period_ms => {
                    *window_start_ms
                }
                _ => now_ms,
            }
        };

        let count = match &mut *state {
            EntryState::Fixed {
                count,
                window_start_ms: existing_start,
            } if *existing_start == window_start_ms => {
                *count += 1;
                *count
            }
            _ => {
                *state = EntryState::Fixed {
                    count: 1,
                    window_start_ms,
                };
                1
            }
        };
        let reset_at_secs = (window_start_ms + period_ms) / 1000;
        entry
            .expires_at_ms
            .store(window_start_ms + period_ms, Ordering::Relaxed);

        Ok(FixedOutcome {
            count,
            reset_at_secs,
        })
    }

    pub async fn check_sliding(
        &self,
        key: &str,
        period_secs: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<SlidingOutcome> {
        self.ensure_open()?;
        let period_ms = period_secs.saturating_mul(1000);
        let entry = self.get_or_create(key, period_ms, now_ms);
        entry.last_access_ms.store(now_ms, Ordering::Relaxed);

        let mut state = entry.inner.lock().await;
        let hits = match &mut *state {
            EntryState::Sliding { hits, .. } => hits,
            _ => {
                *state = EntryState::Sliding {
                    hits: Vec::new(),
                    period_ms,
                };
                match &mut *state {
                    EntryState::Sliding { hits, .. } => hits,
                    _ => unreachable!(),
                }
            }
        };

        let cutoff = now_ms.saturating_sub(period_ms);
        hits.retain(|&t| t > cutoff);

        let admitted = (hits.len() as u64) < limit;
        if admitted {
            hits.push(now_ms);
        }
        let count_after = hits.len() as u64;
        let reset_at_secs = (now_ms + period_ms) / 1000;
        entry
            .expires_at_ms
            .store(now_ms + period_ms, Ordering::Relaxed);

        Ok(SlidingOutcome {
            count_after,
            reset_at_secs,
            admitted,
        })
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
        self.ensure_open()?;
        let ttl_ms = ttl_hint_secs.saturating_mul(1000).max(1000);
        let entry = self.get_or_create(key, ttl_ms, now_ms);
        entry.last_access_ms.store(now_ms, Ordering::Relaxed);

        let mut state = entry.inner.lock().await;
        let (tokens, last_refill_ms) = match &*state {
            EntryState::Bucket {
                tokens,
                last_refill_ms,
            } => (*tokens, *last_refill_ms),
            _ => (capacity as f64, now_ms),
        };

        let elapsed_ms = now_ms.saturating_sub(last_refill_ms) as f64;
        let refilled = (tokens + elapsed_ms / 1000.0 * refill_rate).min(capacity as f64);

        let cost = cost.max(1) as f64;
        let admitted = refilled >= cost;
        let tokens_after = if admitted { refilled - cost } else { refilled };

        *state = EntryState::Bucket {
            tokens: tokens_after,
            last_refill_ms: now_ms,
        };

        let deficit = (capacity as f64 - tokens_after).max(0.0);
        let secs_to_full = if refill_rate > 0.0 {
            deficit / refill_rate
        } else {
            0.0
        };
        let reset_at_secs = now_ms / 1000 + secs_to_full.ceil() as u64;
        entry.expires_at_ms.store(now_ms + ttl_ms, Ordering::Relaxed);

        Ok(BucketOutcome {
            tokens_after,
            reset_at_secs,
            admitted,
        })
    }

    pub async fn peek(&self, key: &str, algo: Algorithm, now_ms: u64) -> Result<PeekOutcome> {
        self.ensure_open()?;
        let Some(entry) = self.entries.get(key) else {
            return Ok(PeekOutcome {
                value: 0.0,
                reset_at_secs: 0,
            });
        };
        let entry = entry.value().clone();
        let state = entry.inner.lock().await;
        let outcome = match (&*state, algo) {
            (EntryState::Fixed { count, .. }, Algorithm::Fixed) => PeekOutcome {
                value: *count as f64,
                reset_at_secs: entry.expires_at_ms.load(Ordering::Relaxed) / 1000,
            },
            (EntryState::Sliding { hits, period_ms }, Algorithm::Sliding) => {
                let cutoff = now_ms.saturating_sub(*period_ms);
                let live = hits.iter().filter(|&&t| t > cutoff).count();
                PeekOutcome {
                    value: live as f64,
                    reset_at_secs: entry.expires_at_ms.load(Ordering::Relaxed) / 1000,
                }
            }
            (EntryState::Bucket { tokens, .. }, Algorithm::TokenBucket) => PeekOutcome {
                value: *tokens,
                reset_at_secs: entry.expires_at_ms.load(Ordering::Relaxed) / 1000,
            },
            _ => PeekOutcome {
                value: 0.0,
                reset_at_secs: 0,
            },
        };
        Ok(outcome)
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.entries.remove(key);
        Ok(())
    }

    pub async fn probe(&self) -> Result<()> {
        self.ensure_open()
    }
}

fn now_ms_wall() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drop entries past their TTL; if still over `max_keys` after that, evict
/// the oldest-accessed entries until back under a 90% target — a two-phase
/// sweep: time-based retain first, then force-evict-by-age when still
/// oversized.
fn evict_stale(entries: &DashMap<String, Arc<Entry>>, max_keys: usize, min_retain: Duration) {
    let now = now_ms_wall();
    let min_retain_ms = min_retain.as_millis() as u64;

    entries.retain(|_, entry| {
        let expires_at = entry.expires_at_ms.load(Ordering::Relaxed);
        let last_access = entry.last_access_ms.load(Ordering::Relaxed);
        now < expires_at || now.saturating_sub(last_access) < min_retain_ms
    });

    if entries.len() <= max_keys {
        return;
    }

    let target = (max_keys * 9) / 10;
    let mut by_age: Vec<(String, u64)> = entries
        .iter()
        .map(|e| (e.key().clone(), e.value().last_access_ms.load(Ordering::Relaxed)))
        .collect();
    by_age.sort_by_key(|(_, last_access)| *last_access);

    let to_remove = entries.len().saturating_sub(target);
    for (key, _) in by_age.into_iter().take(to_remove) {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_window_counts_within_period() {
        let b = MemoryBackend::new("mem");
        let now = 1_000_000u64;
        let a = b.incr_fixed("k1", 60, true, now).await.unwrap();
        let c = b.incr_fixed("k1", 60, true, now + 500).await.unwrap();
        assert_eq!(a.count, 1);
        assert_eq!(c.count, 2);
    }

    #[tokio::test]
    async fn fixed_window_resets_on_new_window() {
        let b = MemoryBackend::new("mem");
        let a = b.incr_fixed("k1", 1, true, 0).await.unwrap();
        let c = b.incr_fixed("k1", 1, true, 5_000).await.unwrap();
        assert_eq!(a.count, 1);
        assert_eq!(c.count, 1);
    }

    #[tokio::test]
    async fn unaligned_window_pins_to_first_arrival() {
        let b = MemoryBackend::new("mem");
        let a = b.incr_fixed("k1", 60, false, 1_234).await.unwrap();
        assert_eq!(a.reset_at_secs, (1_234 + 60_000) / 1000);
    }

    #[tokio::test]
    async fn sliding_window_admits_up_to_limit() {
        let b = MemoryBackend::new("mem");
        for i in 0..3 {
            let r = b.check_sliding("k", 60, 3, i * 1000).await.unwrap();
            assert!(r.admitted);
        }
        let over = b.check_sliding("k", 60, 3, 3000).await.unwrap();
        assert!(!over.admitted);
    }

    #[tokio::test]
    async fn sliding_window_expires_old_hits() {
        let b = MemoryBackend::new("mem");
        b.check_sliding("k", 1, 1, 0).await.unwrap();
        let r = b.check_sliding("k", 1, 1, 2000).await.unwrap();
        assert!(r.admitted);
    }

    #[tokio::test]
    async fn token_bucket_drains_and_refills() {
        let b = MemoryBackend::new("mem");
        let first = b.check_bucket("k", 5, 1.0, 0, 5, 60).await.unwrap();
        assert!(first.admitted);
        assert_eq!(first.tokens_after, 0.0);

        let denied = b.check_bucket("k", 5, 1.0, 100, 1, 60).await.unwrap();
        assert!(!denied.admitted);

        let allowed = b.check_bucket("k", 5, 1.0, 2000, 1, 60).await.unwrap();
        assert!(allowed.admitted);
    }

    #[tokio::test]
    async fn token_bucket_never_exceeds_capacity() {
        let b = MemoryBackend::new("mem");
        b.check_bucket("k", 5, 1.0, 0, 1, 60).await.unwrap();
        let r = b.check_bucket("k", 5, 1.0, 1_000_000, 0, 60).await.unwrap();
        assert!(r.tokens_after <= 5.0);
    }

    #[tokio::test]
    async fn reset_clears_entry() {
        let b = MemoryBackend::new("mem");
        b.incr_fixed("k", 60, true, 0).await.unwrap();
        b.reset("k").await.unwrap();
        let peeked = b.peek("k", Algorithm::Fixed, 0).await.unwrap();
        assert_eq!(peeked.value, 0.0);
    }

    #[tokio::test]
    async fn peek_on_sliding_uses_injected_clock_not_wall_time() {
        let b = MemoryBackend::new("mem");
        b.check_sliding("k", 10, 5, 1_000).await.unwrap();
        b.check_sliding("k", 10, 5, 5_000).await.unwrap();

        let live = b.peek("k", Algorithm::Sliding, 6_000).await.unwrap();
        assert_eq!(live.value, 2.0);

        // The hit at 1_000 has slid out of the 10s window by 12_000.
        let live_later = b.peek("k", Algorithm::Sliding, 12_000).await.unwrap();
        assert_eq!(live_later.value, 1.0);
    }

    #[tokio::test]
    async fn closed_backend_rejects_operations() {
        let mut b = MemoryBackend::new("mem");
        b.shutdown().await;
        let err = b.incr_fixed("k", 60, true, 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::BackendClosed));
    }

    #[tokio::test]
    async fn eviction_keeps_map_bounded() {
        let b = MemoryBackend::with_config("mem", Duration::from_secs(3600), 10, Duration::from_secs(0));
        for i in 0..50 {
            b.incr_fixed(&format!("k{i}"), 60, true, i as u64).await.unwrap();
        }
        evict_stale(&b.entries, b.max_keys, b.min_retain);
        assert!(b.entries.len() <= 10);
    }
}
