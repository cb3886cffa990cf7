use std::time::Duration;

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;

use super::{BucketOutcome, FixedOutcome, PeekOutcome, SlidingOutcome};
use crate::error::{RateLimitError, Result};
use crate::policy::Algorithm;

/// Fixed window counter stored as a hash (`count`, `window_start`) under one
/// stable key per logical key — mirrors `MemoryBackend`'s `EntryState::Fixed`
/// so `peek`/`reset` operate on the same key `incr_fixed` wrote, instead of a
/// key re-derived from the current window. Aligned windows snap
/// `window_start` to the period boundary; unaligned windows pin it to first
/// arrival and keep it as long as the window hasn't elapsed, same as the
/// in-memory backend.
const FIXED_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local period_ms = tonumber(ARGV[2])
local aligned = tonumber(ARGV[3])

local existing = redis.call('HMGET', key, 'count', 'window_start')
local existing_count = tonumber(existing[1])
local existing_start = tonumber(existing[2])

local window_start
if aligned == 1 then
    window_start = now_ms - (now_ms % period_ms)
elseif existing_start and (now_ms - existing_start) < period_ms then
    window_start = existing_start
else
    window_start = now_ms
end

local count
if existing_count and existing_start == window_start then
    count = existing_count + 1
else
    count = 1
end

redis.call('HMSET', key, 'count', count, 'window_start', window_start)
local window_end = window_start + period_ms
local ttl_ms = window_end - now_ms
if ttl_ms < 1 then ttl_ms = 1 end
redis.call('PEXPIRE', key, ttl_ms)
return {count, window_end}
"#;

/// Sorted-set sliding window: trim entries outside the window, count what's
/// left, and admit-then-record in one atomic round trip.
const SLIDING_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local period_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

local cutoff = now_ms - period_ms
redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)
local count = redis.call('ZCARD', key)

local admitted = 0
if count < limit then
    redis.call('ZADD', key, now_ms, member)
    count = count + 1
    admitted = 1
end
redis.call('PEXPIRE', key, period_ms)
return {count, admitted}
"#;

/// Hash-backed token bucket: lazily refill based on elapsed time since the
/// last touch, then attempt to spend `cost` tokens.
const BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local tokens = capacity
local last = now_ms
local existing = redis.call('HMGET', key, 'tokens', 'last')
if existing[1] then
    tokens = tonumber(existing[1])
    last = tonumber(existing[2])
end

local elapsed_ms = now_ms - last
if elapsed_ms < 0 then elapsed_ms = 0 end
tokens = math.min(capacity, tokens + (elapsed_ms / 1000.0) * refill_rate)

local admitted = 0
if tokens >= cost then
    tokens = tokens - cost
    admitted = 1
end

redis.call('HMSET', key, 'tokens', tostring(tokens), 'last', tostring(now_ms))
redis.call('PEXPIRE', key, ttl_ms)
return {tostring(tokens), admitted}
"#;

const PEEK_FIXED_SCRIPT: &str = r#"
local count = redis.call('HGET', KEYS[1], 'count')
local ttl = redis.call('PTTL', KEYS[1])
if not count then count = 0 end
if ttl < 0 then ttl = 0 end
return {count, ttl}
"#;

/// `Peek` has no period argument (it inspects whatever `check_sliding` last
/// wrote), so this can only report the sorted set's current cardinality —
/// it does not re-trim by cutoff, since that would mutate state the caller
/// never asked to advance.
const PEEK_SLIDING_SCRIPT: &str = r#"
local count = redis.call('ZCARD', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then ttl = 0 end
return {count, ttl}
"#;

/// Distributed storage driver backed by a Redis-compatible server (spec
/// §4.5). All operations run as a single Lua script so the read-modify-write
/// cycle is atomic without a client-side transaction round trip.
pub struct RemoteBackend {
    name: String,
    pool: Pool,
    timeout: Duration,
    fixed_script: Script,
    sliding_script: Script,
    bucket_script: Script,
    peek_fixed_script: Script,
    peek_sliding_script: Script,
}

impl RemoteBackend {
    pub fn new(name: impl Into<String>, redis_url: &str, pool_size: usize, timeout: Duration) -> Result<Self> {
        let mut cfg = PoolConfig::from_url(redis_url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| RateLimitError::BadConfig(format!("invalid redis config: {e}")))?;

        Ok(Self {
            name: name.into(),
            pool,
            timeout,
            fixed_script: Script::new(FIXED_SCRIPT),
            sliding_script: Script::new(SLIDING_SCRIPT),
            bucket_script: Script::new(BUCKET_SCRIPT),
            peek_fixed_script: Script::new(PEEK_FIXED_SCRIPT),
            peek_sliding_script: Script::new(PEEK_SLIDING_SCRIPT),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        tokio::time::timeout(self.timeout, self.pool.get())
            .await
            .map_err(|_| RateLimitError::BackendTransient(format!("{}: pool checkout timed out", self.name)))?
            .map_err(|e| RateLimitError::BackendTransient(format!("{}: pool error: {e}", self.name)))
    }

    async fn run_with_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) if e.is_connection_dropped() || e.is_timeout() || e.is_io_error() => {
                Err(RateLimitError::BackendTransient(format!("{}: {e}", self.name)))
            }
            Ok(Err(e)) => Err(RateLimitError::BackendFatal(format!("{}: {e}", self.name))),
            Err(_) => Err(RateLimitError::BackendTransient(format!(
                "{}: operation timed out after {:?}",
                self.name, self.timeout
            ))),
        }
    }

    pub async fn incr_fixed(
        &self,
        key: &str,
        period_secs: u64,
        align_to_clock: bool,
        now_ms: u64,
    ) -> Result<FixedOutcome> {
        let period_ms = period_secs.saturating_mul(1000);
        let mut conn = self.connection().await?;
        let (count, window_end_ms): (u64, u64) = self
            .run_with_timeout(
                self.fixed_script
                    .key(key)
                    .arg(now_ms)
                    .arg(period_ms)
                    .arg(if align_to_clock { 1 } else { 0 })
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(FixedOutcome {
            count,
            reset_at_secs: window_end_ms / 1000,
        })
    }

    pub async fn check_sliding(
        &self,
        key: &str,
        period_secs: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<SlidingOutcome> {
        let period_ms = period_secs.saturating_mul(1000);
        let member = format!("{now_ms}:{}", rand::random::<u32>());
        let mut conn = self.connection().await?;
        let (count_after, admitted): (u64, u64) = self
            .run_with_timeout(
                self.sliding_script
                    .key(key)
                    .arg(now_ms)
                    .arg(period_ms)
                    .arg(limit)
                    .arg(member)
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(SlidingOutcome {
            count_after,
            reset_at_secs: (now_ms + period_ms) / 1000,
            admitted: admitted == 1,
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
        let ttl_ms = ttl_hint_secs.saturating_mul(1000).max(1000);
        let mut conn = self.connection().await?;
        let (tokens_str, admitted): (String, u64) = self
            .run_with_timeout(
                self.bucket_script
                    .key(key)
                    .arg(now_ms)
                    .arg(capacity)
                    .arg(refill_rate)
                    .arg(cost.max(1))
                    .arg(ttl_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        let tokens_after: f64 = tokens_str
            .parse()
            .map_err(|_| RateLimitError::BackendFatal(format!("{}: malformed token value", self.name)))?;
        let deficit = (capacity as f64 - tokens_after).max(0.0);
        let secs_to_full = if refill_rate > 0.0 { deficit / refill_rate } else { 0.0 };

        Ok(BucketOutcome {
            tokens_after,
            reset_at_secs: now_ms / 1000 + secs_to_full.ceil() as u64,
            admitted: admitted == 1,
        })
    }

    pub async fn peek(&self, key: &str, algo: Algorithm, now_ms: u64) -> Result<PeekOutcome> {
        let mut conn = self.connection().await?;
        match algo {
            Algorithm::Fixed => {
                let (count, ttl_ms): (u64, i64) = self
                    .run_with_timeout(self.peek_fixed_script.key(key).invoke_async(&mut conn))
                    .await?;
                Ok(PeekOutcome {
                    value: count as f64,
                    reset_at_secs: (now_ms + ttl_ms.max(0) as u64) / 1000,
                })
            }
            Algorithm::Sliding => {
                let (count, ttl_ms): (u64, i64) = self
                    .run_with_timeout(self.peek_sliding_script.key(key).invoke_async(&mut conn))
                    .await?;
                Ok(PeekOutcome {
                    value: count as f64,
                    reset_at_secs: (now_ms + ttl_ms.max(0) as u64) / 1000,
                })
            }
            Algorithm::TokenBucket => {
                let raw: Option<(String, String)> = self
                    .run_with_timeout(
                        redis::cmd("HMGET")
                            .arg(key)
                            .arg("tokens")
                            .arg("last")
                            .query_async(&mut conn),
                    )
                    .await
                    .ok();
                let value = raw
                    .and_then(|(tokens, _)| tokens.parse::<f64>().ok())
                    .unwrap_or(0.0);
                Ok(PeekOutcome {
                    value,
                    reset_at_secs: 0,
                })
            }
        }
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        self.run_with_timeout(redis::cmd("DEL").arg(key).query_async::<()>(&mut conn))
            .await
    }

    pub async fn probe(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        self.run_with_timeout(redis::cmd("PING").query_async::<()>(&mut conn))
            .await
    }
}
