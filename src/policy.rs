use std::sync::Arc;

use crate::error::{RateLimitError, Result};
use crate::key::{KeyContext, KeySpec};

/// Which primitive backend operation the algorithm engine dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Fixed,
    Sliding,
    TokenBucket,
}

impl Algorithm {
    /// Tag used in storage keys and metrics-free log fields.
    pub fn tag(&self) -> &'static str {
        match self {
            Algorithm::Fixed => "fixed",
            Algorithm::Sliding => "sliding",
            Algorithm::TokenBucket => "bucket",
        }
    }
}

type SkipPredicate = Arc<dyn Fn(&KeyContext) -> bool + Send + Sync>;

/// Immutable per-call configuration. Constructed once per route / call
/// site and reused across many `Check` calls, compiled once at config-load
/// time rather than per request.
#[derive(Clone)]
pub struct Policy {
    pub limit: u64,
    pub period_secs: u64,
    pub algorithm: Algorithm,
    pub bucket_size: Option<u64>,
    pub refill_rate: Option<f64>,
    pub align_to_clock: bool,
    pub block_on_exceed: bool,
    pub fail_open: bool,
    pub key: KeySpec,
    skip: Option<SkipPredicate>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("limit", &self.limit)
            .field("period_secs", &self.period_secs)
            .field("algorithm", &self.algorithm)
            .field("bucket_size", &self.bucket_size)
            .field("refill_rate", &self.refill_rate)
            .field("align_to_clock", &self.align_to_clock)
            .field("block_on_exceed", &self.block_on_exceed)
            .field("fail_open", &self.fail_open)
            .field("key", &self.key)
            .field("has_skip", &self.skip.is_some())
            .finish()
    }
}

/// Builder for `Policy`, validated on `build()`.
pub struct PolicyBuilder {
    limit: u64,
    period_secs: u64,
    algorithm: Algorithm,
    bucket_size: Option<u64>,
    refill_rate: Option<f64>,
    align_to_clock: bool,
    block_on_exceed: bool,
    fail_open: bool,
    key: KeySpec,
    skip: Option<SkipPredicate>,
}

impl PolicyBuilder {
    pub fn new(limit: u64, period_secs: u64, algorithm: Algorithm) -> Self {
        Self {
            limit,
            period_secs,
            algorithm,
            bucket_size: None,
            refill_rate: None,
            align_to_clock: true,
            block_on_exceed: false,
            // Fail-closed by default — safer when a backend is unreachable.
            fail_open: false,
            key: KeySpec::literal("default"),
            skip: None,
        }
    }

    pub fn bucket_size(mut self, size: u64) -> Self {
        self.bucket_size = Some(size);
        self
    }

    pub fn refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = Some(rate);
        self
    }

    pub fn align_to_clock(mut self, align: bool) -> Self {
        self.align_to_clock = align;
        self
    }

    pub fn block_on_exceed(mut self, block: bool) -> Self {
        self.block_on_exceed = block;
        self
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn key(mut self, key: KeySpec) -> Self {
        self.key = key;
        self
    }

    pub fn skip_if(mut self, predicate: impl Fn(&KeyContext) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> Result<Policy> {
        if self.limit == 0 {
            return Err(RateLimitError::BadConfig("limit must be positive".into()));
        }
        if self.period_secs < 1 {
            return Err(RateLimitError::BadConfig(
                "period must be at least 1 second".into(),
            ));
        }
        if self.algorithm == Algorithm::TokenBucket {
            match self.refill_rate {
                Some(r) if r > 0.0 => {}
                _ => {
                    return Err(RateLimitError::BadConfig(
                        "refill_rate must be a positive real for TOKEN_BUCKET".into(),
                    ))
                }
            }
        }
        if let Some(size) = self.bucket_size {
            if size < self.limit {
                return Err(RateLimitError::BadConfig(
                    "bucket_size must be >= limit".into(),
                ));
            }
        }

        Ok(Policy {
            limit: self.limit,
            period_secs: self.period_secs,
            algorithm: self.algorithm,
            bucket_size: self.bucket_size,
            refill_rate: self.refill_rate,
            align_to_clock: self.align_to_clock,
            block_on_exceed: self.block_on_exceed,
            fail_open: self.fail_open,
            key: self.key,
            skip: self.skip,
        })
    }
}

impl Policy {
    pub fn builder(limit: u64, period_secs: u64, algorithm: Algorithm) -> PolicyBuilder {
        PolicyBuilder::new(limit, period_secs, algorithm)
    }

    /// Effective bucket capacity: the configured `bucket_size`, or `limit`
    /// when unset (a plain token bucket with no extra burst allowance).
    pub fn effective_bucket_size(&self) -> u64 {
        self.bucket_size.unwrap_or(self.limit)
    }

    pub fn should_skip(&self, ctx: &KeyContext) -> bool {
        self.skip.as_ref().is_some_and(|p| p(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_builds_with_defaults() {
        let p = Policy::builder(10, 60, Algorithm::Fixed).build().unwrap();
        assert_eq!(p.limit, 10);
        assert_eq!(p.period_secs, 60);
        assert!(p.align_to_clock);
        assert!(!p.fail_open);
    }

    #[test]
    fn token_bucket_requires_refill_rate() {
        let err = Policy::builder(10, 60, Algorithm::TokenBucket)
            .build()
            .unwrap_err();
        assert!(matches!(err, RateLimitError::BadConfig(_)));

        let ok = Policy::builder(10, 60, Algorithm::TokenBucket)
            .refill_rate(1.5)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn token_bucket_rejects_non_positive_refill_rate() {
        let err = Policy::builder(10, 60, Algorithm::TokenBucket)
            .refill_rate(0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, RateLimitError::BadConfig(_)));
    }

    #[test]
    fn bucket_size_must_be_at_least_limit() {
        let err = Policy::builder(10, 60, Algorithm::TokenBucket)
            .refill_rate(1.0)
            .bucket_size(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, RateLimitError::BadConfig(_)));

        let ok = Policy::builder(10, 60, Algorithm::TokenBucket)
            .refill_rate(1.0)
            .bucket_size(20)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn zero_limit_rejected() {
        assert!(Policy::builder(0, 60, Algorithm::Fixed).build().is_err());
    }

    #[test]
    fn sub_second_period_rejected() {
        assert!(Policy::builder(10, 0, Algorithm::Fixed).build().is_err());
    }

    #[test]
    fn effective_bucket_size_defaults_to_limit() {
        let p = Policy::builder(10, 60, Algorithm::TokenBucket)
            .refill_rate(1.0)
            .build()
            .unwrap();
        assert_eq!(p.effective_bucket_size(), 10);

        let p2 = Policy::builder(10, 60, Algorithm::TokenBucket)
            .refill_rate(1.0)
            .bucket_size(50)
            .build()
            .unwrap();
        assert_eq!(p2.effective_bucket_size(), 50);
    }

    #[test]
    fn skip_predicate_is_evaluated() {
        let p = Policy::builder(10, 60, Algorithm::Fixed)
            .skip_if(|ctx| ctx.path.as_deref() == Some("/health"))
            .build()
            .unwrap();

        let skip_ctx = KeyContext {
            path: Some("/health".into()),
            ..Default::default()
        };
        let normal_ctx = KeyContext {
            path: Some("/v1/users".into()),
            ..Default::default()
        };
        assert!(p.should_skip(&skip_ctx));
        assert!(!p.should_skip(&normal_ctx));
    }
}
