use std::sync::Arc;

use crate::backend::Backend;
use crate::error::Result;
use crate::policy::{Algorithm, Policy};

/// Outcome of one rate-limit check, independent of which algorithm produced
/// it. `tokens_after` is only meaningful for `TOKEN_BUCKET`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub admitted: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_secs: u64,
    pub tokens_after: Option<f64>,
}

/// Run one `policy` check against `key` through `backend`, dispatching to
/// whichever primitive (fixed/sliding/bucket) the policy selects and
/// normalizing the three backends' differently-shaped results into one
/// `Outcome`.
pub async fn evaluate(
    backend: &Arc<Backend>,
    policy: &Policy,
    key: &str,
    now_ms: u64,
) -> Result<Outcome> {
    match policy.algorithm {
        Algorithm::Fixed => {
            let r = backend
                .incr_fixed(key, policy.period_secs, policy.align_to_clock, now_ms)
                .await?;
            let admitted = r.count <= policy.limit;
            let remaining = policy.limit.saturating_sub(r.count);
            Ok(Outcome {
                admitted,
                limit: policy.limit,
                remaining,
                reset_at_secs: r.reset_at_secs,
                tokens_after: None,
            })
        }
        Algorithm::Sliding => {
            let r = backend
                .check_sliding(key, policy.period_secs, policy.limit, now_ms)
                .await?;
            let remaining = policy.limit.saturating_sub(r.count_after);
            Ok(Outcome {
                admitted: r.admitted,
                limit: policy.limit,
                remaining,
                reset_at_secs: r.reset_at_secs,
                tokens_after: None,
            })
        }
        Algorithm::TokenBucket => {
            let capacity = policy.effective_bucket_size();
            let refill_rate = policy.refill_rate.unwrap_or(0.0);
            // A bucket's state must outlive the time it takes to refill from
            // empty back to capacity, not just one policy period, or a
            // still-meaningful partial bucket gets silently reset to full.
            let ttl_hint_secs = if refill_rate > 0.0 {
                (capacity as f64 / refill_rate).ceil() as u64 + policy.period_secs
            } else {
                policy.period_secs
            };
            let r = backend
                .check_bucket(key, capacity, refill_rate, now_ms, 1, ttl_hint_secs)
                .await?;
            Ok(Outcome {
                admitted: r.admitted,
                limit: policy.limit,
                remaining: r.tokens_after.floor().max(0.0) as u64,
                reset_at_secs: r.reset_at_secs,
                tokens_after: Some(r.tokens_after),
            })
        }
    }
}
