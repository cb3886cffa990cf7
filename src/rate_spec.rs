use crate::error::{RateLimitError, Result};

/// A parsed `"<n>/<unit>"` rate spec: `limit` requests per `period_secs`
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    pub limit: u64,
    pub period_secs: u64,
}

/// Parse `"<n>/<unit>"` or `"<n>/<k><unit>"`, where `unit` is one of
/// `s`, `m`, `h`, `d` and `k` is a small positive multiplier, e.g.
/// `"10/30s"` means 10 requests per 30 seconds.
///
/// Fails with `BadConfig` on any other shape, non-positive `n`, a
/// non-positive or absent `k`, or an overflow while computing the
/// period in seconds.
pub fn parse_rate_spec(spec: &str) -> Result<RateSpec> {
    let (n_str, rest) = spec
        .split_once('/')
        .ok_or_else(|| RateLimitError::BadConfig(format!("malformed rate spec: {spec:?}")))?;

    let limit: u64 = n_str
        .trim()
        .parse()
        .map_err(|_| RateLimitError::BadConfig(format!("non-numeric count in {spec:?}")))?;
    if limit == 0 {
        return Err(RateLimitError::BadConfig(format!(
            "rate spec count must be positive: {spec:?}"
        )));
    }

    let rest = rest.trim();
    if rest.is_empty() {
        return Err(RateLimitError::BadConfig(format!(
            "missing unit in rate spec: {spec:?}"
        )));
    }

    let unit_char = rest
        .chars()
        .last()
        .ok_or_else(|| RateLimitError::BadConfig(format!("missing unit in rate spec: {spec:?}")))?;
    let multiplier_str = &rest[..rest.len() - unit_char.len_utf8()];

    let multiplier: u64 = if multiplier_str.is_empty() {
        1
    } else {
        multiplier_str
            .parse()
            .map_err(|_| RateLimitError::BadConfig(format!("bad multiplier in {spec:?}")))?
    };
    if multiplier == 0 {
        return Err(RateLimitError::BadConfig(format!(
            "rate spec multiplier must be positive: {spec:?}"
        )));
    }

    let unit_secs: u64 = match unit_char {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        other => {
            return Err(RateLimitError::BadConfig(format!(
                "unknown unit {other:?} in rate spec {spec:?}"
            )))
        }
    };

    let period_secs = multiplier
        .checked_mul(unit_secs)
        .ok_or_else(|| RateLimitError::BadConfig(format!("rate spec period overflow: {spec:?}")))?;

    Ok(RateSpec { limit, period_secs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_units() {
        assert_eq!(
            parse_rate_spec("100/s").unwrap(),
            RateSpec {
                limit: 100,
                period_secs: 1
            }
        );
        assert_eq!(
            parse_rate_spec("5/m").unwrap(),
            RateSpec {
                limit: 5,
                period_secs: 60
            }
        );
        assert_eq!(
            parse_rate_spec("20/h").unwrap(),
            RateSpec {
                limit: 20,
                period_secs: 3_600
            }
        );
        assert_eq!(
            parse_rate_spec("1/d").unwrap(),
            RateSpec {
                limit: 1,
                period_secs: 86_400
            }
        );
    }

    #[test]
    fn parses_multiplied_units() {
        assert_eq!(
            parse_rate_spec("10/30s").unwrap(),
            RateSpec {
                limit: 10,
                period_secs: 30
            }
        );
        assert_eq!(
            parse_rate_spec("3/2m").unwrap(),
            RateSpec {
                limit: 3,
                period_secs: 120
            }
        );
    }

    #[test]
    fn rejects_malformed_shapes() {
        assert!(parse_rate_spec("100").is_err());
        assert!(parse_rate_spec("100/").is_err());
        assert!(parse_rate_spec("/s").is_err());
        assert!(parse_rate_spec("abc/s").is_err());
        assert!(parse_rate_spec("100/xs").is_err());
        assert!(parse_rate_spec("100/0s").is_err());
        assert!(parse_rate_spec("0/s").is_err());
        assert!(parse_rate_spec("-5/s").is_err());
        assert!(parse_rate_spec("100/q").is_err());
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_rate_spec(&format!("1/{}d", u64::MAX)).is_err());
    }

    #[test]
    fn whitespace_is_tolerated_around_count() {
        assert_eq!(
            parse_rate_spec(" 100 /s").unwrap(),
            RateSpec {
                limit: 100,
                period_secs: 1
            }
        );
    }
}
