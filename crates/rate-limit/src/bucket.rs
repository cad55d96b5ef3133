//! Token bucket evaluation.
//!
//! Everything in this module is pure: the same inputs always produce the same bucket
//! and result, and nothing here touches the store or the clock.

use jiff::Timestamp;

/// Slack for floating point noise in refill arithmetic. `5 / 60 * 60` is not exactly 5.
const EPSILON: f64 = 1e-9;

/// Slack when rounding a fractional number of seconds up, so that 12.000000000000002
/// seconds is reported as 12 and not 13.
const CEIL_SLACK: f64 = 1e-6;

/// The persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Remaining request credits, within `[0, capacity]` after every evaluation.
    pub tokens: f64,
    /// The time of the evaluation that produced this state.
    pub last_refill: Timestamp,
}

/// The outcome of evaluating one request against its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// The bucket capacity.
    pub limit: u32,
    /// Whole tokens left after this request.
    pub remaining: u32,
    /// Epoch seconds at which the bucket is full again, or when denied, when the next
    /// token becomes available.
    pub reset_at: i64,
    /// Seconds until a request can be admitted. Only set for denied requests.
    pub retry_after: Option<u64>,
}

/// Evaluates one request against a bucket and returns the bucket to persist along
/// with the admission result.
///
/// A missing bucket starts full. Stored values that cannot come out of an evaluation
/// are repaired: tokens are clamped into `[0, capacity]` and a refill time in the
/// future counts as no time elapsed.
pub fn evaluate(
    prior: Option<&Bucket>,
    now: Timestamp,
    capacity: u32,
    refill_rate_per_second: f64,
) -> (Bucket, RateLimitResult) {
    let capacity_f = f64::from(capacity);
    let rate = if refill_rate_per_second.is_finite() && refill_rate_per_second > 0.0 {
        refill_rate_per_second
    } else {
        f64::MIN_POSITIVE
    };

    let refilled = match prior {
        None => capacity_f,
        Some(bucket) => {
            let tokens = if bucket.tokens.is_nan() {
                0.0
            } else {
                bucket.tokens.clamp(0.0, capacity_f)
            };

            let elapsed_ms = now
                .as_millisecond()
                .saturating_sub(bucket.last_refill.as_millisecond())
                .max(0);

            let elapsed = elapsed_ms as f64 / 1000.0;
            let refilled = (tokens + elapsed * rate).min(capacity_f);

            if capacity_f - refilled < EPSILON {
                capacity_f
            } else {
                refilled
            }
        }
    };

    let now_seconds = now.as_millisecond() as f64 / 1000.0;

    let (tokens, result) = if refilled + EPSILON >= 1.0 {
        let tokens = (refilled - 1.0).max(0.0);
        let until_full = (capacity_f - tokens) / rate;

        let result = RateLimitResult {
            allowed: true,
            limit: capacity,
            remaining: whole_tokens(tokens),
            reset_at: ceil_seconds(now_seconds + until_full) as i64,
            retry_after: None,
        };

        (tokens, result)
    } else {
        let wait = (1.0 - refilled) / rate;

        let result = RateLimitResult {
            allowed: false,
            limit: capacity,
            remaining: whole_tokens(refilled),
            reset_at: ceil_seconds(now_seconds + wait) as i64,
            retry_after: Some((ceil_seconds(wait) as u64).max(1)),
        };

        (refilled, result)
    };

    let bucket = Bucket {
        tokens,
        last_refill: now,
    };

    (bucket, result)
}

fn whole_tokens(tokens: f64) -> u32 {
    (tokens + EPSILON).floor() as u32
}

fn ceil_seconds(seconds: f64) -> f64 {
    (seconds - CEIL_SLACK).ceil()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn start() -> Timestamp {
        Timestamp::from_second(1_700_000_000).unwrap()
    }

    fn later(ts: Timestamp, seconds: u64) -> Timestamp {
        ts + Duration::from_secs(seconds)
    }

    #[test]
    fn first_request_starts_full_and_consumes_one() {
        let (bucket, result) = evaluate(None, start(), 5, 5.0 / 60.0);

        assert_eq!(bucket.tokens, 4.0);
        assert_eq!(bucket.last_refill, start());

        insta::assert_debug_snapshot!(result, @r"
        RateLimitResult {
            allowed: true,
            limit: 5,
            remaining: 4,
            reset_at: 1700000012,
            retry_after: None,
        }
        ");
    }

    #[test]
    fn burst_then_cooldown() {
        let rate = 5.0 / 60.0;
        let mut bucket = None;
        let mut remaining = Vec::new();

        for _ in 0..5 {
            let (next, result) = evaluate(bucket.as_ref(), start(), 5, rate);
            assert!(result.allowed);

            remaining.push(result.remaining);
            bucket = Some(next);
        }

        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let (next, denied) = evaluate(bucket.as_ref(), start(), 5, rate);

        insta::assert_debug_snapshot!(denied, @r"
        RateLimitResult {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: 1700000012,
            retry_after: Some(
                12,
            ),
        }
        ");

        let (_, result) = evaluate(Some(&next), later(start(), 60), 5, rate);

        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[test]
    fn retry_after_points_at_next_admission() {
        let rate = 5.0 / 60.0;
        let empty = Bucket {
            tokens: 0.0,
            last_refill: start(),
        };

        let (bucket, denied) = evaluate(Some(&empty), start(), 5, rate);
        let retry_after = denied.retry_after.unwrap();

        let (_, too_early) = evaluate(Some(&bucket), later(start(), retry_after - 1), 5, rate);
        assert!(!too_early.allowed);

        let (_, on_time) = evaluate(Some(&bucket), later(start(), retry_after), 5, rate);
        assert!(on_time.allowed);
    }

    #[test]
    fn denied_request_keeps_partial_refill() {
        let rate = 1.0;
        let empty = Bucket {
            tokens: 0.0,
            last_refill: start(),
        };

        let half_second = start() + Duration::from_millis(500);
        let (bucket, result) = evaluate(Some(&empty), half_second, 10, rate);

        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(1));
        assert_eq!(bucket.tokens, 0.5);
        assert_eq!(bucket.last_refill, half_second);
    }

    #[test]
    fn long_idle_clamps_to_capacity() {
        let bucket = Bucket {
            tokens: 0.0,
            last_refill: Timestamp::UNIX_EPOCH,
        };

        let (next, result) = evaluate(Some(&bucket), start(), 3, 1000.0);

        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
        assert_eq!(next.tokens, 2.0);
    }

    #[test]
    fn tampered_token_counts_are_clamped() {
        let inflated = Bucket {
            tokens: 1_000_000.0,
            last_refill: start(),
        };

        let (next, result) = evaluate(Some(&inflated), start(), 5, 1.0);
        assert_eq!(result.remaining, 4);
        assert_eq!(next.tokens, 4.0);

        let negative = Bucket {
            tokens: -50.0,
            last_refill: start(),
        };

        let (next, result) = evaluate(Some(&negative), start(), 5, 1.0);
        assert!(!result.allowed);
        assert_eq!(next.tokens, 0.0);

        let garbage = Bucket {
            tokens: f64::NAN,
            last_refill: start(),
        };

        let (next, result) = evaluate(Some(&garbage), start(), 5, 1.0);
        assert!(!result.allowed);
        assert_eq!(next.tokens, 0.0);
    }

    #[test]
    fn refill_time_in_the_future_counts_as_no_time_elapsed() {
        let skewed = Bucket {
            tokens: 0.0,
            last_refill: later(start(), 3600),
        };

        let (next, result) = evaluate(Some(&skewed), start(), 5, 1.0);

        assert!(!result.allowed);
        assert_eq!(next.tokens, 0.0);
        assert_eq!(next.last_refill, start());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let bucket = Bucket {
            tokens: 2.25,
            last_refill: start(),
        };

        let now = later(start(), 7);

        assert_eq!(evaluate(Some(&bucket), now, 10, 0.3), evaluate(Some(&bucket), now, 10, 0.3));
    }

    #[test]
    fn allowed_reset_is_when_bucket_is_full_again() {
        let bucket = Bucket {
            tokens: 2.0,
            last_refill: start(),
        };

        // One token left after admission, nine missing at half a token per second.
        let (_, result) = evaluate(Some(&bucket), start(), 10, 0.5);

        assert_eq!(result.reset_at, 1_700_000_018);
        assert_eq!(result.remaining, 1);
    }
}
