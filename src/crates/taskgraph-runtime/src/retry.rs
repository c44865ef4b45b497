//! Retry policy: exponential backoff, and HTTP-style `Retry-After` parsing.
//!
//! Two independent things live here. [`RetryPolicy`] computes *how long to
//! wait* before the next attempt when no explicit retry date was given.
//! [`parse_retry_after`] converts a `Retry-After`-shaped header value (either
//! a non-negative integer of seconds, or an HTTP-date) into an absolute
//! [`SystemTime`], falling back to `None` (letting the policy's backoff take
//! over) on anything malformed or already in the past.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::{Duration, SystemTime};

/// Exponential backoff with a cap and optional jitter.
///
/// `base * 2^attempts`, capped at `max_backoff`, clipped by `max_attempts`.
/// Mirrors the builder shape used for the graph engine's node-level retry
/// policy: construct with the one required field, tune the rest fluently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max_backoff: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt, given the number of attempts already made.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.min(32);
        let scaled = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0_f64);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// `now + backoff_delay(attempts)`, the `nextRunAt` absent an explicit retry date.
    pub fn next_run_at(&self, now: SystemTime, attempts: u32) -> SystemTime {
        now + self.backoff_delay(attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Parse a `Retry-After` header value into an absolute time.
///
/// Accepts either a non-negative integer number of seconds (relative to
/// `now`) or an HTTP-date (RFC 1123 / RFC 2822 / asctime, via
/// [`chrono::DateTime::parse_from_rfc2822`] and a couple of fallbacks).
/// Returns `None` for anything malformed or for a date already in the past
/// relative to `now` — both cases fall back to the policy's own backoff.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<SystemTime> {
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(now + Duration::from_secs(seconds as u64));
    }

    let parsed = DateTime::parse_from_rfc2822(trimmed)
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed))
        .ok()?;
    let parsed_utc: DateTime<Utc> = parsed.with_timezone(&Utc);
    let candidate: SystemTime = parsed_utc.into();

    if candidate <= now {
        None
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10).with_jitter(false);
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        // Eventually hits the cap.
        assert_eq!(policy.backoff_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn parses_seconds() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let parsed = parse_retry_after("2", now).unwrap();
        assert_eq!(parsed, now + Duration::from_secs(2));
    }

    #[test]
    fn rejects_negative_seconds() {
        let now = SystemTime::now();
        assert!(parse_retry_after("-1", now).is_none());
    }

    #[test]
    fn invalid_format_falls_back_to_none() {
        let now = SystemTime::now();
        assert!(parse_retry_after("not-a-date", now).is_none());
    }

    #[test]
    fn past_http_date_falls_back_to_none() {
        let now = SystemTime::now();
        assert!(parse_retry_after("Tue, 01 Jan 2000 00:00:00 GMT", now).is_none());
    }

    #[test]
    fn future_http_date_parses() {
        let now = SystemTime::now();
        let future: DateTime<Utc> = (now + Duration::from_secs(3600)).into();
        let header = future.to_rfc2822();
        assert!(parse_retry_after(&header, now).is_some());
    }
}
