//! Concurrency and sliding-window rate limiting.
//!
//! Both limiters implement the same small interface the queue's `next()`
//! consults before leasing a job: can it start right now, and if not, when
//! should the queue look again. Recording a start/completion lets the
//! limiter track its own state instead of the queue reaching into internals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// Policy object deciding whether a job may start now, and when next.
pub trait Limiter: Send + Sync {
    fn can_proceed(&self) -> bool;
    fn record_job_start(&self);
    fn record_job_completion(&self);
    fn next_available_time(&self) -> SystemTime;
    /// Externally provided override (e.g. from a 429's `Retry-After`).
    /// Takes precedence over the limiter's own computation whenever it is
    /// later — see [`later`].
    fn set_next_available_time(&self, t: SystemTime);
}

fn later(a: SystemTime, b: Option<SystemTime>) -> SystemTime {
    match b {
        Some(b) if b > a => b,
        _ => a,
    }
}

/// Caps the number of concurrently in-flight jobs.
pub struct ConcurrencyLimiter {
    in_flight: AtomicU64,
    cap: u64,
    poll_interval: Duration,
    external_override: Mutex<Option<SystemTime>>,
}

impl ConcurrencyLimiter {
    pub fn new(cap: u64) -> Self {
        Self {
            in_flight: AtomicU64::new(0),
            cap,
            poll_interval: Duration::from_millis(50),
            external_override: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Limiter for ConcurrencyLimiter {
    fn can_proceed(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) < self.cap
            && self
                .external_override
                .lock()
                .map(|t| t <= SystemTime::now())
                .unwrap_or(true)
    }

    fn record_job_start(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn record_job_completion(&self) {
        // Saturating: a completion without a matching start (shouldn't
        // happen, but defend against drift) must not wrap to u64::MAX.
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn next_available_time(&self) -> SystemTime {
        let now = SystemTime::now();
        let computed = if self.in_flight.load(Ordering::SeqCst) < self.cap {
            now
        } else {
            now + self.poll_interval
        };
        later(computed, *self.external_override.lock())
    }

    fn set_next_available_time(&self, t: SystemTime) {
        *self.external_override.lock() = Some(t);
    }
}

/// Admits at most `max_executions` starts within any `window_size`-wide
/// sliding window. Resets on restart; a persistent-storage-backed variant
/// would rehydrate `starts` from storage instead of starting empty.
pub struct RateLimiter {
    window_size: Duration,
    max_executions: usize,
    starts: Mutex<VecDeque<SystemTime>>,
    external_override: Mutex<Option<SystemTime>>,
}

impl RateLimiter {
    pub fn new(max_executions: usize, window_size: Duration) -> Self {
        Self {
            window_size,
            max_executions,
            starts: Mutex::new(VecDeque::new()),
            external_override: Mutex::new(None),
        }
    }

    /// Drops timestamps outside `(now - window_size, now]` and returns the
    /// remaining (oldest-first) starts still inside the window.
    fn prune(&self, now: SystemTime) -> VecDeque<SystemTime> {
        let mut starts = self.starts.lock();
        let cutoff = now.checked_sub(self.window_size).unwrap_or(SystemTime::UNIX_EPOCH);
        while let Some(front) = starts.front() {
            if *front <= cutoff {
                starts.pop_front();
            } else {
                break;
            }
        }
        starts.clone()
    }
}

impl Limiter for RateLimiter {
    fn can_proceed(&self) -> bool {
        let now = SystemTime::now();
        let within_window = self.prune(now).len() < self.max_executions;
        let override_clear = self
            .external_override
            .lock()
            .map(|t| t <= now)
            .unwrap_or(true);
        within_window && override_clear
    }

    fn record_job_start(&self) {
        self.starts.lock().push_back(SystemTime::now());
    }

    fn record_job_completion(&self) {
        // Sliding-window admission only cares about start times.
    }

    fn next_available_time(&self) -> SystemTime {
        let now = SystemTime::now();
        let window = self.prune(now);
        let computed = if window.len() < self.max_executions {
            now
        } else {
            // Oldest start plus the window size is the next moment a slot frees up.
            *window.front().unwrap() + self.window_size
        };
        later(computed, *self.external_override.lock())
    }

    fn set_next_available_time(&self, t: SystemTime) {
        *self.external_override.lock() = Some(t);
    }
}
