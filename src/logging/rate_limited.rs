//! Token-bucket rate limited logging

use parking_lot::Mutex;
use std::fmt;
use std::time::Instant;

/// Drops log events beyond `per_second`, reporting how many were dropped on
/// the next event that gets through.
///
/// # Example
///
/// ```
/// use kura::logging::RateLimitedLogger;
///
/// let logger = RateLimitedLogger::new(10);
/// for i in 0..100 {
///     logger.warn(format_args!("push rejected, attempt {}", i));
/// }
/// assert!(logger.suppressed() > 0);
/// ```
pub struct RateLimitedLogger {
    per_second: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    suppressed: u64,
}

impl RateLimitedLogger {
    pub fn new(per_second: u32) -> Self {
        let per_second = per_second.max(1) as f64;
        Self {
            per_second,
            bucket: Mutex::new(Bucket {
                tokens: per_second,
                last_refill: Instant::now(),
                suppressed: 0,
            }),
        }
    }

    /// Take a token. On success returns the number of events suppressed since
    /// the last one let through.
    pub fn allow(&self) -> Option<u64> {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> Option<u64> {
        let mut bucket = self.bucket.lock();

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.per_second);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Some(std::mem::take(&mut bucket.suppressed))
        } else {
            bucket.suppressed += 1;
            None
        }
    }

    /// Events dropped since the last one let through
    pub fn suppressed(&self) -> u64 {
        self.bucket.lock().suppressed
    }

    pub fn info(&self, message: impl fmt::Display) {
        if let Some(suppressed) = self.allow() {
            tracing::info!(suppressed, "{}", message);
        }
    }

    pub fn warn(&self, message: impl fmt::Display) {
        if let Some(suppressed) = self.allow() {
            tracing::warn!(suppressed, "{}", message);
        }
    }

    pub fn error(&self, message: impl fmt::Display) {
        if let Some(suppressed) = self.allow() {
            tracing::error!(suppressed, "{}", message);
        }
    }
}
