//! A token bucket limiting the byte rate of the commit path and of compaction writes. Tokens
//! refill continuously at the configured rate up to the burst size; an acquire that overdraws the
//! bucket sleeps for the shortfall.

use std::thread;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    rate_bytes_per_sec: usize,
    burst_bytes: usize,
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A rate of 0 disables limiting.
    pub fn new(rate_bytes_per_sec: usize, burst_bytes: usize) -> RateLimiter {
        RateLimiter {
            rate_bytes_per_sec,
            burst_bytes,
            available: burst_bytes as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn unlimited() -> RateLimiter {
        RateLimiter::new(0, 0)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available =
            (self.available + elapsed * self.rate_bytes_per_sec as f64).min(self.burst_bytes as f64);
    }

    /// Takes `bytes` tokens from the bucket, sleeping until the bucket can cover them.
    pub fn acquire(&mut self, bytes: usize) {
        if self.rate_bytes_per_sec == 0 {
            return;
        }
        self.refill();
        let bytes = bytes as f64;
        if bytes <= self.available {
            self.available -= bytes;
            return;
        }
        let deficit = bytes - self.available;
        self.available = 0.0;
        thread::sleep(Duration::from_secs_f64(deficit / self.rate_bytes_per_sec as f64));
    }
}
