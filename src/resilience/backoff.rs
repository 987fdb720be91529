//! Reconnect backoff for one socket.

use std::time::Duration;

use rand::Rng;

/// Doubling delay between failed connect attempts.
///
/// The first reconnect after a healthy session is immediate; the socket only
/// consults the backoff when an attempt fails while it is already
/// reconnecting. Each delay carries up to 10% jitter so peers that lost the
/// same link do not retry in lockstep.
#[derive(Debug, Clone, Copy, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return how long to wait before the next:
    /// `initial_ms * 2^(attempt-1)`, capped at `max_ms`, plus jitter.
    pub fn next_delay(&mut self, initial_ms: u64, max_ms: u64) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let shift = (self.attempt - 1).min(63);
        let base = initial_ms
            .checked_shl(shift)
            .filter(|v| v >> shift == initial_ms)
            .unwrap_or(u64::MAX)
            .min(max_ms);
        let jitter = match base / 10 {
            0 => 0,
            spread => rand::thread_rng().gen_range(0..spread),
        };
        Duration::from_millis(base + jitter)
    }
}
