//! Bounded exponential backoff.
//!
//! Used by the agent's reconnect loop: delays grow geometrically from the
//! configured base up to a cap, with a little jitter so a fleet of agents
//! does not reconnect in lockstep.

use std::time::Duration;

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay for a 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64) as u64;

        let with_jitter = if self.jitter {
            capped + rand_jitter(capped / 4)
        } else {
            capped
        };
        Duration::from_millis(with_jitter)
    }
}

/// Simple pseudo-random jitter (avoids a rand dependency).
fn rand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % max
}
