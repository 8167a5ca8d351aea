//! Reconnection policy and exponential backoff
//!
//! - Delay starts at `initial_delay_ms` and grows by `multiplier` per attempt
//! - Capped at `max_delay_ms`
//! - ±25% jitter so several clients don't hammer a device in lockstep

use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

/// When and how often to reopen a lost connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a transport failure
    #[serde(default)]
    pub enabled: bool,
    /// Give up after this many failed attempts (0 = never give up)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff multiplier applied after each failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
    /// Delay before the first attempt
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Upper bound for the delay between attempts
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    0
}

fn default_multiplier() -> f32 {
    2.0
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    5000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            multiplier: default_multiplier(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect with the default backoff
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = saturating_millis(initial);
        self.max_delay_ms = saturating_millis(max);
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            current: Duration::from_millis(self.initial_delay_ms),
        }
    }
}

/// Delay sequence for one reconnection episode
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    /// Number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts != 0 && self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;

        let delay = apply_jitter(self.current);
        let max_delay = Duration::from_millis(self.policy.max_delay_ms);
        // NaN, infinite or overflowing products land on the cap
        let multiplier = f64::from(self.policy.multiplier.max(1.0));
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * multiplier).unwrap_or(max_delay);
        self.current = next.min(max_delay);

        Some(delay.min(max_delay))
    }
}

/// Apply ±25% jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let random_factor = (hash % 1000) as f64 / 1000.0;
    Duration::try_from_secs_f64(delay.as_secs_f64() * (0.75 + random_factor * 0.5)).unwrap_or(delay)
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
