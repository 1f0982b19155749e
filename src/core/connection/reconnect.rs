//! Reconnection backoff policy.

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for transport reconnects.
///
/// The delay before attempt `n` (1-based) is
/// `initial_delay_ms * backoff_multiplier^(n-1)`, capped at `max_delay_ms`,
/// optionally spread by up to 25% either way. `max_attempts` is always a hard
/// cap; turn reconnection off with `enabled = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f32,
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.max_attempts == 0 {
            return Err(
                "reconnection max_attempts must be at least 1 (set enabled: false to turn reconnection off)"
                    .to_string(),
            );
        }
        if self.backoff_multiplier < 1.0 {
            return Err("reconnection backoff_multiplier must be at least 1.0".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("reconnection initial_delay_ms exceeds max_delay_ms".to_string());
        }
        Ok(())
    }

    fn nominal_delay(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * (self.backoff_multiplier as f64).powi(exponent);
        delay.min(self.max_delay_ms as f64)
    }

    /// Milliseconds to wait before attempt `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let delay = self.nominal_delay(attempt);
        if !self.jitter {
            return delay as u64;
        }
        let spread = delay * 0.25 * (unit_random() * 2.0 - 1.0);
        (delay + spread).max(0.0) as u64
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.enabled && attempts_made < self.max_attempts
    }
}

/// Uniform value in `0.0..1.0` drawn from a v4 UUID's random bits.
fn unit_random() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u64;
    (bits >> 11) as f64 / (1u64 << 53) as f64
}
