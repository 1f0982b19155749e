//! Milestones of a session against the service's maximum duration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimeoutConfig {
    pub max_session_duration_ms: u64,
    /// Remaining minutes at which a warning fires, in any order
    pub warning_minutes: Vec<u32>,
    /// Forced reconnect this long before the hard limit
    pub reconnect_buffer_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for SessionTimeoutConfig {
    fn default() -> Self {
        Self {
            max_session_duration_ms: 30 * 60 * 1000,
            warning_minutes: vec![5, 3, 1],
            reconnect_buffer_ms: 30_000,
            health_check_interval_ms: 60_000,
        }
    }
}

impl SessionTimeoutConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_session_duration_ms)
    }

    /// Elapsed time at which the forced reconnect fires.
    pub fn timeout_at(&self) -> Duration {
        self.max_duration()
            .saturating_sub(Duration::from_millis(self.reconnect_buffer_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Warning { remaining_minutes: u32 },
    Timeout,
}

/// Tracks which milestones already fired. Each fires at most once.
#[derive(Debug, Clone)]
pub struct TimeoutSchedule {
    /// (elapsed deadline, remaining minutes, fired), earliest first
    warnings: Vec<(Duration, u32, bool)>,
    timeout_at: Duration,
    timeout_fired: bool,
}

impl TimeoutSchedule {
    pub fn new(config: &SessionTimeoutConfig) -> Self {
        let max = config.max_duration();
        let timeout_at = config.timeout_at();
        let mut warnings: Vec<_> = config
            .warning_minutes
            .iter()
            .map(|&m| {
                let at = max.saturating_sub(Duration::from_secs(m as u64 * 60));
                (at, m, false)
            })
            .filter(|(at, _, _)| *at < timeout_at)
            .collect();
        warnings.sort_by_key(|(at, _, _)| *at);
        Self {
            warnings,
            timeout_at,
            timeout_fired: false,
        }
    }

    /// Milestones that became due at `elapsed`, in firing order.
    pub fn due(&mut self, elapsed: Duration) -> Vec<Milestone> {
        let mut due = Vec::new();
        if self.timeout_fired {
            return due;
        }
        for (at, minutes, fired) in self.warnings.iter_mut() {
            if !*fired && elapsed >= *at {
                *fired = true;
                due.push(Milestone::Warning {
                    remaining_minutes: *minutes,
                });
            }
        }
        if elapsed >= self.timeout_at {
            self.timeout_fired = true;
            due.push(Milestone::Timeout);
        }
        due
    }

    /// Elapsed time of the next unfired milestone.
    pub fn next_deadline(&self) -> Option<Duration> {
        if self.timeout_fired {
            return None;
        }
        self.warnings
            .iter()
            .find(|(_, _, fired)| !fired)
            .map(|(at, _, _)| *at)
            .or(Some(self.timeout_at))
    }

    /// Mark the timeout as fired without a scheduled deadline.
    pub fn force_timeout(&mut self) -> bool {
        !std::mem::replace(&mut self.timeout_fired, true)
    }

    pub fn timed_out(&self) -> bool {
        self.timeout_fired
    }

    /// Remaining minutes of the last warning that fired.
    pub fn last_warning(&self) -> Option<u32> {
        self.warnings
            .iter()
            .filter(|(_, _, fired)| *fired)
            .map(|(_, m, _)| *m)
            .last()
    }
}
