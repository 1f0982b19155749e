//! Circuit breaker guarding the recovery table.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation
    Closed = 0,
    /// Rejecting recovery attempts
    Open = 1,
    /// Cooldown elapsed, next attempt is a probe
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Opens after `failure_threshold` consecutive total failures and probes
/// again once `cooldown` has passed.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    failure_count: AtomicU32,
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            failure_count: AtomicU32::new(0),
            state: AtomicU8::new(CircuitState::Closed as u8),
            opened_at: Mutex::new(None),
        }
    }

    /// Whether an attempt may proceed. An open breaker whose cooldown has
    /// elapsed moves to half-open and allows it.
    pub fn is_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Release);
                    info!("Circuit breaker half-open, probing recovery");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if self.state() != CircuitState::Closed {
            info!("Circuit breaker closed after successful recovery");
        }
        self.failure_count.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.opened_at.lock().take();
    }

    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        let state = self.state();

        if state == CircuitState::HalfOpen {
            self.open();
            warn!("Circuit breaker reopened (probe failed)");
        } else if state == CircuitState::Closed && count >= self.failure_threshold {
            self.open();
            warn!(failures = count, "Circuit breaker opened");
        }
    }

    fn open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.lock() = Some(Instant::now());
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.opened_at.lock().take();
    }
}
