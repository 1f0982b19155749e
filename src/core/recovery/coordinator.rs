//! Tiered error recovery.
//!
//! Every strategy that applies to an error is tried in table order until one
//! succeeds. Each strategy retries up to its own bound with exponential
//! backoff. A recovery already in flight causes new errors to be ignored, and
//! a circuit breaker stops all attempts after repeated total failures.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::strategy::{RecoveryActions, RecoveryStrategy, default_strategies};
use crate::errors::{ClassifiedError, ErrorKind};
use crate::utils::{EventEmitter, now_ms};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive total failures before the breaker opens
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// Entries kept in the recovery history
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            history_limit: 50,
        }
    }
}

/// Outcome of one strategy run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    pub strategy_name: String,
    /// Attempts made by this strategy
    pub attempt: u32,
    pub max_attempts: u32,
    /// Attempts made across all strategies for this error so far
    pub total_attempts: u32,
    pub successful: bool,
    pub error_kind: ErrorKind,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    Started {
        kind: ErrorKind,
    },
    StrategyStarted {
        strategy: String,
    },
    AttemptFailed {
        strategy: String,
        attempt: u32,
    },
    Recovered {
        strategy: String,
        total_attempts: u32,
    },
    Exhausted {
        kind: ErrorKind,
        total_attempts: u32,
    },
    CircuitOpened,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ErrorRecoveryCoordinator {
    config: RecoveryConfig,
    strategies: RwLock<Arc<Vec<RecoveryStrategy>>>,
    breaker: CircuitBreaker,
    in_flight: AtomicBool,
    history: Mutex<VecDeque<RecoveryState>>,
    events: EventEmitter<RecoveryEvent>,
}

impl ErrorRecoveryCoordinator {
    /// Coordinator over the standard strategy table.
    pub fn new(config: RecoveryConfig, actions: Arc<dyn RecoveryActions>) -> Self {
        Self::with_strategies(config, default_strategies(actions))
    }

    pub fn with_strategies(config: RecoveryConfig, strategies: Vec<RecoveryStrategy>) -> Self {
        let breaker = CircuitBreaker::new(
            config.failure_threshold,
            Duration::from_millis(config.cooldown_ms),
        );
        Self {
            config,
            strategies: RwLock::new(Arc::new(strategies)),
            breaker,
            in_flight: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            events: EventEmitter::new(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Replace the strategy table.
    pub fn set_strategies(&self, strategies: Vec<RecoveryStrategy>) {
        *self.strategies.write() = Arc::new(strategies);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .read()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Attempt to recover from `error`. Returns whether a strategy succeeded.
    pub async fn handle_error(&self, error: ClassifiedError) -> bool {
        if !error.recoverable {
            debug!(kind = %error.kind, "Non-recoverable error, skipping recovery");
            return false;
        }

        if !self.breaker.is_allowed() {
            warn!(kind = %error.kind, "Circuit breaker open, recovery skipped");
            return false;
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(kind = %error.kind, "Recovery already in progress, ignoring error");
            return false;
        }
        let _guard = InFlightGuard(&self.in_flight);

        info!(kind = %error.kind, message = %error.message, "Starting error recovery");
        self.events.emit(RecoveryEvent::Started { kind: error.kind });

        let strategies = self.strategies.read().clone();
        let mut total_attempts = 0u32;

        for strategy in strategies.iter().filter(|s| s.applies_to(&error)) {
            self.events.emit(RecoveryEvent::StrategyStarted {
                strategy: strategy.name.clone(),
            });

            let mut attempts = 0u32;
            let mut succeeded = false;
            while attempts < strategy.max_attempts {
                attempts += 1;
                total_attempts += 1;

                let delay = strategy.delay_before(attempts);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                debug!(
                    strategy = %strategy.name,
                    attempt = attempts,
                    max_attempts = strategy.max_attempts,
                    "Executing recovery strategy"
                );
                if strategy.execute(error.clone()).await {
                    succeeded = true;
                    break;
                }

                self.events.emit(RecoveryEvent::AttemptFailed {
                    strategy: strategy.name.clone(),
                    attempt: attempts,
                });
            }

            self.push_history(RecoveryState {
                strategy_name: strategy.name.clone(),
                attempt: attempts,
                max_attempts: strategy.max_attempts,
                total_attempts,
                successful: succeeded,
                error_kind: error.kind,
                timestamp: now_ms(),
            });

            if succeeded {
                info!(
                    strategy = %strategy.name,
                    total_attempts,
                    "Recovery succeeded"
                );
                self.breaker.record_success();
                self.events.emit(RecoveryEvent::Recovered {
                    strategy: strategy.name.clone(),
                    total_attempts,
                });
                return true;
            }

            warn!(strategy = %strategy.name, attempts, "Recovery strategy exhausted");
        }

        error!(kind = %error.kind, total_attempts, "All recovery strategies failed");
        self.breaker.record_failure();
        self.events.emit(RecoveryEvent::Exhausted {
            kind: error.kind,
            total_attempts,
        });
        if self.breaker.state() == CircuitState::Open {
            self.events.emit(RecoveryEvent::CircuitOpened);
        }
        false
    }

    fn push_history(&self, state: RecoveryState) {
        let mut history = self.history.lock();
        history.push_back(state);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<RecoveryState> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn is_recovering(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Clear history and close the breaker.
    pub fn reset(&self) {
        self.history.lock().clear();
        self.breaker.reset();
    }
}
