//! Error recovery: strategy table, circuit breaker and coordinator.

pub mod circuit_breaker;
pub mod coordinator;
pub mod strategy;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use coordinator::{ErrorRecoveryCoordinator, RecoveryConfig, RecoveryEvent, RecoveryState};
pub use strategy::{
    RecoveryActions, RecoveryStrategy, StrategyExecutor, StrategyPredicate, default_strategies,
};
