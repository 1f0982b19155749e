//! Recovery coordinator over the standard strategy table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use waav_voice_session::core::recovery::{
    CircuitState, ErrorRecoveryCoordinator, RecoveryActions, RecoveryConfig, RecoveryEvent,
    RecoveryStrategy,
};
use waav_voice_session::errors::{ClassifiedError, ErrorKind, VoiceError, VoiceResult};

/// Counts every action; each one fails unless enabled.
#[derive(Default)]
struct ScriptedActions {
    reconnect_ok: AtomicBool,
    refresh_ok: AtomicBool,
    audio_ok: AtomicBool,
    downgrade_ok: AtomicBool,
    reset_ok: AtomicBool,

    reconnects: AtomicU32,
    refreshes: AtomicU32,
    audio_restarts: AtomicU32,
    downgrades: AtomicU32,
    resets: AtomicU32,
    fallbacks: AtomicU32,
}

fn outcome(ok: &AtomicBool, calls: &AtomicU32) -> VoiceResult<()> {
    calls.fetch_add(1, Ordering::SeqCst);
    if ok.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(VoiceError::Network("still down".to_string()))
    }
}

#[async_trait]
impl RecoveryActions for ScriptedActions {
    async fn reconnect(&self) -> VoiceResult<()> {
        outcome(&self.reconnect_ok, &self.reconnects)
    }

    async fn refresh_token(&self) -> VoiceResult<()> {
        outcome(&self.refresh_ok, &self.refreshes)
    }

    async fn restart_audio(&self) -> VoiceResult<()> {
        outcome(&self.audio_ok, &self.audio_restarts)
    }

    async fn downgrade_quality(&self) -> VoiceResult<()> {
        outcome(&self.downgrade_ok, &self.downgrades)
    }

    async fn full_reset(&self) -> VoiceResult<()> {
        outcome(&self.reset_ok, &self.resets)
    }

    async fn activate_fallback_mode(&self) {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
    }
}

fn coordinator(actions: &Arc<ScriptedActions>) -> ErrorRecoveryCoordinator {
    ErrorRecoveryCoordinator::new(RecoveryConfig::default(), actions.clone())
}

fn error(kind: ErrorKind) -> ClassifiedError {
    ClassifiedError::new(kind, "injected")
}

#[test]
fn test_standard_table_order() {
    let actions = Arc::new(ScriptedActions::default());
    assert_eq!(
        coordinator(&actions).strategy_names(),
        vec![
            "reconnect",
            "token_refresh",
            "audio_restart",
            "quality_downgrade",
            "full_reset",
            "fallback_mode"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_error_recovered_by_reconnect() {
    let actions = Arc::new(ScriptedActions::default());
    actions.reconnect_ok.store(true, Ordering::SeqCst);
    let coordinator = coordinator(&actions);

    assert!(coordinator.handle_error(error(ErrorKind::ConnectionFailed)).await);

    assert_eq!(actions.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(actions.resets.load(Ordering::SeqCst), 0);
    let history = coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].strategy_name, "reconnect");
    assert!(history[0].successful);
}

#[tokio::test(start_paused = true)]
async fn test_network_error_falls_through_to_downgrade() {
    let actions = Arc::new(ScriptedActions::default());
    actions.downgrade_ok.store(true, Ordering::SeqCst);
    let coordinator = coordinator(&actions);
    let mut events = coordinator.subscribe();

    let started = tokio::time::Instant::now();
    assert!(coordinator.handle_error(error(ErrorKind::NetworkError)).await);

    // Three reconnect attempts with 1s then 2s between them
    assert_eq!(actions.reconnects.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(actions.downgrades.load(Ordering::SeqCst), 1);
    assert_eq!(actions.refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(actions.audio_restarts.load(Ordering::SeqCst), 0);

    let history = coordinator.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].strategy_name, "reconnect");
    assert!(!history[0].successful);
    assert_eq!(history[0].attempt, 3);
    assert_eq!(history[1].strategy_name, "quality_downgrade");
    assert!(history[1].successful);
    assert_eq!(history[1].total_attempts, 4);

    let mut recovered = None;
    while let Ok(event) = events.try_recv() {
        if let RecoveryEvent::Recovered {
            strategy,
            total_attempts,
        } = event
        {
            recovered = Some((strategy, total_attempts));
        }
    }
    assert_eq!(recovered, Some(("quality_downgrade".to_string(), 4)));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_table_ends_in_fallback_mode() {
    let actions = Arc::new(ScriptedActions::default());
    let coordinator = coordinator(&actions);

    assert!(coordinator.handle_error(error(ErrorKind::TokenExpired)).await);

    assert_eq!(actions.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(actions.resets.load(Ordering::SeqCst), 1);
    assert_eq!(actions.fallbacks.load(Ordering::SeqCst), 1);
    assert_eq!(actions.reconnects.load(Ordering::SeqCst), 0);

    let names: Vec<_> = coordinator
        .history()
        .into_iter()
        .map(|s| (s.strategy_name, s.successful))
        .collect();
    assert_eq!(
        names,
        vec![
            ("token_refresh".to_string(), false),
            ("full_reset".to_string(), false),
            ("fallback_mode".to_string(), true),
        ]
    );
    assert_eq!(coordinator.circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_audio_error_restarts_audio() {
    let actions = Arc::new(ScriptedActions::default());
    actions.audio_ok.store(true, Ordering::SeqCst);
    let coordinator = coordinator(&actions);

    assert!(coordinator.handle_error(error(ErrorKind::AudioDeviceError)).await);
    assert_eq!(actions.audio_restarts.load(Ordering::SeqCst), 1);
    assert_eq!(actions.reconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_recoverable_error_runs_nothing() {
    let actions = Arc::new(ScriptedActions::default());
    let coordinator = coordinator(&actions);

    let denied = error(ErrorKind::MicrophonePermissionDenied);
    assert!(!denied.recoverable);
    assert!(!coordinator.handle_error(denied).await);

    assert_eq!(actions.fallbacks.load(Ordering::SeqCst), 0);
    assert!(coordinator.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_error_during_recovery_is_ignored() {
    let actions = Arc::new(ScriptedActions::default());
    actions.downgrade_ok.store(true, Ordering::SeqCst);
    let coordinator = Arc::new(coordinator(&actions));

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.handle_error(error(ErrorKind::NetworkError)).await })
    };
    // Let the first run reach its first backoff sleep
    tokio::task::yield_now().await;
    assert!(coordinator.is_recovering());

    assert!(!coordinator.handle_error(error(ErrorKind::NetworkError)).await);
    assert!(first.await.unwrap());
    assert!(!coordinator.is_recovering());
    assert_eq!(actions.downgrades.load(Ordering::SeqCst), 1);
}

fn always_failing(calls: Arc<AtomicU32>) -> RecoveryStrategy {
    RecoveryStrategy::new("failing", 1, Duration::ZERO, |_| true, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { false }.boxed()
    })
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_opens_and_recovers() {
    let calls = Arc::new(AtomicU32::new(0));
    let coordinator = ErrorRecoveryCoordinator::with_strategies(
        RecoveryConfig {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            history_limit: 50,
        },
        vec![always_failing(calls.clone())],
    );
    let mut events = coordinator.subscribe();

    for _ in 0..3 {
        assert!(!coordinator.handle_error(error(ErrorKind::NetworkError)).await);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.circuit_state(), CircuitState::Open);

    let mut opened = false;
    while let Ok(event) = events.try_recv() {
        opened |= matches!(event, RecoveryEvent::CircuitOpened);
    }
    assert!(opened);

    // Open: no strategy runs
    assert!(!coordinator.handle_error(error(ErrorKind::NetworkError)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // After the cooldown one trial run is allowed
    tokio::time::advance(Duration::from_secs(61)).await;
    coordinator.set_strategies(vec![RecoveryStrategy::new(
        "succeeding",
        1,
        Duration::ZERO,
        |_| true,
        |_| async { true }.boxed(),
    )]);
    assert!(coordinator.handle_error(error(ErrorKind::NetworkError)).await);
    assert_eq!(coordinator.circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_history_and_breaker() {
    let calls = Arc::new(AtomicU32::new(0));
    let coordinator = ErrorRecoveryCoordinator::with_strategies(
        RecoveryConfig {
            failure_threshold: 1,
            ..Default::default()
        },
        vec![always_failing(calls.clone())],
    );

    assert!(!coordinator.handle_error(error(ErrorKind::NetworkError)).await);
    assert_eq!(coordinator.circuit_state(), CircuitState::Open);

    coordinator.reset();
    assert_eq!(coordinator.circuit_state(), CircuitState::Closed);
    assert!(coordinator.history().is_empty());
}
