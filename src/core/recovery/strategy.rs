//! Declarative recovery strategy table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::warn;

use crate::errors::{ClassifiedError, ErrorKind, VoiceResult};

pub type StrategyPredicate = Arc<dyn Fn(&ClassifiedError) -> bool + Send + Sync>;
pub type StrategyExecutor = Arc<dyn Fn(ClassifiedError) -> BoxFuture<'static, bool> + Send + Sync>;

/// One row of the recovery table.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub name: String,
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub base_delay: Duration,
    applies_to: StrategyPredicate,
    executor: StrategyExecutor,
}

impl RecoveryStrategy {
    pub fn new<P, F>(
        name: impl Into<String>,
        max_attempts: u32,
        base_delay: Duration,
        applies_to: P,
        executor: F,
    ) -> Self
    where
        P: Fn(&ClassifiedError) -> bool + Send + Sync + 'static,
        F: Fn(ClassifiedError) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            base_delay,
            applies_to: Arc::new(applies_to),
            executor: Arc::new(executor),
        }
    }

    pub fn applies_to(&self, error: &ClassifiedError) -> bool {
        (self.applies_to)(error)
    }

    pub async fn execute(&self, error: ClassifiedError) -> bool {
        (self.executor)(error).await
    }

    /// Delay before attempt `attempt` (1-based). The first attempt runs
    /// immediately.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor)
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .finish()
    }
}

/// Corrective actions the default strategies drive.
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    async fn reconnect(&self) -> VoiceResult<()>;

    async fn refresh_token(&self) -> VoiceResult<()>;

    /// Reacquire the microphone with fallback constraints.
    async fn restart_audio(&self) -> VoiceResult<()>;

    async fn downgrade_quality(&self) -> VoiceResult<()>;

    async fn full_reset(&self) -> VoiceResult<()>;

    /// Switch to reduced functionality. Cannot fail.
    async fn activate_fallback_mode(&self);
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Reconnect,
    RefreshToken,
    RestartAudio,
    DowngradeQuality,
    FullReset,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Action::Reconnect => "reconnect",
            Action::RefreshToken => "token_refresh",
            Action::RestartAudio => "audio_restart",
            Action::DowngradeQuality => "quality_downgrade",
            Action::FullReset => "full_reset",
        }
    }

    async fn perform(self, actions: &dyn RecoveryActions) -> VoiceResult<()> {
        match self {
            Action::Reconnect => actions.reconnect().await,
            Action::RefreshToken => actions.refresh_token().await,
            Action::RestartAudio => actions.restart_audio().await,
            Action::DowngradeQuality => actions.downgrade_quality().await,
            Action::FullReset => actions.full_reset().await,
        }
    }
}

fn run(actions: &Arc<dyn RecoveryActions>, action: Action) -> StrategyExecutor {
    let actions = actions.clone();
    Arc::new(move |_error: ClassifiedError| {
        let actions = actions.clone();
        async move {
            match action.perform(actions.as_ref()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(strategy = action.name(), error = %e, "Recovery action failed");
                    false
                }
            }
        }
        .boxed()
    })
}

fn from_parts(
    name: &'static str,
    max_attempts: u32,
    base_delay_ms: u64,
    applies_to: impl Fn(&ClassifiedError) -> bool + Send + Sync + 'static,
    executor: StrategyExecutor,
) -> RecoveryStrategy {
    RecoveryStrategy {
        name: name.to_string(),
        max_attempts,
        base_delay: Duration::from_millis(base_delay_ms),
        applies_to: Arc::new(applies_to),
        executor,
    }
}

/// The standard table, highest priority first:
/// reconnect, token refresh, audio restart, quality downgrade, full reset,
/// fallback mode.
pub fn default_strategies(actions: Arc<dyn RecoveryActions>) -> Vec<RecoveryStrategy> {
    let fallback_actions = actions.clone();
    vec![
        from_parts(
            "reconnect",
            3,
            1000,
            |e| e.kind.is_connection() || e.kind == ErrorKind::NetworkError,
            run(&actions, Action::Reconnect),
        ),
        from_parts(
            "token_refresh",
            2,
            500,
            |e| e.kind == ErrorKind::TokenExpired,
            run(&actions, Action::RefreshToken),
        ),
        from_parts(
            "audio_restart",
            2,
            1000,
            |e| e.kind.is_audio(),
            run(&actions, Action::RestartAudio),
        ),
        from_parts(
            "quality_downgrade",
            1,
            0,
            |e| e.kind == ErrorKind::NetworkError,
            run(&actions, Action::DowngradeQuality),
        ),
        from_parts(
            "full_reset",
            1,
            2000,
            |_| true,
            run(&actions, Action::FullReset),
        ),
        from_parts(
            "fallback_mode",
            1,
            0,
            |_| true,
            Arc::new(move |_error: ClassifiedError| {
                let actions = fallback_actions.clone();
                async move {
                    actions.activate_fallback_mode().await;
                    true
                }
                .boxed()
            }),
        ),
    ]
}
