use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{info, warn};

use super::events::OrchestratorEvent;
use super::voice_session::Inner;
use crate::core::audio::AudioConstraints;
use crate::core::protocol::{ClientEvent, SessionConfig};
use crate::core::recovery::RecoveryActions;
use crate::core::session::ConversationState;
use crate::errors::{VoiceError, VoiceResult};

/// Recovery actions performed on the orchestrator's components.
///
/// Holds a weak reference so the recovery coordinator, which the orchestrator
/// owns, does not keep it alive.
pub(super) struct OrchestratorRecoveryActions {
    inner: Weak<Inner>,
}

impl OrchestratorRecoveryActions {
    pub(super) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }

    fn upgrade(&self) -> VoiceResult<Arc<Inner>> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| VoiceError::Session("orchestrator dropped".to_string()))?;
        if inner.ended.load(Ordering::SeqCst) {
            return Err(VoiceError::Session("session ended".to_string()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl RecoveryActions for OrchestratorRecoveryActions {
    async fn reconnect(&self) -> VoiceResult<()> {
        let inner = self.upgrade()?;
        info!("Recovery: reconnecting");
        inner.connect_transport(true).await
    }

    async fn refresh_token(&self) -> VoiceResult<()> {
        let inner = self.upgrade()?;
        info!("Recovery: refreshing token");
        inner.refresh_token().await?;
        if !inner.connection.state().is_connected() {
            inner.connect_transport(true).await?;
        }
        Ok(())
    }

    async fn restart_audio(&self) -> VoiceResult<()> {
        let inner = self.upgrade()?;
        info!("Recovery: restarting audio with fallback constraints");
        let stream = inner
            .audio
            .restart(Some(AudioConstraints::fallback()))
            .await?;
        inner.connection.replace_local_stream(stream).await
    }

    async fn downgrade_quality(&self) -> VoiceResult<()> {
        let inner = self.upgrade()?;
        let current = *inner.adaptation.read();
        let target = current.degraded();
        info!(from = %current, to = %target, "Recovery: downgrading audio quality");
        inner.apply_quality(target);
        if inner.audio.stream().is_some() {
            let stream = inner.audio.restart(None).await?;
            inner.connection.replace_local_stream(stream).await?;
        }
        Ok(())
    }

    async fn full_reset(&self) -> VoiceResult<()> {
        let inner = self.upgrade()?;
        warn!("Recovery: full reset");
        inner.connection.disconnect().await;
        inner.network.stop_monitoring();
        inner.audio.stop_recording();
        inner.spoken.take_active_response();
        inner.pending_calls.lock().clear();

        if inner.audio.stream().is_none() {
            if let Err(e) = inner.audio.initialize_microphone(None).await {
                warn!(error = %e, "Microphone unavailable after reset");
            }
        }
        inner.refresh_token().await?;
        inner.connect_transport(true).await?;
        inner.set_conversation_state(ConversationState::Listening);
        Ok(())
    }

    async fn activate_fallback_mode(&self) {
        let Ok(inner) = self.upgrade() else {
            return;
        };
        if inner.fallback_mode.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Recovery exhausted, switching to text-only mode");
        inner.audio.stop_recording();
        inner.audio.set_muted(true);

        let text_only = SessionConfig {
            modalities: Some(vec!["text".to_string()]),
            ..Default::default()
        };
        inner.connection.update_session_config(inner.session_config());
        inner.send(&ClientEvent::session_update(text_only));
        inner.events.emit(OrchestratorEvent::FallbackModeActivated);
    }
}
