//! Event dispatch.
//!
//! One task consumes every component's events. Protocol events are handled
//! in arrival order, one at a time.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::events::OrchestratorEvent;
use super::spoken::PENDING_RESPONSE_ID;
use super::voice_session::Inner;
use crate::core::audio::{AudioAdaptation, AudioEvent};
use crate::core::connection::{ConnectionEvent, ConnectionState};
use crate::core::network::{AdaptiveSettings, NetworkEvent, QualityCategory, adaptive_settings};
use crate::core::protocol::{ApiError, ClientEvent, ConversationItem, ServerEvent, SessionConfig};
use crate::core::session::{ConversationMessage, ConversationState, MessageRole};
use crate::core::timeout::TimeoutEvent;
use crate::errors::{ClassifiedError, ErrorKind};

/// Server error codes meaning the ephemeral token is no longer usable.
const TOKEN_ERROR_CODES: &[&str] = &["session_expired", "invalid_token", "token_expired"];

const CANCEL_NOT_ACTIVE_CODE: &str = "response_cancel_not_active";

/// Output sent for a function call that arrives without a tool name.
const UNNAMED_CALL_OUTPUT: &str = "The requested tool could not be identified.";

/// Audio parameters for an adaptive preset.
pub(super) fn adaptation_for(settings: &AdaptiveSettings) -> AudioAdaptation {
    AudioAdaptation {
        sample_rate: settings.sample_rate,
        frame_size: settings.buffer_size,
        echo_cancellation: settings.echo_cancellation,
        noise_suppression: settings.noise_suppression,
        auto_gain_control: settings.auto_gain_control,
    }
}

fn message_role(item: &ConversationItem) -> Option<MessageRole> {
    match item.role.as_deref() {
        Some("user") => Some(MessageRole::User),
        Some("assistant") => Some(MessageRole::Assistant),
        _ => None,
    }
}

impl Inner {
    pub(super) fn start_dispatch(self: &Arc<Self>) {
        let mut task = self.dispatch_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let mut connection_rx = self.connection.subscribe();
        let mut audio_rx = self.audio.subscribe();
        let mut network_rx = self.network.subscribe();
        let mut timeout_rx = self.timeout.subscribe();
        let weak = Arc::downgrade(self);

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = connection_rx.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_connection_event(event).await;
                    }
                    Some(event) = audio_rx.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_audio_event(event);
                    }
                    Some(event) = network_rx.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_network_event(event);
                    }
                    Some(event) = timeout_rx.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_timeout_event(event);
                    }
                    else => break,
                }
            }
            debug!("Dispatch loop exited");
        }));
    }

    async fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                let previous = *self.connection_state.read();
                self.set_connection_state(state);
                match state {
                    ConnectionState::Connected => self.on_connected(previous).await,
                    ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                        self.network.stop_monitoring();
                    }
                    // Failure is reported by the accompanying error event
                    ConnectionState::Failed => self.network.stop_monitoring(),
                    ConnectionState::Connecting => {}
                }
            }
            ConnectionEvent::RemoteStream(stream) => {
                self.events.emit(OrchestratorEvent::RemoteAudio(stream));
            }
            ConnectionEvent::DataChannelOpen => debug!("Data channel ready"),
            ConnectionEvent::DataChannelClosed => debug!("Data channel closed"),
            ConnectionEvent::Message(event) => {
                self.metrics.record_event_received();
                self.handle_server_event(event).await;
            }
            ConnectionEvent::Error(error) => self.report_error(error),
            ConnectionEvent::ReconnectAttempt { attempt, delay_ms } => {
                debug!(attempt, delay_ms, "Transport reconnect scheduled");
                self.events.emit(OrchestratorEvent::Reconnecting { attempt });
            }
            ConnectionEvent::MaxReconnectAttemptsReached { attempts } => {
                self.report_error(ClassifiedError::new(
                    ErrorKind::ConnectionFailed,
                    format!("connection lost after {attempts} reconnect attempts"),
                ));
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, previous: ConnectionState) {
        if let Some(peer) = self.connection.peer_connection() {
            self.network.start_monitoring(peer);
        }

        let paused = self.paused.load(Ordering::SeqCst);
        if !paused && self.audio.stream().is_some() && !self.audio.is_recording() {
            if let Err(e) = self.audio.start_recording().await {
                self.report_error(e.classify());
            }
        }

        if previous == ConnectionState::Reconnecting {
            self.metrics.record_reconnect();
            if let Err(e) = self
                .store
                .call(|s| async move { s.increment_reconnect_count().await })
                .await
            {
                debug!(error = %e, "Reconnect count not persisted");
            }
        }
        if !paused {
            self.set_conversation_state(ConversationState::Listening);
        }
    }

    fn on_audio_event(self: &Arc<Self>, event: AudioEvent) {
        let mapped = match event {
            AudioEvent::VoiceActivity { active, .. } => OrchestratorEvent::VoiceActivity { active },
            AudioEvent::QualityReport(report) => OrchestratorEvent::AudioQuality(report),
            AudioEvent::RecordingStarted => OrchestratorEvent::RecordingStarted,
            AudioEvent::RecordingStopped => OrchestratorEvent::RecordingStopped,
            AudioEvent::PlaybackStarted { .. } => OrchestratorEvent::PlaybackStarted,
            AudioEvent::PlaybackFinished { .. } | AudioEvent::PlaybackInterrupted => {
                OrchestratorEvent::PlaybackStopped
            }
            AudioEvent::ContextRecreated => {
                debug!("Audio context recreated");
                return;
            }
            AudioEvent::Error(error) => {
                self.report_error(error);
                return;
            }
        };
        self.events.emit(mapped);
    }

    fn on_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::QualityUpdated(quality) => {
                self.events
                    .emit(OrchestratorEvent::NetworkQualityChanged(quality));
            }
            NetworkEvent::CategoryChanged { previous, current } => {
                info!(%previous, %current, "Network quality category changed");
            }
            NetworkEvent::Degradation { current, baseline } => {
                warn!(
                    score = current.score,
                    baseline = baseline.score,
                    category = %current.category,
                    "Network degradation, adapting audio"
                );
                self.apply_quality(current.category);
            }
        }
    }

    fn on_timeout_event(self: &Arc<Self>, event: TimeoutEvent) {
        match event {
            TimeoutEvent::Warning { remaining_minutes } => {
                info!(remaining_minutes, "Session approaching maximum duration");
                self.events
                    .emit(OrchestratorEvent::SessionTimeoutWarning { remaining_minutes });
            }
            TimeoutEvent::Timeout => {
                tokio::spawn(self.clone().handle_session_timeout());
            }
        }
    }

    /// Adapt audio processing to a quality band.
    pub(super) fn apply_quality(&self, category: QualityCategory) {
        *self.adaptation.write() = category;
        let settings = adaptive_settings(category);
        debug!(%category, ?settings, "Applying adaptive audio settings");
        self.audio.apply_adaptation(adaptation_for(&settings));
    }

    /// Interpret one protocol event.
    pub(super) async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Error { error } => self.on_server_error(error),

            ServerEvent::SessionCreated { session } => {
                info!(server_session = ?session.id, model = ?session.model, "Session created");
                self.timeout.reset_session();
                self.reinject_history();
            }
            ServerEvent::SessionUpdated { .. } => debug!("Session configuration applied"),

            ServerEvent::ConversationItemCreated { item, .. } => {
                self.on_item_created(item).await;
            }
            ServerEvent::OutputItemAdded { item, .. } => {
                if item.is_function_call() {
                    self.register_function_call(&item);
                }
            }
            ServerEvent::OutputItemDone { .. } => {}

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => {
                let text = transcript.trim().to_string();
                if text.is_empty() {
                    return;
                }
                if self
                    .persist_message(MessageRole::User, text.clone(), item_id.as_deref())
                    .await
                {
                    self.events.emit(OrchestratorEvent::UserTranscript {
                        text,
                        is_final: true,
                    });
                }
            }
            ServerEvent::TranscriptionFailed { item_id, error } => {
                warn!(item_id = ?item_id, error = %error.message, "Input transcription failed");
            }

            ServerEvent::SpeechStarted { .. } => {
                let state = *self.conversation_state.read();
                if state == ConversationState::Speaking {
                    info!("User barged in");
                    self.set_conversation_state(ConversationState::Interrupted);
                    if let Err(e) = self.audio.interrupt_playback().await {
                        warn!(error = %e, "Failed to interrupt local playback");
                    }
                } else {
                    self.set_conversation_state(ConversationState::Listening);
                }
            }
            ServerEvent::SpeechStopped { .. } => {
                self.set_conversation_state(ConversationState::Processing);
            }
            ServerEvent::InputAudioBufferCommitted { item_id } => {
                debug!(item_id = ?item_id, "Input audio committed");
            }
            ServerEvent::InputAudioBufferCleared => {}

            ServerEvent::ResponseCreated { response } => {
                let id = response
                    .id
                    .unwrap_or_else(|| PENDING_RESPONSE_ID.to_string());
                debug!(response_id = %id, "Response started");
                self.spoken.set_active_response(Some(id));
            }
            ServerEvent::ResponseDone { response } => {
                let status = response.status.as_deref().unwrap_or("completed");
                if status == "failed" {
                    warn!(response_id = ?response.id, details = ?response.status_details, "Response failed");
                } else {
                    debug!(response_id = ?response.id, status, "Response done");
                }
                self.spoken.take_active_response();
                self.assistant_text.lock().clear();
                self.assistant_transcript.lock().clear();
                if *self.conversation_state.read() != ConversationState::Speaking {
                    self.set_conversation_state(ConversationState::Idle);
                }
            }

            ServerEvent::TextDelta { delta, .. } => {
                let text = {
                    let mut buffer = self.assistant_text.lock();
                    buffer.push_str(&delta);
                    buffer.clone()
                };
                self.events.emit(OrchestratorEvent::AssistantText {
                    text,
                    is_final: false,
                });
            }
            ServerEvent::TextDone { item_id, text, .. } => {
                let buffered = std::mem::take(&mut *self.assistant_text.lock());
                let text = if text.is_empty() { buffered } else { text };
                self.finish_assistant_output(text, item_id, false).await;
            }
            ServerEvent::AudioTranscriptDelta { delta, .. } => {
                let text = {
                    let mut buffer = self.assistant_transcript.lock();
                    buffer.push_str(&delta);
                    buffer.clone()
                };
                self.events.emit(OrchestratorEvent::AssistantTranscript {
                    text,
                    is_final: false,
                });
            }
            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript,
                ..
            } => {
                let buffered = std::mem::take(&mut *self.assistant_transcript.lock());
                let text = if transcript.is_empty() {
                    buffered
                } else {
                    transcript
                };
                self.finish_assistant_output(text, item_id, true).await;
            }

            ServerEvent::OutputAudioBufferStarted { .. } => {
                self.set_conversation_state(ConversationState::Speaking);
                self.events.emit(OrchestratorEvent::PlaybackStarted);
            }
            ServerEvent::OutputAudioBufferStopped { .. }
            | ServerEvent::OutputAudioBufferCleared { .. } => {
                if *self.conversation_state.read() == ConversationState::Speaking {
                    self.set_conversation_state(ConversationState::Idle);
                }
                self.events.emit(OrchestratorEvent::PlaybackStopped);
            }

            ServerEvent::FunctionCallArgumentsDelta { call_id, delta, .. } => {
                self.pending_calls
                    .lock()
                    .entry(call_id)
                    .or_default()
                    .arguments
                    .push_str(&delta);
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
                ..
            } => {
                let pending = self.pending_calls.lock().remove(&call_id).unwrap_or_default();
                let Some(name) = name.or(pending.name) else {
                    warn!(call_id = %call_id, "Function call without a name");
                    self.answer_function_call(&call_id, UNNAMED_CALL_OUTPUT.to_string());
                    return;
                };
                let arguments = if arguments.is_empty() {
                    pending.arguments
                } else {
                    arguments
                };
                self.spawn_tool_call(call_id, name, arguments);
            }

            ServerEvent::RateLimitsUpdated { rate_limits } => {
                let remaining_tokens = rate_limits.as_ref().and_then(|r| r.remaining_tokens());
                info!(remaining_tokens = ?remaining_tokens, "Rate limits updated");
                self.events
                    .emit(OrchestratorEvent::RateLimits { remaining_tokens });
            }

            ServerEvent::Unknown => debug!("Ignoring unhandled server event"),
        }
    }

    fn on_server_error(self: &Arc<Self>, error: ApiError) {
        if self.timeout.handle_timeout_error(&error.message) {
            return;
        }
        let code = error.code.as_deref().unwrap_or_default();
        if code == CANCEL_NOT_ACTIVE_CODE {
            debug!("No response to cancel");
            self.spoken.take_active_response();
            return;
        }

        let details = serde_json::to_value(&error).ok();
        let classified = if TOKEN_ERROR_CODES.contains(&code) {
            ClassifiedError::new(ErrorKind::TokenExpired, error.message.clone())
                .with_recoverable(true)
        } else {
            ClassifiedError::new(ErrorKind::ApiError, error.message.clone())
        };
        let classified = match details {
            Some(details) => classified.with_details(details),
            None => classified,
        };
        self.report_error(classified);
    }

    /// Replay the rolling context as instructions after a reconnect.
    fn reinject_history(&self) {
        if !self.history_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        let base = self.config.session.instructions.as_deref().unwrap_or_default();
        let instructions = {
            let context = self.context.lock();
            if context.is_empty() {
                return;
            }
            info!(messages = context.len(), "Reinjecting conversation history");
            context.augmented_instructions(base)
        };
        self.send(&ClientEvent::session_update(SessionConfig::instructions_only(
            instructions,
        )));
    }

    async fn on_item_created(self: &Arc<Self>, item: ConversationItem) {
        if item.is_function_call() {
            self.register_function_call(&item);
            return;
        }
        if !item.is_message() {
            return;
        }
        let Some(role) = message_role(&item) else {
            return;
        };
        let Some(text) = item.extract_text() else {
            debug!(item_id = ?item.id, "Message item without text yet");
            return;
        };

        let persisted = self
            .persist_message(role, text.clone(), item.id.as_deref())
            .await;
        if persisted && role == MessageRole::User {
            self.events.emit(OrchestratorEvent::UserTranscript {
                text,
                is_final: true,
            });
        }
    }

    fn register_function_call(&self, item: &ConversationItem) {
        let Some(call_id) = item.call_id.clone() else {
            return;
        };
        debug!(call_id = %call_id, name = ?item.name, "Function call started");
        let mut calls = self.pending_calls.lock();
        let entry = calls.entry(call_id).or_default();
        if item.name.is_some() {
            entry.name = item.name.clone();
        }
    }

    async fn finish_assistant_output(&self, text: String, item_id: Option<String>, spoken: bool) {
        if spoken {
            self.events.emit(OrchestratorEvent::AssistantTranscript {
                text: text.clone(),
                is_final: true,
            });
        } else {
            self.events.emit(OrchestratorEvent::AssistantText {
                text: text.clone(),
                is_final: true,
            });
        }
        if !text.trim().is_empty() {
            self.persist_message(MessageRole::Assistant, text, item_id.as_deref())
                .await;
        }
    }

    /// Run a tool and answer the call. Always answers, even for unknown
    /// tools, so the model never waits on a missing output.
    fn spawn_tool_call(self: &Arc<Self>, call_id: String, name: String, arguments: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.metrics.record_tool_call();
            inner.events.emit(OrchestratorEvent::FunctionCallStarted {
                call_id: call_id.clone(),
                name: name.clone(),
            });

            let output = match inner.tools.get(&name) {
                Some(tool) => {
                    let args: Value = serde_json::from_str(&arguments).unwrap_or_else(|e| {
                        warn!(call_id = %call_id, error = %e, "Malformed function arguments");
                        Value::Object(Default::default())
                    });
                    let context: Vec<ConversationMessage> =
                        inner.context.lock().messages().cloned().collect();
                    tool.execute(&args, &context).await
                }
                None => {
                    warn!(name = %name, "Model called an unregistered tool");
                    format!("The tool \"{name}\" is not available.")
                }
            };

            inner.answer_function_call(&call_id, output);
            inner
                .events
                .emit(OrchestratorEvent::FunctionCallCompleted { call_id, name });
        });
    }

    /// Send the call's output, then ask for the follow-up response.
    fn answer_function_call(&self, call_id: &str, output: String) {
        let answered = self.send(&ClientEvent::item_create(
            ConversationItem::function_call_output(call_id.to_string(), output),
        ));
        if answered {
            self.send(&ClientEvent::response_create());
        } else {
            warn!(call_id = %call_id, "Function call output not delivered");
        }
    }
}
