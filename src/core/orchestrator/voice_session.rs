//! The voice session orchestrator.
//!
//! Owns session identity and the single writers of connection and
//! conversation state. Components below it only publish events, which a single
//! dispatch task consumes in arrival order (see `dispatch.rs`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{OrchestratorConfig, OrchestratorDeps};
use super::events::OrchestratorEvent;
use super::metrics::{MetricsSnapshot, SessionMetrics};
use super::recovery_actions::OrchestratorRecoveryActions;
use super::spoken::{PENDING_RESPONSE_ID, SpokenChannel};
use super::store_writer::StoreWriter;
use crate::core::audio::{AudioConstraints, AudioPipeline};
use crate::core::connection::{ConnectionManager, ConnectionState};
use crate::core::media::MediaStream;
use crate::core::network::{NetworkMonitor, QualityCategory};
use crate::core::protocol::{
    ClientEvent, ConversationItem, ResponseConfig, ServerEvent, SessionConfig,
};
use crate::core::recovery::{ErrorRecoveryCoordinator, RecoveryActions};
use crate::core::session::{
    ConversationContext, ConversationMessage, ConversationState, EphemeralToken, MessageRole,
    RestoreResult, TokenProvider,
};
use crate::core::timeout::SessionTimeoutCoordinator;
use crate::core::tools::ToolRegistry;
use crate::errors::{ClassifiedError, ErrorKind, VoiceError, VoiceResult};
use crate::utils::EventEmitter;

/// Streamed function-call arguments awaiting the `done` event.
#[derive(Debug, Default)]
pub(super) struct PendingFunctionCall {
    pub name: Option<String>,
    pub arguments: String,
}

/// Resets a flag when dropped.
pub(super) struct FlagGuard<'a>(pub &'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(super) struct Inner {
    pub config: OrchestratorConfig,
    pub token_provider: Arc<dyn TokenProvider>,
    /// Single ordered path to the session store
    pub store: StoreWriter,
    pub connection: ConnectionManager,
    pub audio: AudioPipeline,
    pub network: NetworkMonitor,
    pub timeout: SessionTimeoutCoordinator,
    pub recovery: Arc<ErrorRecoveryCoordinator>,
    pub tools: ToolRegistry,

    pub session_id: RwLock<Option<String>>,
    pub token: RwLock<Option<EphemeralToken>>,
    pub connection_state: RwLock<ConnectionState>,
    pub conversation_state: RwLock<ConversationState>,

    pub context: Mutex<ConversationContext>,
    pub persisted_items: Mutex<HashSet<String>>,
    pub pending_calls: Mutex<HashMap<String, PendingFunctionCall>>,
    pub assistant_transcript: Mutex<String>,
    pub assistant_text: Mutex<String>,
    /// History must be reinjected after the next `session.created`
    pub history_pending: AtomicBool,
    pub spoken: SpokenChannel,
    /// Quality band the audio settings were last adapted to
    pub adaptation: RwLock<QualityCategory>,

    pub initializing: AtomicBool,
    pub initialized: AtomicBool,
    pub ended: AtomicBool,
    pub fallback_mode: AtomicBool,
    pub timeout_reconnecting: AtomicBool,
    pub paused: AtomicBool,

    pub metrics: SessionMetrics,
    pub events: EventEmitter<OrchestratorEvent>,
    pub dispatch_task: Mutex<Option<JoinHandle<()>>>,
    pub refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// Coordinates connection, audio, monitoring, timeout and recovery for one
/// voice session.
#[derive(Clone)]
pub struct VoiceSessionOrchestrator {
    inner: Arc<Inner>,
}

impl VoiceSessionOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps) -> Self {
        let connection = ConnectionManager::new(
            deps.peer_factory,
            deps.signaler,
            config.connection.clone(),
        );
        let audio = AudioPipeline::new(deps.audio_backend, config.audio.clone());
        let network = NetworkMonitor::new(config.network.clone(), deps.network_info);
        let timeout = SessionTimeoutCoordinator::new(config.timeout.clone());
        let context = ConversationContext::new(config.context_window);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let actions: Arc<dyn RecoveryActions> =
                Arc::new(OrchestratorRecoveryActions::new(weak.clone()));
            let recovery = Arc::new(ErrorRecoveryCoordinator::new(
                config.recovery.clone(),
                actions,
            ));
            Inner {
                config,
                token_provider: deps.token_provider,
                store: StoreWriter::new(deps.session_store),
                connection,
                audio,
                network,
                timeout,
                recovery,
                tools: deps.tools,
                session_id: RwLock::new(None),
                token: RwLock::new(None),
                connection_state: RwLock::new(ConnectionState::Disconnected),
                conversation_state: RwLock::new(ConversationState::Idle),
                context: Mutex::new(context),
                persisted_items: Mutex::new(HashSet::new()),
                pending_calls: Mutex::new(HashMap::new()),
                assistant_transcript: Mutex::new(String::new()),
                assistant_text: Mutex::new(String::new()),
                history_pending: AtomicBool::new(false),
                spoken: SpokenChannel::new(),
                adaptation: RwLock::new(QualityCategory::Excellent),
                initializing: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                fallback_mode: AtomicBool::new(false),
                timeout_reconnecting: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                metrics: SessionMetrics::new(),
                events: EventEmitter::new(),
                dispatch_task: Mutex::new(None),
                refresh_task: Mutex::new(None),
            }
        });

        Self { inner }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Restore or create the session and connect.
    ///
    /// Concurrent or repeated calls are no-ops. Returns once the SDP
    /// handshake completed; `ConnectionStateChanged(Connected)` follows when
    /// the peer reports it.
    pub async fn initialize(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        if inner.initialized.load(Ordering::SeqCst) {
            debug!("Already initialized");
            return Ok(());
        }
        if inner.initializing.swap(true, Ordering::SeqCst) {
            debug!("Initialization already in progress");
            return Ok(());
        }
        let _guard = FlagGuard(&inner.initializing);
        inner.ended.store(false, Ordering::SeqCst);
        inner.start_dispatch();

        let token = match inner.restore_or_create().await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "Failed to obtain session token");
                inner.report_error(e.classify());
                return Err(e);
            }
        };
        inner.schedule_token_refresh(&token);

        let stream = inner.acquire_microphone().await;
        if stream.is_none() {
            warn!("Continuing without microphone (receive-only)");
        }

        let session_config = inner.session_config();
        if let Err(e) = inner
            .connection
            .connect(token, stream, Some(session_config))
            .await
        {
            error!(error = %e, "Initial connection failed");
            inner.report_error(e.classify());
            return Err(e);
        }

        inner.initialized.store(true, Ordering::SeqCst);
        info!(session_id = ?inner.session_id.read().as_deref(), "Voice session initialized");
        Ok(())
    }

    /// Send a typed user message and request a response. The message is
    /// persisted when the server echoes it back as `conversation.item.created`.
    pub async fn send_message(&self, text: &str) -> VoiceResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        if !inner.send(&ClientEvent::item_create(ConversationItem::user_text(text))) {
            return Err(VoiceError::NotConnected);
        }
        inner.send(&ClientEvent::response_create());
        inner.set_conversation_state(ConversationState::Processing);
        debug!(chars = text.len(), "User message sent");
        Ok(())
    }

    /// Open the microphone for the assistant.
    pub async fn start_listening(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        inner.audio.ensure_audio_context(true).await?;
        if inner.audio.stream().is_none() {
            let stream = inner
                .audio
                .initialize_microphone(None)
                .await
                .map_err(VoiceError::from)?;
            inner.connection.replace_local_stream(stream).await?;
        }
        inner.audio.set_muted(false);
        if !inner.audio.is_recording() {
            inner.audio.start_recording().await?;
        }
        inner.set_conversation_state(ConversationState::Listening);
        Ok(())
    }

    pub fn stop_listening(&self) {
        self.inner.audio.set_muted(true);
        self.inner.audio.stop_recording();
        self.inner.set_conversation_state(ConversationState::Idle);
    }

    /// Pause the conversation. Cancels the in-flight response only when
    /// there is one.
    pub async fn pause_session(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        inner.cancel_active_response();
        inner.audio.set_muted(true);
        inner.paused.store(true, Ordering::SeqCst);
        inner.set_conversation_state(ConversationState::Idle);
        info!("Session paused");
        Ok(())
    }

    pub async fn resume_session(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        if !inner.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match inner.audio.ensure_audio_context(true).await {
            Ok(_) => {}
            Err(e) => {
                let error = ClassifiedError::new(ErrorKind::SessionResumeFailed, e.to_string());
                inner.report_error(error);
                return Err(e.into());
            }
        }
        inner.audio.set_muted(false);
        inner.set_conversation_state(ConversationState::Listening);
        info!("Session resumed");
        Ok(())
    }

    /// Barge-in: stop the assistant mid-response.
    pub async fn interrupt(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        let cancelled = inner.cancel_active_response();
        if let Err(e) = inner.audio.interrupt_playback().await {
            warn!(error = %e, "Failed to interrupt local playback");
        }
        if cancelled {
            inner.set_conversation_state(ConversationState::Interrupted);
        }
        Ok(())
    }

    /// End the session: disconnect, release audio and mark the stored
    /// session ended.
    pub async fn end_session(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        inner.shutdown().await;
        if let Err(e) = inner.store.call(|s| async move { s.end_session().await }).await {
            let error = ClassifiedError::new(ErrorKind::SessionEndFailed, e.to_string());
            inner.events.emit(OrchestratorEvent::Error(error));
            return Err(e);
        }
        info!("Session ended");
        Ok(())
    }

    /// Tear everything down but keep the stored session resumable.
    pub async fn cleanup(&self) {
        self.inner.shutdown().await;
    }

    /// Run the proactive reconnect sequence now.
    pub async fn handle_session_timeout(&self) {
        self.inner.clone().handle_session_timeout().await;
    }

    /// Feed one protocol event through the dispatch table.
    pub async fn handle_realtime_event(&self, event: ServerEvent) {
        self.inner.handle_server_event(event).await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.read()
    }

    pub fn conversation_state(&self) -> ConversationState {
        *self.inner.conversation_state.read()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    pub fn active_response_id(&self) -> Option<String> {
        self.inner.spoken.active_response()
    }

    pub fn context_messages(&self) -> Vec<ConversationMessage> {
        self.inner.context.lock().messages().cloned().collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_fallback_mode(&self) -> bool {
        self.inner.fallback_mode.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn audio(&self) -> &AudioPipeline {
        &self.inner.audio
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn timeout(&self) -> &SessionTimeoutCoordinator {
        &self.inner.timeout
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryCoordinator> {
        &self.inner.recovery
    }
}

impl Inner {
    /// Restore the stored session or mint a new one. Returns a token that is
    /// not about to expire.
    async fn restore_or_create(&self) -> VoiceResult<EphemeralToken> {
        let restore = match self
            .store
            .call(|s| async move { s.restore_session().await })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Session restore failed, starting new session");
                RestoreResult::start_new()
            }
        };

        if let (true, Some(session)) = (restore.success, restore.session_data) {
            let session_id = session.session_id.clone();
            info!(
                session_id = %session_id,
                messages = session.messages.len(),
                reconnect_required = restore.reconnect_required,
                "Restoring session"
            );
            *self.session_id.write() = Some(session_id.clone());

            let message_count = session.messages.len();
            {
                let mut context = self.context.lock();
                *context =
                    ConversationContext::from_messages(self.config.context_window, &session.messages);
                self.history_pending
                    .store(!context.is_empty(), Ordering::SeqCst);
            }
            self.persisted_items
                .lock()
                .extend(session.messages.iter().map(|m| m.id.clone()));

            let mut token = session.ephemeral_token();
            if token.expires_within(self.config.token_refresh_margin) {
                token = self.fetch_token(Some(&session_id)).await?;
            } else {
                *self.token.write() = Some(token.clone());
            }
            if restore.reconnect_required {
                if let Err(e) = self
                    .store
                    .call(|s| async move { s.increment_reconnect_count().await })
                    .await
                {
                    warn!(error = %e, "Failed to record reconnect");
                }
            }

            self.events.emit(OrchestratorEvent::SessionResumed {
                session_id,
                message_count,
            });
            return Ok(token);
        }

        let token = self.fetch_token(None).await?;
        let session_id = if token.session_id.is_empty() {
            format!("sess_{}", Uuid::new_v4().simple())
        } else {
            token.session_id.clone()
        };
        *self.session_id.write() = Some(session_id.clone());
        let (id, secret, expires_at) = (session_id.clone(), token.token.clone(), token.expires_at);
        if let Err(e) = self
            .store
            .call(move |s| async move { s.create_session(&id, &secret, expires_at).await })
            .await
        {
            warn!(error = %e, "Failed to persist new session");
        }
        self.context.lock().clear();
        self.persisted_items.lock().clear();
        self.history_pending.store(false, Ordering::SeqCst);
        info!(session_id = %session_id, "Created new session");
        Ok(token)
    }

    /// Mint a token, persist it and hand it to the connection manager.
    pub(super) async fn fetch_token(&self, session_id: Option<&str>) -> VoiceResult<EphemeralToken> {
        let mut token = self.token_provider.fetch_token(session_id).await?;
        if token.session_id.is_empty() {
            if let Some(id) = session_id {
                token.session_id = id.to_string();
            }
        }
        *self.token.write() = Some(token.clone());
        self.connection.update_token(token.clone());
        if self.session_id.read().is_some() {
            let stored = token.clone();
            if let Err(e) = self
                .store
                .call(move |s| async move { s.update_token(&stored).await })
                .await
            {
                warn!(error = %e, "Failed to persist refreshed token");
            }
        }
        debug!(expires_at = token.expires_at, "Token obtained");
        Ok(token)
    }

    /// Refresh the token for the current session.
    pub(super) async fn refresh_token(self: &Arc<Self>) -> VoiceResult<EphemeralToken> {
        let session_id = self.session_id.read().clone();
        let token = self.fetch_token(session_id.as_deref()).await?;
        self.schedule_token_refresh(&token);
        Ok(token)
    }

    /// A token usable right now, refreshed when it is close to expiry.
    pub(super) async fn usable_token(self: &Arc<Self>) -> VoiceResult<EphemeralToken> {
        let current = self.token.read().clone();
        match current {
            Some(token) if !token.expires_within(self.config.token_refresh_margin) => Ok(token),
            _ => self.refresh_token().await,
        }
    }

    pub(super) fn schedule_token_refresh(self: &Arc<Self>, token: &EphemeralToken) {
        let delay = token
            .time_until_expiry()
            .saturating_sub(self.config.token_refresh_margin);
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.ended.load(Ordering::SeqCst) {
                return;
            }
            info!("Refreshing token before expiry");
            if let Err(e) = inner.refresh_token().await {
                error!(error = %e, "Proactive token refresh failed");
                inner.report_error(
                    ClassifiedError::new(ErrorKind::TokenExpired, e.to_string())
                        .with_recoverable(true),
                );
            }
        });
        if let Some(previous) = self.refresh_task.lock().replace(handle) {
            previous.abort();
        }
        debug!(delay_ms = delay.as_millis() as u64, "Token refresh scheduled");
    }

    /// Acquire the microphone, falling back to relaxed constraints once.
    async fn acquire_microphone(self: &Arc<Self>) -> Option<MediaStream> {
        match self.audio.initialize_microphone(None).await {
            Ok(stream) => Some(stream),
            Err(e) if !e.is_recoverable() => {
                warn!(error = %e, "Microphone permission denied");
                self.report_error(e.classify());
                None
            }
            Err(e) => {
                warn!(error = %e, "Microphone unavailable, retrying with fallback constraints");
                match self
                    .audio
                    .initialize_microphone(Some(AudioConstraints::fallback()))
                    .await
                {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        self.report_error(e.classify());
                        None
                    }
                }
            }
        }
    }

    /// Session configuration for the next connect.
    pub(super) fn session_config(&self) -> SessionConfig {
        let mut config = self.config.session.clone();
        if !self.tools.is_empty() {
            config.tools = Some(self.tools.definitions());
            config.tool_choice.get_or_insert_with(|| "auto".to_string());
        }
        if self.fallback_mode.load(Ordering::SeqCst) {
            config.modalities = Some(vec!["text".to_string()]);
        }
        config
    }

    /// Connect with the current token and microphone. With `wait`, resolves
    /// only once the peer reports `connected`.
    pub(super) async fn connect_transport(self: &Arc<Self>, wait: bool) -> VoiceResult<()> {
        let token = self.usable_token().await?;
        self.history_pending
            .store(!self.context.lock().is_empty(), Ordering::SeqCst);
        self.connection
            .connect(token, self.audio.stream(), Some(self.session_config()))
            .await?;
        if wait
            && !self
                .connection
                .wait_for_state(ConnectionState::Connected, self.config.connect_timeout)
                .await
        {
            return Err(VoiceError::ConnectionFailed(
                "peer connection did not reach connected state".to_string(),
            ));
        }
        Ok(())
    }

    pub(super) fn send(&self, event: &ClientEvent) -> bool {
        let sent = self.connection.send_event(event);
        if sent {
            self.metrics.record_event_sent();
        } else {
            self.metrics.record_dropped_send();
        }
        sent
    }

    /// Send `response.cancel` + `output_audio_buffer.clear`, but only while a
    /// response is in flight.
    pub(super) fn cancel_active_response(&self) -> bool {
        let Some(response_id) = self.spoken.take_active_response() else {
            debug!("No active response, nothing to cancel");
            return false;
        };
        let response_id = (response_id != PENDING_RESPONSE_ID).then_some(response_id);
        info!(response_id = ?response_id, "Cancelling active response");
        self.send(&ClientEvent::ResponseCancel { response_id });
        self.send(&ClientEvent::OutputAudioBufferClear);
        true
    }

    /// Request a spoken response with one-off instructions, waiting for any
    /// in-flight response first. Returns whether it finished in time.
    pub(super) async fn speak(&self, instructions: &str) -> bool {
        let _turn = self.spoken.acquire(self.config.spoken_wait_timeout).await;
        let event = ClientEvent::ResponseCreate {
            response: Some(ResponseConfig {
                instructions: Some(instructions.to_string()),
                ..Default::default()
            }),
        };
        if !self.send(&event) {
            return false;
        }
        if !self.spoken.is_response_active() {
            self.spoken
                .set_active_response(Some(PENDING_RESPONSE_ID.to_string()));
        }
        self.spoken
            .wait_until_idle(self.config.spoken_wait_timeout)
            .await
    }

    pub(super) fn set_connection_state(&self, state: ConnectionState) {
        {
            let mut current = self.connection_state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.events
            .emit(OrchestratorEvent::ConnectionStateChanged(state));
        self.store.submit(move |s| async move {
            if let Err(e) = s.update_connection_state(state).await {
                debug!(error = %e, "Connection state not persisted");
            }
        });
    }

    pub(super) fn set_conversation_state(&self, state: ConversationState) {
        {
            let mut current = self.conversation_state.write();
            if *current == state {
                return;
            }
            debug!(from = %*current, to = %state, "Conversation state changed");
            *current = state;
        }
        self.events
            .emit(OrchestratorEvent::ConversationStateChanged(state));
        self.store.submit(move |s| async move {
            if let Err(e) = s.update_conversation_state(state).await {
                debug!(error = %e, "Conversation state not persisted");
            }
        });
    }

    /// Append a message to the rolling context and the store. Items already
    /// persisted (by protocol item id) are skipped; returns `false` for those.
    pub(super) async fn persist_message(
        &self,
        role: MessageRole,
        content: String,
        item_id: Option<&str>,
    ) -> bool {
        if let Some(id) = item_id {
            if !self.persisted_items.lock().insert(id.to_string()) {
                return false;
            }
        }
        let mut message = ConversationMessage::new(role, content);
        if let Some(id) = item_id {
            message = message.with_id(id);
        }
        self.context.lock().push(message.clone());
        match self
            .store
            .call(move |s| async move { s.add_message(message).await })
            .await
        {
            Ok(()) => self.metrics.record_message_persisted(),
            Err(e) => warn!(error = %e, "Failed to persist message"),
        }
        true
    }

    /// Surface an error and hand recoverable ones to recovery, unless the
    /// session is initializing or was shut down.
    pub(super) fn report_error(self: &Arc<Self>, error: ClassifiedError) {
        self.metrics.record_error();
        warn!(kind = %error.kind, recoverable = error.recoverable, message = %error.message, "Session error");
        self.events.emit(OrchestratorEvent::Error(error.clone()));

        if !error.recoverable {
            return;
        }
        if self.initializing.load(Ordering::SeqCst) {
            debug!("Initializing, recovery deferred to caller");
            return;
        }
        if self.ended.load(Ordering::SeqCst)
            || *self.connection_state.read() == ConnectionState::Disconnected
        {
            debug!("Disconnected, recovery skipped");
            return;
        }
        self.spawn_recovery(error);
    }

    pub(super) fn spawn_recovery(self: &Arc<Self>, error: ClassifiedError) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.metrics.record_recovery_attempt();
            if inner.recovery.handle_error(error).await {
                inner.metrics.record_recovery_success();
            }
        });
    }

    /// Proactive reconnect before the duration limit: announce, persist,
    /// reconnect under the same session id, confirm.
    pub(super) async fn handle_session_timeout(self: Arc<Self>) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        if self.timeout_reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Timeout reconnect already running");
            return;
        }
        let _guard = FlagGuard(&self.timeout_reconnecting);
        info!("Starting proactive session reconnect");
        self.events.emit(OrchestratorEvent::SessionReconnecting);

        if !self.speak(&self.config.timeout_warning_instructions).await {
            debug!("Warning response did not finish before reconnecting");
        }

        let conversation_state = *self.conversation_state.read();
        let snapshot = self
            .store
            .call(move |s| async move {
                let Some(mut session) = s.load_session().await? else {
                    return Ok(());
                };
                session.connection_state = ConnectionState::Reconnecting;
                session.conversation_state = conversation_state;
                session.touch();
                s.save_session(&session).await
            })
            .await;
        if let Err(e) = snapshot {
            warn!(error = %e, "Failed to save session before reconnect");
        }

        self.timeout.stop_session();
        self.network.stop_monitoring();
        self.connection.disconnect().await;

        let result = async {
            self.refresh_token().await?;
            self.connect_transport(true).await
        }
        .await;

        match result {
            Ok(()) => {
                self.metrics.record_timeout_reconnect();
                if let Err(e) = self
                    .store
                    .call(|s| async move { s.increment_reconnect_count().await })
                    .await
                {
                    debug!(error = %e, "Reconnect count not persisted");
                }
                self.speak(&self.config.reconnected_instructions).await;
                info!("Proactive reconnect complete");
                self.events.emit(OrchestratorEvent::SessionReconnected);
            }
            Err(e) => {
                error!(error = %e, "Proactive reconnect failed");
                let error = e.classify();
                self.metrics.record_error();
                self.events.emit(OrchestratorEvent::Error(error.clone()));
                if error.recoverable {
                    self.spawn_recovery(error);
                }
            }
        }
    }

    pub(super) async fn shutdown(&self) {
        self.ended.store(true, Ordering::SeqCst);
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        self.timeout.stop_session();
        self.network.stop_monitoring();
        self.spoken.take_active_response();
        self.connection.disconnect().await;
        self.audio.cleanup().await;
        self.pending_calls.lock().clear();
        self.set_connection_state(ConnectionState::Disconnected);
        self.set_conversation_state(ConversationState::Idle);
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        debug!("Orchestrator shut down");
    }
}
