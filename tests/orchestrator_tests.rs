//! Full voice session flows over the in-memory platform.

mod mock_platform;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mock_platform::{MicrophoneBehavior, Platform, eventually, test_config, wait_for_event};
use parking_lot::Mutex;
use serde_json::{Value, json};
use waav_voice_session::core::audio::{AudioContext, AudioContextState};
use waav_voice_session::core::connection::ConnectionState;
use waav_voice_session::core::orchestrator::{OrchestratorEvent, VoiceSessionOrchestrator};
use waav_voice_session::core::protocol::ToolDef;
use waav_voice_session::core::session::{
    ConversationMessage, ConversationState, EphemeralToken, InMemorySessionStore, MessageRole,
    RestoreResult, Session, SessionStore,
};
use waav_voice_session::core::tools::{ToolExecutor, ToolRegistry};
use waav_voice_session::errors::{ErrorKind, VoiceError};
use waav_voice_session::utils::now_ms;

const WAIT: Duration = Duration::from_secs(2);

async fn started(platform: &Platform) -> VoiceSessionOrchestrator {
    started_with(platform, ToolRegistry::new()).await
}

async fn started_with(platform: &Platform, tools: ToolRegistry) -> VoiceSessionOrchestrator {
    let orchestrator = VoiceSessionOrchestrator::new(test_config(), platform.deps_with_tools(tools));
    orchestrator.initialize().await.unwrap();
    assert!(
        orchestrator
            .connection()
            .wait_for_state(ConnectionState::Connected, WAIT)
            .await
    );
    assert!(eventually(WAIT, || orchestrator.conversation_state() == ConversationState::Listening).await);
    orchestrator
}

fn user_item(id: &str, text: &str) -> Value {
    json!({
        "type": "conversation.item.created",
        "item": {
            "id": id,
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
}

#[tokio::test]
async fn test_initialize_connects_and_starts_recording() {
    let platform = Platform::new();
    let orchestrator = VoiceSessionOrchestrator::new(test_config(), platform.deps());
    let mut events = orchestrator.subscribe();

    orchestrator.initialize().await.unwrap();

    let connected = wait_for_event(&mut events, WAIT, |e| {
        matches!(
            e,
            OrchestratorEvent::ConnectionStateChanged(ConnectionState::Connected)
        )
    })
    .await;
    assert!(connected.is_some());
    let recording = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::RecordingStarted)
    })
    .await;
    assert!(recording.is_some());

    assert!(orchestrator.is_initialized());
    assert!(orchestrator.audio().is_recording());
    assert_eq!(orchestrator.session_id().as_deref(), Some("sess_fake"));
    assert_eq!(platform.tokens.issued(), 1);
    assert_eq!(platform.peer().track_count(), 1);

    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert_eq!(stored.session_id, "sess_fake");
    assert_eq!(stored.token, "ek_test_1");

    assert_eq!(platform.channel().sent_types(), vec!["session.update"]);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;

    orchestrator.initialize().await.unwrap();
    let (a, b) = tokio::join!(orchestrator.initialize(), orchestrator.initialize());
    a.unwrap();
    b.unwrap();

    assert_eq!(platform.factory.created(), 1);
    assert_eq!(platform.tokens.issued(), 1);
}

#[tokio::test]
async fn test_user_item_is_persisted_once() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let mut events = orchestrator.subscribe();

    platform.peer().receive(user_item("item_1", "hello"));

    let transcript = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::UserTranscript { .. })
    })
    .await;
    match transcript {
        Some(OrchestratorEvent::UserTranscript { text, is_final }) => {
            assert_eq!(text, "hello");
            assert!(is_final);
        }
        other => panic!("expected user transcript, got {other:?}"),
    }

    // Duplicate delivery of the same item
    platform.peer().receive(user_item("item_1", "hello"));
    platform
        .peer()
        .receive(json!({ "type": "session.updated", "session": {} }));
    assert!(eventually(WAIT, || orchestrator.metrics().events_received >= 3).await);

    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 1);
    let message = &stored.messages[0];
    assert_eq!(message.id, "item_1");
    assert_eq!(message.role, MessageRole::User);
    assert_eq!(message.content, "hello");
    assert_eq!(serde_json::to_value(message).unwrap()["type"], "user");

    assert_eq!(orchestrator.context_messages().len(), 1);
    assert_eq!(orchestrator.metrics().messages_persisted, 1);
}

#[tokio::test]
async fn test_assistant_transcript_accumulates_and_persists() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let mut events = orchestrator.subscribe();
    let peer = platform.peer();

    for delta in ["Hi ", "there"] {
        peer.receive(json!({
            "type": "response.audio_transcript.delta",
            "item_id": "item_a",
            "delta": delta,
        }));
    }
    peer.receive(json!({
        "type": "response.audio_transcript.done",
        "item_id": "item_a",
        "transcript": "Hi there",
    }));

    let mut partials = Vec::new();
    loop {
        let event = wait_for_event(&mut events, WAIT, |e| {
            matches!(e, OrchestratorEvent::AssistantTranscript { .. })
        })
        .await
        .expect("assistant transcript");
        if let OrchestratorEvent::AssistantTranscript { text, is_final } = event {
            if is_final {
                assert_eq!(text, "Hi there");
                break;
            }
            partials.push(text);
        }
    }
    assert_eq!(partials, vec!["Hi ", "Hi there"]);
    assert!(eventually(WAIT, || orchestrator.metrics().messages_persisted == 1).await);

    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].role, MessageRole::Assistant);
    assert_eq!(stored.messages[0].content, "Hi there");
}

#[tokio::test]
async fn test_send_message_sends_item_then_response() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;

    orchestrator.send_message("   ").await.unwrap();
    orchestrator.send_message("  what time is it? ").await.unwrap();

    let channel = platform.channel();
    assert_eq!(
        channel.sent_types(),
        vec![
            "session.update",
            "conversation.item.create",
            "response.create"
        ]
    );
    let item = &channel.sent_of_type("conversation.item.create")[0]["item"];
    assert_eq!(item["role"], "user");
    assert_eq!(item["content"][0]["text"], "what time is it?");
    assert_eq!(orchestrator.conversation_state(), ConversationState::Processing);

    // Persisted only when the server echoes the item
    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert!(stored.messages.is_empty());
}

#[tokio::test]
async fn test_send_message_before_connect_fails() {
    let platform = Platform::new();
    let orchestrator = VoiceSessionOrchestrator::new(test_config(), platform.deps());

    let err = orchestrator.send_message("hello").await.unwrap_err();
    assert!(matches!(err, VoiceError::NotConnected));
}

#[tokio::test]
async fn test_pause_without_active_response_sends_no_cancel() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;

    orchestrator.pause_session().await.unwrap();

    let channel = platform.channel();
    assert!(channel.sent_of_type("response.cancel").is_empty());
    assert!(channel.sent_of_type("output_audio_buffer.clear").is_empty());
    assert!(orchestrator.audio().is_muted());
    assert_eq!(orchestrator.conversation_state(), ConversationState::Idle);

    orchestrator.resume_session().await.unwrap();
    assert!(!orchestrator.audio().is_muted());
    assert_eq!(orchestrator.conversation_state(), ConversationState::Listening);
}

#[tokio::test]
async fn test_pause_cancels_active_response() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;

    platform.peer().receive(json!({
        "type": "response.created",
        "response": { "id": "resp_1", "status": "in_progress" },
    }));
    assert!(eventually(WAIT, || orchestrator.active_response_id().is_some()).await);

    orchestrator.pause_session().await.unwrap();

    let channel = platform.channel();
    let cancels = channel.sent_of_type("response.cancel");
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0]["response_id"], "resp_1");
    let sent = channel.sent_types();
    assert_eq!(
        sent[sent.len() - 2..],
        ["response.cancel", "output_audio_buffer.clear"]
    );
    assert!(orchestrator.active_response_id().is_none());

    // Nothing left to cancel
    orchestrator.pause_session().await.unwrap();
    assert_eq!(channel.sent_of_type("response.cancel").len(), 1);
}

#[tokio::test]
async fn test_speech_while_speaking_interrupts() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let peer = platform.peer();

    peer.receive(json!({ "type": "response.created", "response": { "id": "resp_2" } }));
    peer.receive(json!({ "type": "output_audio_buffer.started", "response_id": "resp_2" }));
    assert!(eventually(WAIT, || orchestrator.conversation_state() == ConversationState::Speaking).await);

    peer.receive(json!({ "type": "input_audio_buffer.speech_started", "audio_start_ms": 120 }));
    assert!(
        eventually(WAIT, || orchestrator.conversation_state() == ConversationState::Interrupted)
            .await
    );

    peer.receive(json!({ "type": "input_audio_buffer.speech_stopped", "audio_end_ms": 900 }));
    assert!(
        eventually(WAIT, || orchestrator.conversation_state() == ConversationState::Processing)
            .await
    );

    peer.receive(json!({
        "type": "response.done",
        "response": { "id": "resp_2", "status": "cancelled" },
    }));
    assert!(eventually(WAIT, || orchestrator.conversation_state() == ConversationState::Idle).await);
    assert!(orchestrator.active_response_id().is_none());
}

#[tokio::test]
async fn test_restored_session_reinjects_history_once() {
    let mut session = Session::new("sess_restored", "ek_restored", now_ms() + 3_600_000);
    session.messages = vec![
        ConversationMessage::new(MessageRole::User, "My name is Ada."),
        ConversationMessage::new(MessageRole::Assistant, "Nice to meet you, Ada."),
        ConversationMessage::new(MessageRole::User, "Remember my name."),
    ];
    let platform = Platform::with_store(InMemorySessionStore::with_session(session));

    let orchestrator = VoiceSessionOrchestrator::new(test_config(), platform.deps());
    let mut events = orchestrator.subscribe();
    orchestrator.initialize().await.unwrap();

    let resumed = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::SessionResumed { .. })
    })
    .await;
    match resumed {
        Some(OrchestratorEvent::SessionResumed {
            session_id,
            message_count,
        }) => {
            assert_eq!(session_id, "sess_restored");
            assert_eq!(message_count, 3);
        }
        other => panic!("expected session resumed, got {other:?}"),
    }
    // Stored token still valid
    assert_eq!(platform.tokens.issued(), 0);
    assert!(
        orchestrator
            .connection()
            .wait_for_state(ConnectionState::Connected, WAIT)
            .await
    );

    let channel = platform.channel();
    assert!(eventually(WAIT, || channel.sent_of_type("session.update").len() == 1).await);

    let peer = platform.peer();
    peer.receive(json!({ "type": "session.created", "session": { "id": "sess_restored" } }));
    assert!(eventually(WAIT, || channel.sent_of_type("session.update").len() == 2).await);

    let history = &channel.sent_of_type("session.update")[1];
    let instructions = history["session"]["instructions"].as_str().unwrap();
    assert!(instructions.contains("User: My name is Ada."));
    assert!(instructions.contains("Assistant: Nice to meet you, Ada."));
    assert!(instructions.contains("User: Remember my name."));

    // A second session.created does not reinject again
    peer.receive(json!({ "type": "session.created", "session": {} }));
    peer.receive(json!({ "type": "session.updated", "session": {} }));
    let received = orchestrator.metrics().events_received;
    assert!(eventually(WAIT, || orchestrator.metrics().events_received >= received + 2).await);
    assert_eq!(channel.sent_of_type("session.update").len(), 2);
}

#[tokio::test]
async fn test_microphone_denied_continues_receive_only() {
    let platform = Platform::new();
    platform.audio.set_behavior(MicrophoneBehavior::PermissionDenied);
    let orchestrator = VoiceSessionOrchestrator::new(test_config(), platform.deps());
    let mut events = orchestrator.subscribe();

    orchestrator.initialize().await.unwrap();

    let error = wait_for_event(&mut events, WAIT, |e| matches!(e, OrchestratorEvent::Error(_))).await;
    match error {
        Some(OrchestratorEvent::Error(error)) => {
            assert_eq!(error.kind, ErrorKind::MicrophonePermissionDenied);
            assert!(!error.recoverable);
        }
        other => panic!("expected permission error, got {other:?}"),
    }

    assert!(
        orchestrator
            .connection()
            .wait_for_state(ConnectionState::Connected, WAIT)
            .await
    );
    assert_eq!(platform.peer().track_count(), 0);
    assert!(!orchestrator.audio().is_recording());
    assert!(!orchestrator.recovery().is_recovering());
    assert!(orchestrator.recovery().history().is_empty());
}

#[tokio::test]
async fn test_overconstrained_microphone_retries_with_fallback() {
    let platform = Platform::new();
    platform.audio.set_behavior(MicrophoneBehavior::RejectsProcessing);
    let orchestrator = started(&platform).await;

    let requests = platform.audio.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].echo_cancellation);
    assert!(!requests[1].echo_cancellation);
    assert_eq!(platform.peer().track_count(), 1);
    assert!(orchestrator.audio().is_recording());
}

#[tokio::test]
async fn test_start_listening_resumes_suspended_context() {
    let platform = Platform::new();
    platform
        .audio
        .set_initial_context_state(AudioContextState::Suspended);
    let orchestrator = started(&platform).await;

    orchestrator.stop_listening();
    assert!(!orchestrator.audio().is_recording());
    assert_eq!(orchestrator.conversation_state(), ConversationState::Idle);

    orchestrator.start_listening().await.unwrap();
    let context = platform.audio.last_context().unwrap();
    assert_eq!(context.state(), AudioContextState::Running);
    assert!(orchestrator.audio().is_recording());
    assert!(!orchestrator.audio().is_muted());
    assert_eq!(orchestrator.conversation_state(), ConversationState::Listening);
}

struct EchoTool {
    seen: Mutex<Vec<(Value, usize)>>,
}

#[async_trait]
impl ToolExecutor for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "echo",
            "Repeat the input",
            json!({ "type": "object", "properties": { "text": { "type": "string" } } }),
        )
    }

    async fn execute(&self, arguments: &Value, context: &[ConversationMessage]) -> String {
        self.seen.lock().push((arguments.clone(), context.len()));
        format!("echo: {}", arguments["text"].as_str().unwrap_or_default())
    }
}

#[tokio::test]
async fn test_function_call_runs_tool_and_requests_response() {
    let tool = Arc::new(EchoTool {
        seen: Mutex::new(Vec::new()),
    });
    let mut tools = ToolRegistry::new();
    tools.register(tool.clone());

    let platform = Platform::new();
    let orchestrator = started_with(&platform, tools).await;
    let mut events = orchestrator.subscribe();

    let session_update = &platform.channel().sent_of_type("session.update")[0];
    assert_eq!(session_update["session"]["tools"][0]["name"], "echo");
    assert_eq!(session_update["session"]["tool_choice"], "auto");

    let peer = platform.peer();
    peer.receive(user_item("item_u", "say hi"));
    peer.receive(json!({
        "type": "response.function_call_arguments.delta",
        "call_id": "call_1",
        "delta": "{\"text\":",
    }));
    peer.receive(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_1",
        "name": "echo",
        "arguments": "{\"text\":\"hi\"}",
    }));

    let completed = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::FunctionCallCompleted { .. })
    })
    .await;
    assert!(matches!(
        completed,
        Some(OrchestratorEvent::FunctionCallCompleted { call_id, name })
            if call_id == "call_1" && name == "echo"
    ));

    let seen = tool.seen.lock().clone();
    assert_eq!(seen, vec![(json!({ "text": "hi" }), 1)]);

    let channel = platform.channel();
    let outputs: Vec<_> = channel
        .sent_of_type("conversation.item.create")
        .into_iter()
        .map(|e| e["item"].clone())
        .collect();
    assert_eq!(
        outputs,
        vec![json!({ "type": "function_call_output", "call_id": "call_1", "output": "echo: hi" })]
    );
    assert_eq!(channel.sent_types().last().map(String::as_str), Some("response.create"));
    assert_eq!(orchestrator.metrics().tool_calls, 1);
}

#[tokio::test]
async fn test_unknown_tool_reports_unavailable() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let mut events = orchestrator.subscribe();

    platform.peer().receive(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_x",
        "name": "launch_rockets",
        "arguments": "not json",
    }));
    wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::FunctionCallCompleted { .. })
    })
    .await
    .expect("function call completed");

    let output = &platform.channel().sent_of_type("conversation.item.create")[0];
    assert_eq!(
        output["item"]["output"],
        "The tool \"launch_rockets\" is not available."
    );
}

#[tokio::test]
async fn test_nameless_function_call_is_still_answered() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;

    platform.peer().receive(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_anon",
        "arguments": "{}",
    }));
    let channel = platform.channel();
    assert!(eventually(WAIT, || !channel.sent_of_type("response.create").is_empty()).await);

    let outputs = channel.sent_of_type("conversation.item.create");
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0]["item"]["type"], "function_call_output");
    assert_eq!(outputs[0]["item"]["call_id"], "call_anon");
    assert!(outputs[0]["item"]["output"].is_string());

    let sent = channel.sent_types();
    assert_eq!(
        sent[sent.len() - 2..],
        ["conversation.item.create", "response.create"]
    );
    assert_eq!(orchestrator.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_rate_limits_update_is_informational() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let mut events = orchestrator.subscribe();
    let peer = platform.peer();
    let received = orchestrator.metrics().events_received;

    peer.receive(json!({
        "type": "rate_limits.updated",
        "rate_limits": [
            { "name": "requests", "limit": 1000, "remaining": 999, "reset_seconds": 0.06 },
            { "name": "tokens", "limit": 50000, "remaining": 120, "reset_seconds": 4.2 },
        ],
    }));

    let update = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::RateLimits { .. } | OrchestratorEvent::Error(_))
    })
    .await;
    assert!(matches!(
        update,
        Some(OrchestratorEvent::RateLimits {
            remaining_tokens: Some(120)
        })
    ));
    assert!(orchestrator.metrics().events_received > received);

    // Even a nearly exhausted budget leaves the session alone
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, OrchestratorEvent::Error(_)), "{event:?}");
    }
    assert!(!peer.is_closed());
    assert_eq!(orchestrator.connection_state(), ConnectionState::Connected);
    assert!(orchestrator.recovery().history().is_empty());
}

#[tokio::test]
async fn test_api_error_is_reported_without_recovery() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let mut events = orchestrator.subscribe();

    platform.peer().receive(json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "code": "invalid_value", "message": "Invalid voice" },
    }));

    let error = wait_for_event(&mut events, WAIT, |e| matches!(e, OrchestratorEvent::Error(_))).await;
    match error {
        Some(OrchestratorEvent::Error(error)) => {
            assert_eq!(error.kind, ErrorKind::ApiError);
            assert!(!error.recoverable);
            assert!(error.message.contains("Invalid voice"));
        }
        other => panic!("expected api error, got {other:?}"),
    }
    assert!(orchestrator.recovery().history().is_empty());
    assert_eq!(orchestrator.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_cancel_not_active_clears_response() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let peer = platform.peer();

    peer.receive(json!({ "type": "response.created", "response": { "id": "resp_3" } }));
    assert!(eventually(WAIT, || orchestrator.active_response_id().is_some()).await);

    peer.receive(json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "code": "response_cancel_not_active", "message": "no active response" },
    }));
    assert!(eventually(WAIT, || orchestrator.active_response_id().is_none()).await);
}

#[tokio::test]
async fn test_end_session_tears_down_and_marks_ended() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let peer = platform.peer();

    orchestrator.end_session().await.unwrap();

    assert!(peer.is_closed());
    assert_eq!(orchestrator.connection_state(), ConnectionState::Disconnected);
    assert_eq!(orchestrator.conversation_state(), ConversationState::Idle);
    assert!(!orchestrator.is_initialized());
    assert!(!orchestrator.audio().is_recording());
    assert!(!orchestrator.network().is_monitoring());
    assert!(!orchestrator.timeout().is_running());

    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert!(stored.ended);
    let restore = platform.store.restore_session().await.unwrap();
    assert!(restore.should_start_new);
}

#[tokio::test]
async fn test_cleanup_keeps_session_resumable() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;

    orchestrator.cleanup().await;

    assert_eq!(orchestrator.connection_state(), ConnectionState::Disconnected);
    let restore = platform.store.restore_session().await.unwrap();
    assert!(restore.success);
    assert_eq!(
        restore.session_data.map(|s| s.session_id).as_deref(),
        Some("sess_fake")
    );
}

#[tokio::test]
async fn test_session_timeout_reconnects_with_fresh_token() {
    let platform = Platform::new();
    let orchestrator = started(&platform).await;
    let mut events = orchestrator.subscribe();
    let first_peer = platform.peer();

    let orchestrator_clone = orchestrator.clone();
    let timeout = tokio::spawn(async move { orchestrator_clone.handle_session_timeout().await });

    wait_for_event(&mut events, WAIT, |e| {
        matches!(e, OrchestratorEvent::SessionReconnecting)
    })
    .await
    .expect("reconnecting");

    // The warning is spoken before the transport is replaced
    assert!(eventually(WAIT, || !first_peer.data_channel().unwrap().sent_of_type("response.create").is_empty()).await);
    first_peer.receive(json!({ "type": "response.created", "response": { "id": "resp_w" } }));
    first_peer.receive(json!({ "type": "response.done", "response": { "id": "resp_w" } }));

    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, OrchestratorEvent::SessionReconnected)
    })
    .await
    .expect("reconnected");
    timeout.await.unwrap();

    assert!(first_peer.is_closed());
    assert_eq!(platform.factory.created(), 2);
    assert_eq!(platform.tokens.issued(), 2);
    assert_eq!(
        platform.tokens.requests(),
        vec![None, Some("sess_fake".to_string())]
    );
    assert_eq!(orchestrator.connection_state(), ConnectionState::Connected);
    assert_eq!(orchestrator.metrics().timeout_reconnects, 1);

    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert_eq!(stored.reconnect_count, 1);
    assert_eq!(stored.token, "ek_test_2");
}

/// Holds writes of the `Connecting` state back so a later write could
/// overtake them.
struct LaggingStore(Arc<InMemorySessionStore>);

#[async_trait]
impl SessionStore for LaggingStore {
    async fn restore_session(&self) -> Result<RestoreResult, VoiceError> {
        self.0.restore_session().await
    }

    async fn create_session(
        &self,
        session_id: &str,
        token: &str,
        expires_at: u64,
    ) -> Result<Session, VoiceError> {
        self.0.create_session(session_id, token, expires_at).await
    }

    async fn save_session(&self, session: &Session) -> Result<(), VoiceError> {
        self.0.save_session(session).await
    }

    async fn load_session(&self) -> Result<Option<Session>, VoiceError> {
        self.0.load_session().await
    }

    async fn add_message(&self, message: ConversationMessage) -> Result<(), VoiceError> {
        self.0.add_message(message).await
    }

    async fn update_token(&self, token: &EphemeralToken) -> Result<(), VoiceError> {
        self.0.update_token(token).await
    }

    async fn update_connection_state(&self, state: ConnectionState) -> Result<(), VoiceError> {
        if state == ConnectionState::Connecting {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.0.update_connection_state(state).await
    }

    async fn update_conversation_state(
        &self,
        state: ConversationState,
    ) -> Result<(), VoiceError> {
        self.0.update_conversation_state(state).await
    }

    async fn increment_reconnect_count(&self) -> Result<u32, VoiceError> {
        self.0.increment_reconnect_count().await
    }

    async fn end_session(&self) -> Result<(), VoiceError> {
        self.0.end_session().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stored_state_follows_change_order() {
    let platform = Platform::new();
    let mut deps = platform.deps();
    deps.session_store = Arc::new(LaggingStore(platform.store.clone()));
    let orchestrator = VoiceSessionOrchestrator::new(test_config(), deps);

    orchestrator.initialize().await.unwrap();
    assert!(
        orchestrator
            .connection()
            .wait_for_state(ConnectionState::Connected, WAIT)
            .await
    );
    assert!(eventually(WAIT, || orchestrator.connection_state() == ConnectionState::Connected).await);

    // Let the delayed `Connecting` write land
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stored = platform.store.load_session().await.unwrap().unwrap();
    assert_eq!(stored.connection_state, ConnectionState::Connected);
    assert_eq!(stored.conversation_state, orchestrator.conversation_state());
}
