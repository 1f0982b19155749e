//! Session persistence.
//!
//! A persisted session lets a restarted client resume the same conversation
//! under the same session identity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::model::{ConversationMessage, ConversationState, Session};
use super::token::EphemeralToken;
use crate::core::connection::ConnectionState;
use crate::errors::{VoiceError, VoiceResult};

/// Default maximum age of a restorable session.
pub const DEFAULT_MAX_SESSION_AGE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    pub session_data: Option<Session>,
    pub should_start_new: bool,
    /// The session was live when it was last saved and must be reconnected
    pub reconnect_required: bool,
}

impl RestoreResult {
    pub fn start_new() -> Self {
        Self {
            success: false,
            session_data: None,
            should_start_new: true,
            reconnect_required: false,
        }
    }

    /// Decide whether `session` can be resumed.
    pub fn evaluate(session: Option<Session>, max_age: Duration) -> Self {
        let Some(session) = session else {
            return Self::start_new();
        };
        if session.ended {
            debug!(session_id = %session.session_id, "Stored session already ended");
            return Self::start_new();
        }
        if session.age_ms() > max_age.as_millis() as u64 {
            info!(session_id = %session.session_id, "Stored session too old to resume");
            return Self::start_new();
        }
        let reconnect_required = matches!(
            session.connection_state,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
        );
        Self {
            success: true,
            session_data: Some(session),
            should_start_new: false,
            reconnect_required,
        }
    }
}

/// Persistence capability injected into the orchestrator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn restore_session(&self) -> VoiceResult<RestoreResult>;

    async fn create_session(
        &self,
        session_id: &str,
        token: &str,
        expires_at: u64,
    ) -> VoiceResult<Session>;

    async fn save_session(&self, session: &Session) -> VoiceResult<()>;

    async fn load_session(&self) -> VoiceResult<Option<Session>>;

    async fn add_message(&self, message: ConversationMessage) -> VoiceResult<()>;

    async fn update_token(&self, token: &EphemeralToken) -> VoiceResult<()>;

    async fn update_connection_state(&self, state: ConnectionState) -> VoiceResult<()>;

    async fn update_conversation_state(&self, state: ConversationState) -> VoiceResult<()>;

    async fn increment_reconnect_count(&self) -> VoiceResult<u32>;

    async fn end_session(&self) -> VoiceResult<()>;
}

fn no_session() -> VoiceError {
    VoiceError::Persistence("no active session".to_string())
}

/// Process-local store.
pub struct InMemorySessionStore {
    session: Mutex<Option<Session>>,
    max_age: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSION_AGE)
    }
}

impl InMemorySessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            session: Mutex::new(None),
            max_age,
        }
    }

    /// Store seeded with an existing session.
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            max_age: DEFAULT_MAX_SESSION_AGE,
        }
    }

    async fn update<T>(&self, f: impl FnOnce(&mut Session) -> T) -> VoiceResult<T> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(no_session)?;
        let out = f(session);
        session.touch();
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn restore_session(&self) -> VoiceResult<RestoreResult> {
        let session = self.session.lock().await.clone();
        Ok(RestoreResult::evaluate(session, self.max_age))
    }

    async fn create_session(
        &self,
        session_id: &str,
        token: &str,
        expires_at: u64,
    ) -> VoiceResult<Session> {
        let session = Session::new(session_id, token, expires_at);
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    async fn save_session(&self, session: &Session) -> VoiceResult<()> {
        *self.session.lock().await = Some(session.clone());
        Ok(())
    }

    async fn load_session(&self) -> VoiceResult<Option<Session>> {
        Ok(self.session.lock().await.clone())
    }

    async fn add_message(&self, message: ConversationMessage) -> VoiceResult<()> {
        self.update(|s| s.messages.push(message)).await
    }

    async fn update_token(&self, token: &EphemeralToken) -> VoiceResult<()> {
        self.update(|s| {
            s.token = token.token.clone();
            s.token_expires_at = token.expires_at;
        })
        .await
    }

    async fn update_connection_state(&self, state: ConnectionState) -> VoiceResult<()> {
        self.update(|s| s.connection_state = state).await
    }

    async fn update_conversation_state(&self, state: ConversationState) -> VoiceResult<()> {
        self.update(|s| s.conversation_state = state).await
    }

    async fn increment_reconnect_count(&self) -> VoiceResult<u32> {
        self.update(|s| {
            s.reconnect_count += 1;
            s.reconnect_count
        })
        .await
    }

    async fn end_session(&self) -> VoiceResult<()> {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.ended = true;
            session.connection_state = ConnectionState::Disconnected;
        }
        Ok(())
    }
}

/// JSON file store. Every mutation rewrites the file.
pub struct FileSessionStore {
    path: PathBuf,
    cache: Mutex<Option<Session>>,
    max_age: Duration,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
            max_age: DEFAULT_MAX_SESSION_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> VoiceResult<Option<Session>> {
        match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => Ok(Some(session)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Discarding unreadable session file");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VoiceError::Persistence(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_file(&self, session: &Session) -> VoiceResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VoiceError::Persistence(format!("create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_vec_pretty(session)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| VoiceError::Persistence(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| VoiceError::Persistence(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }

    async fn update<T>(&self, f: impl FnOnce(&mut Session) -> T) -> VoiceResult<T> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = self.read_file().await?;
        }
        let session = cache.as_mut().ok_or_else(no_session)?;
        let out = f(session);
        session.touch();
        self.write_file(session).await?;
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn restore_session(&self) -> VoiceResult<RestoreResult> {
        let session = self.read_file().await?;
        *self.cache.lock().await = session.clone();
        Ok(RestoreResult::evaluate(session, self.max_age))
    }

    async fn create_session(
        &self,
        session_id: &str,
        token: &str,
        expires_at: u64,
    ) -> VoiceResult<Session> {
        let session = Session::new(session_id, token, expires_at);
        let mut cache = self.cache.lock().await;
        self.write_file(&session).await?;
        *cache = Some(session.clone());
        debug!(session_id, path = %self.path.display(), "Session created");
        Ok(session)
    }

    async fn save_session(&self, session: &Session) -> VoiceResult<()> {
        let mut cache = self.cache.lock().await;
        self.write_file(session).await?;
        *cache = Some(session.clone());
        Ok(())
    }

    async fn load_session(&self) -> VoiceResult<Option<Session>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = self.read_file().await?;
        }
        Ok(cache.clone())
    }

    async fn add_message(&self, message: ConversationMessage) -> VoiceResult<()> {
        self.update(|s| s.messages.push(message)).await
    }

    async fn update_token(&self, token: &EphemeralToken) -> VoiceResult<()> {
        self.update(|s| {
            s.token = token.token.clone();
            s.token_expires_at = token.expires_at;
        })
        .await
    }

    async fn update_connection_state(&self, state: ConnectionState) -> VoiceResult<()> {
        self.update(|s| s.connection_state = state).await
    }

    async fn update_conversation_state(&self, state: ConversationState) -> VoiceResult<()> {
        self.update(|s| s.conversation_state = state).await
    }

    async fn increment_reconnect_count(&self) -> VoiceResult<u32> {
        self.update(|s| {
            s.reconnect_count += 1;
            s.reconnect_count
        })
        .await
    }

    async fn end_session(&self) -> VoiceResult<()> {
        let result = self
            .update(|s| {
                s.ended = true;
                s.connection_state = ConnectionState::Disconnected;
            })
            .await;
        match result {
            Err(VoiceError::Persistence(m)) if m == "no active session" => Ok(()),
            other => other,
        }
    }
}
