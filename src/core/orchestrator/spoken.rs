//! Exclusive access to the assistant's voice.
//!
//! The model speaks one response at a time. Anything the client wants spoken
//! (warnings, confirmations) waits for the in-flight response to finish and
//! then holds the turn until its own response completes.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, warn};

/// Placeholder id for a response that was requested but not yet created.
pub const PENDING_RESPONSE_ID: &str = "pending";

pub struct SpokenChannel {
    turn: Mutex<()>,
    active: watch::Sender<Option<String>>,
}

/// Held while the client owns the spoken channel.
pub struct SpokenTurn<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl Default for SpokenChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpokenChannel {
    pub fn new() -> Self {
        let (active, _) = watch::channel(None);
        Self {
            turn: Mutex::new(()),
            active,
        }
    }

    pub fn set_active_response(&self, id: Option<String>) {
        self.active.send_replace(id);
    }

    /// Clear the in-flight response, returning it.
    pub fn take_active_response(&self) -> Option<String> {
        self.active.send_replace(None)
    }

    pub fn active_response(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    pub fn is_response_active(&self) -> bool {
        self.active.borrow().is_some()
    }

    /// Wait until no response is in flight. Returns `false` on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|active| active.is_none())).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        }
    }

    /// Take the turn once the current response (if any) is done. Gives up
    /// waiting after `timeout` and takes the turn anyway.
    pub async fn acquire(&self, timeout: Duration) -> SpokenTurn<'_> {
        let guard = self.turn.lock().await;
        if !self.wait_until_idle(timeout).await {
            warn!("Timed out waiting for the active response, speaking anyway");
        }
        debug!("Spoken channel acquired");
        SpokenTurn { _guard: guard }
    }
}
