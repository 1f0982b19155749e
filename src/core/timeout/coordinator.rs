//! Proactive session timeout handling.
//!
//! Deadlines are recomputed from the stored start instant on every wake-up,
//! so a late timer never shifts later milestones. A periodic health check is
//! a second trigger path for the same schedule.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::schedule::{Milestone, SessionTimeoutConfig, TimeoutSchedule};
use crate::utils::EventEmitter;

static MAX_DURATION_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)maximum\s+(session\s+)?duration").ok());

/// Whether a server error message reports the session duration limit.
pub fn is_max_duration_message(message: &str) -> bool {
    match MAX_DURATION_PATTERN.as_ref() {
        Some(pattern) => pattern.is_match(message),
        None => message.to_lowercase().contains("maximum duration"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    Warning { remaining_minutes: u32 },
    /// Reconnect now
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Idle,
    Running,
    Warning { remaining_minutes: u32 },
    TimedOut,
}

struct Running {
    generation: u64,
    started: Instant,
    schedule: TimeoutSchedule,
    task: JoinHandle<()>,
}

struct Inner {
    config: SessionTimeoutConfig,
    running: Mutex<Option<Running>>,
    generation: AtomicU64,
    events: EventEmitter<TimeoutEvent>,
}

#[derive(Clone)]
pub struct SessionTimeoutCoordinator {
    inner: Arc<Inner>,
}

impl SessionTimeoutCoordinator {
    pub fn new(config: SessionTimeoutConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                running: Mutex::new(None),
                generation: AtomicU64::new(0),
                events: EventEmitter::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TimeoutEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SessionTimeoutConfig {
        &self.inner.config
    }

    /// Start tracking a session from now. A running session is replaced.
    pub fn start_session(&self) {
        let started = Instant::now();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let schedule = TimeoutSchedule::new(&self.inner.config);

        let mut running = self.inner.running.lock();
        if let Some(previous) = running.take() {
            previous.task.abort();
        }
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.drive(generation, started).await });
        *running = Some(Running {
            generation,
            started,
            schedule,
            task,
        });
        drop(running);
        info!(
            max_duration_ms = self.inner.config.max_session_duration_ms,
            "Session timeout tracking started"
        );
    }

    pub fn stop_session(&self) {
        if let Some(running) = self.inner.running.lock().take() {
            running.task.abort();
            debug!("Session timeout tracking stopped");
        }
    }

    /// Restart tracking after a reconnect.
    pub fn reset_session(&self) {
        self.stop_session();
        self.start_session();
    }

    /// Time left before the hard limit, or `None` when idle.
    pub fn get_remaining_time(&self) -> Option<Duration> {
        let running = self.inner.running.lock();
        running.as_ref().map(|r| {
            self.inner
                .config
                .max_duration()
                .saturating_sub(r.started.elapsed())
        })
    }

    pub fn state(&self) -> TimeoutState {
        match self.inner.running.lock().as_ref() {
            None => TimeoutState::Idle,
            Some(r) if r.schedule.timed_out() => TimeoutState::TimedOut,
            Some(r) => match r.schedule.last_warning() {
                Some(remaining_minutes) => TimeoutState::Warning { remaining_minutes },
                None => TimeoutState::Running,
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Recognize a server error reporting the duration limit. Fires the
    /// timeout (once) when tracking is active.
    pub fn handle_timeout_error(&self, message: &str) -> bool {
        if !is_max_duration_message(message) {
            return false;
        }
        warn!(message, "Server reported maximum session duration");
        let fire = {
            let mut running = self.inner.running.lock();
            match running.as_mut() {
                Some(r) => r.schedule.force_timeout(),
                None => true,
            }
        };
        if fire {
            self.inner.events.emit(TimeoutEvent::Timeout);
        }
        true
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, generation: u64, started: Instant) {
        let health_interval = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        let mut next_health = started + health_interval;

        loop {
            let deadline = {
                let running = self.running.lock();
                match running.as_ref() {
                    Some(r) if r.generation == generation => r.schedule.next_deadline(),
                    _ => return,
                }
            };
            let Some(deadline) = deadline else {
                return;
            };

            let wake = (started + deadline).min(next_health);
            tokio::time::sleep_until(wake).await;
            if Instant::now() >= next_health {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Session health check");
                next_health += health_interval;
            }

            let due = {
                let mut running = self.running.lock();
                match running.as_mut() {
                    Some(r) if r.generation == generation => r.schedule.due(started.elapsed()),
                    _ => return,
                }
            };

            for milestone in due {
                match milestone {
                    Milestone::Warning { remaining_minutes } => {
                        info!(remaining_minutes, "Session timeout warning");
                        self.events.emit(TimeoutEvent::Warning { remaining_minutes });
                    }
                    Milestone::Timeout => {
                        warn!("Session approaching maximum duration, forcing reconnect");
                        self.events.emit(TimeoutEvent::Timeout);
                    }
                }
            }
        }
    }
}
