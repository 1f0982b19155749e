//! Per-session counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SessionMetrics {
    events_received: AtomicU64,
    events_sent: AtomicU64,
    dropped_sends: AtomicU64,
    reconnects: AtomicU64,
    timeout_reconnects: AtomicU64,
    recoveries_attempted: AtomicU64,
    recoveries_succeeded: AtomicU64,
    tool_calls: AtomicU64,
    messages_persisted: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_sent: u64,
    pub dropped_sends: u64,
    pub reconnects: u64,
    pub timeout_reconnects: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    pub tool_calls: u64,
    pub messages_persisted: u64,
    pub errors: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_event_received => events_received,
        record_event_sent => events_sent,
        record_dropped_send => dropped_sends,
        record_reconnect => reconnects,
        record_timeout_reconnect => timeout_reconnects,
        record_recovery_attempt => recoveries_attempted,
        record_recovery_success => recoveries_succeeded,
        record_tool_call => tool_calls,
        record_message_persisted => messages_persisted,
        record_error => errors,
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            timeout_reconnects: self.timeout_reconnects.load(Ordering::Relaxed),
            recoveries_attempted: self.recoveries_attempted.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            messages_persisted: self.messages_persisted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.events_received,
            &self.events_sent,
            &self.dropped_sends,
            &self.reconnects,
            &self.timeout_reconnects,
            &self.recoveries_attempted,
            &self.recoveries_succeeded,
            &self.tool_calls,
            &self.messages_persisted,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
