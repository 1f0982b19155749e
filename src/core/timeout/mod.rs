//! Session lifetime tracking against the service's maximum duration.

pub mod coordinator;
pub mod schedule;

pub use coordinator::{
    SessionTimeoutCoordinator, TimeoutEvent, TimeoutState, is_max_duration_message,
};
pub use schedule::{Milestone, SessionTimeoutConfig, TimeoutSchedule};
