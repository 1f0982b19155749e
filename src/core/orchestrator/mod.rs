//! Top-level voice session coordination.

pub mod config;
mod dispatch;
pub mod events;
pub mod metrics;
mod recovery_actions;
pub mod spoken;
mod store_writer;
pub mod voice_session;

pub use config::{OrchestratorConfig, OrchestratorDeps};
pub use events::OrchestratorEvent;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use spoken::{PENDING_RESPONSE_ID, SpokenChannel, SpokenTurn};
pub use voice_session::VoiceSessionOrchestrator;
