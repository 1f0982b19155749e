//! Error types shared by every session component.
//!
//! - [`VoiceError`] is the `Result` error used across the crate.
//! - [`ErrorKind`] is the failure taxonomy the recovery layer matches on.
//! - [`ClassifiedError`] is the normalized shape handed to UI subscribers and
//!   to the [`ErrorRecoveryCoordinator`](crate::core::recovery::ErrorRecoveryCoordinator).

pub mod voice_error;

pub use voice_error::{ClassifiedError, ErrorKind, VoiceError, VoiceResult};
