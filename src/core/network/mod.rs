//! Transport quality monitoring and adaptive recommendations.

pub mod monitor;
pub mod quality;

pub use monitor::{NetworkEvent, NetworkMonitor, NetworkMonitorConfig};
pub use quality::{
    AdaptiveSettings, NetworkInformation, NetworkInformationSource, NetworkQuality,
    QualityCategory, QualityInputs, adaptive_settings, categorize, quality_score,
};
