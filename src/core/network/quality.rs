//! Network quality scoring and adaptive presets.

use serde::{Deserialize, Serialize};

/// Browser-style connection hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInformation {
    /// e.g. `4g`, `3g`, `wifi`
    pub effective_type: Option<String>,
    /// Mbps
    pub downlink_mbps: Option<f64>,
    /// Milliseconds
    pub rtt_ms: Option<f64>,
}

/// Source of connection hints, when the platform has one.
pub trait NetworkInformationSource: Send + Sync {
    fn current(&self) -> Option<NetworkInformation>;
}

/// Named quality bands, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityCategory {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl QualityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCategory::Excellent => "excellent",
            QualityCategory::Good => "good",
            QualityCategory::Fair => "fair",
            QualityCategory::Poor => "poor",
            QualityCategory::Critical => "critical",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            QualityCategory::Excellent => "Full quality audio",
            QualityCategory::Good => "Standard quality audio",
            QualityCategory::Fair => "Reduce audio processing load",
            QualityCategory::Poor => "Lower sample rate and increase buffering",
            QualityCategory::Critical => "Minimal audio, consider text fallback",
        }
    }

    /// The next band down. `Critical` stays `Critical`.
    pub fn degraded(&self) -> Self {
        match self {
            QualityCategory::Excellent => QualityCategory::Good,
            QualityCategory::Good => QualityCategory::Fair,
            QualityCategory::Fair => QualityCategory::Poor,
            QualityCategory::Poor | QualityCategory::Critical => QualityCategory::Critical,
        }
    }
}

impl std::fmt::Display for QualityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw measurements for one sample. `None` means not measurable this time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityInputs {
    pub rtt_ms: Option<f64>,
    /// Percentage 0..=100
    pub packet_loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
}

/// One network quality snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkQuality {
    pub rtt_ms: Option<f64>,
    pub packets_lost: i64,
    pub packet_loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub downlink_mbps: Option<f64>,
    pub effective_type: Option<String>,
    pub score: f64,
    pub category: QualityCategory,
    pub recommendation: String,
    pub timestamp: u64,
}

const RTT_WEIGHT: f64 = 0.3;
const LOSS_WEIGHT: f64 = 0.3;
const JITTER_WEIGHT: f64 = 0.2;
const BANDWIDTH_WEIGHT: f64 = 0.2;

/// Sub-score used for a metric that could not be measured.
const UNKNOWN_SUBSCORE: f64 = 3.0;

fn lower_is_better(value: Option<f64>, thresholds: [f64; 4]) -> f64 {
    let Some(value) = value else {
        return UNKNOWN_SUBSCORE;
    };
    match thresholds.iter().position(|&t| value < t) {
        Some(i) => 5.0 - i as f64,
        None => 1.0,
    }
}

fn higher_is_better(value: Option<f64>, thresholds: [f64; 4]) -> f64 {
    let Some(value) = value else {
        return UNKNOWN_SUBSCORE;
    };
    match thresholds.iter().position(|&t| value >= t) {
        Some(i) => 5.0 - i as f64,
        None => 1.0,
    }
}

pub fn rtt_score(rtt_ms: Option<f64>) -> f64 {
    lower_is_better(rtt_ms, [50.0, 100.0, 200.0, 400.0])
}

pub fn loss_score(loss_pct: Option<f64>) -> f64 {
    lower_is_better(loss_pct, [0.5, 1.0, 3.0, 5.0])
}

pub fn jitter_score(jitter_ms: Option<f64>) -> f64 {
    lower_is_better(jitter_ms, [10.0, 20.0, 50.0, 100.0])
}

pub fn bandwidth_score(mbps: Option<f64>) -> f64 {
    higher_is_better(mbps, [10.0, 5.0, 2.0, 1.0])
}

/// Weighted 1..=5 score.
pub fn quality_score(inputs: &QualityInputs) -> f64 {
    rtt_score(inputs.rtt_ms) * RTT_WEIGHT
        + loss_score(inputs.packet_loss_pct) * LOSS_WEIGHT
        + jitter_score(inputs.jitter_ms) * JITTER_WEIGHT
        + bandwidth_score(inputs.bandwidth_mbps) * BANDWIDTH_WEIGHT
}

/// Map a score to a category. Extreme loss or latency is critical regardless
/// of the weighted score.
pub fn categorize(score: f64, inputs: &QualityInputs) -> QualityCategory {
    if inputs.packet_loss_pct.is_some_and(|loss| loss > 10.0)
        || inputs.rtt_ms.is_some_and(|rtt| rtt > 1000.0)
    {
        return QualityCategory::Critical;
    }
    match score {
        s if s >= 4.5 => QualityCategory::Excellent,
        s if s >= 3.5 => QualityCategory::Good,
        s if s >= 2.5 => QualityCategory::Fair,
        s if s >= 1.5 => QualityCategory::Poor,
        _ => QualityCategory::Critical,
    }
}

/// Recommended audio settings for a category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveSettings {
    /// Bits per second
    pub audio_bitrate: u32,
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

pub fn adaptive_settings(category: QualityCategory) -> AdaptiveSettings {
    match category {
        QualityCategory::Excellent => AdaptiveSettings {
            audio_bitrate: 128_000,
            sample_rate: 24_000,
            buffer_size: 480,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        },
        QualityCategory::Good => AdaptiveSettings {
            audio_bitrate: 96_000,
            sample_rate: 24_000,
            buffer_size: 960,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        },
        QualityCategory::Fair => AdaptiveSettings {
            audio_bitrate: 64_000,
            sample_rate: 24_000,
            buffer_size: 1920,
            echo_cancellation: true,
            noise_suppression: false,
            auto_gain_control: true,
        },
        QualityCategory::Poor => AdaptiveSettings {
            audio_bitrate: 32_000,
            sample_rate: 16_000,
            buffer_size: 2560,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: true,
        },
        QualityCategory::Critical => AdaptiveSettings {
            audio_bitrate: 16_000,
            sample_rate: 8_000,
            buffer_size: 4096,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        },
    }
}
