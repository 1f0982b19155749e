//! Periodic transport sampling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::quality::{
    AdaptiveSettings, NetworkInformationSource, NetworkQuality, QualityCategory, QualityInputs,
    adaptive_settings, categorize, quality_score,
};
use crate::core::connection::{InboundRtpStats, PeerConnection, RtcStatsReport};
use crate::utils::{EventEmitter, now_ms};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMonitorConfig {
    pub sample_interval_ms: u64,
    /// Score drop from baseline that counts as degradation
    pub degradation_threshold: f64,
    /// Samples averaged into the baseline
    pub baseline_window: usize,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            degradation_threshold: 1.0,
            baseline_window: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    QualityUpdated(NetworkQuality),
    CategoryChanged {
        previous: QualityCategory,
        current: QualityCategory,
    },
    Degradation {
        current: NetworkQuality,
        baseline: NetworkQuality,
    },
}

struct Inner {
    config: NetworkMonitorConfig,
    info_source: Option<Arc<dyn NetworkInformationSource>>,
    peer: RwLock<Option<Arc<dyn PeerConnection>>>,
    current: RwLock<Option<NetworkQuality>>,
    baseline: Mutex<VecDeque<NetworkQuality>>,
    previous_inbound: Mutex<Option<InboundRtpStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: EventEmitter<NetworkEvent>,
}

/// Samples connection quality on a fixed interval.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    pub fn new(
        config: NetworkMonitorConfig,
        info_source: Option<Arc<dyn NetworkInformationSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                info_source,
                peer: RwLock::new(None),
                current: RwLock::new(None),
                baseline: Mutex::new(VecDeque::new()),
                previous_inbound: Mutex::new(None),
                task: Mutex::new(None),
                events: EventEmitter::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Start sampling `peer`. A running monitor switches to the new peer.
    pub fn start_monitoring(&self, peer: Arc<dyn PeerConnection>) {
        self.stop_monitoring();
        *self.inner.peer.write() = Some(peer);

        let monitor = self.clone();
        let period = Duration::from_millis(self.inner.config.sample_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.sample_once().await;
            }
        });
        *self.inner.task.lock() = Some(handle);
        info!(interval_ms = self.inner.config.sample_interval_ms, "Network monitoring started");
    }

    pub fn stop_monitoring(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
            debug!("Network monitoring stopped");
        }
        self.inner.peer.write().take();
        self.inner.previous_inbound.lock().take();
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    pub fn get_current_quality(&self) -> Option<NetworkQuality> {
        self.inner.current.read().clone()
    }

    pub fn get_adaptive_settings(&self, category: QualityCategory) -> AdaptiveSettings {
        adaptive_settings(category)
    }

    /// Take one sample now. Returns `None` when there is nothing to measure.
    pub async fn sample_once(&self) -> Option<NetworkQuality> {
        let peer = self.inner.peer.read().clone();
        let report = match peer {
            Some(peer) => match peer.get_stats().await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "Failed to read transport statistics");
                    None
                }
            },
            None => None,
        };
        let info = self.inner.info_source.as_ref().and_then(|s| s.current());
        if report.is_none() && info.is_none() {
            return None;
        }

        let quality = self.build_snapshot(report.unwrap_or_default(), info);
        self.record(quality.clone());
        Some(quality)
    }

    fn build_snapshot(
        &self,
        report: RtcStatsReport,
        info: Option<super::quality::NetworkInformation>,
    ) -> NetworkQuality {
        let info = info.unwrap_or_default();

        let rtt_ms = report
            .candidate_pair
            .as_ref()
            .and_then(|pair| pair.current_round_trip_time)
            .map(|s| s * 1000.0)
            .or(info.rtt_ms);

        let (packets_lost, packet_loss_pct, jitter_ms) = match &report.inbound_audio {
            Some(inbound) => {
                let previous = self.inner.previous_inbound.lock().replace(inbound.clone());
                let (lost, received) = match previous {
                    Some(prev) => (
                        (inbound.packets_lost - prev.packets_lost).max(0),
                        inbound.packets_received.saturating_sub(prev.packets_received),
                    ),
                    None => (inbound.packets_lost.max(0), inbound.packets_received),
                };
                let total = lost as f64 + received as f64;
                let loss = (total > 0.0).then(|| lost as f64 / total * 100.0);
                (inbound.packets_lost, loss, Some(inbound.jitter * 1000.0))
            }
            None => (0, None, None),
        };

        let downlink_mbps = info.downlink_mbps.or_else(|| {
            report
                .candidate_pair
                .as_ref()
                .and_then(|pair| pair.available_outgoing_bitrate)
                .map(|bps| bps / 1_000_000.0)
        });

        let inputs = QualityInputs {
            rtt_ms,
            packet_loss_pct,
            jitter_ms,
            bandwidth_mbps: downlink_mbps,
        };
        let score = quality_score(&inputs);
        let category = categorize(score, &inputs);

        NetworkQuality {
            rtt_ms,
            packets_lost,
            packet_loss_pct,
            jitter_ms,
            downlink_mbps,
            effective_type: info.effective_type,
            score,
            category,
            recommendation: category.recommendation().to_string(),
            timestamp: now_ms(),
        }
    }

    fn record(&self, quality: NetworkQuality) {
        let previous = self.inner.current.write().replace(quality.clone());

        let baseline = {
            let mut window = self.inner.baseline.lock();
            let baseline = average(&window);
            window.push_back(quality.clone());
            while window.len() > self.inner.config.baseline_window.max(1) {
                window.pop_front();
            }
            baseline
        };

        debug!(
            score = quality.score,
            category = %quality.category,
            rtt_ms = ?quality.rtt_ms,
            loss_pct = ?quality.packet_loss_pct,
            "Network quality sampled"
        );
        self.inner
            .events
            .emit(NetworkEvent::QualityUpdated(quality.clone()));

        if let Some(previous) = previous {
            if previous.category != quality.category {
                info!(from = %previous.category, to = %quality.category, "Network quality category changed");
                self.inner.events.emit(NetworkEvent::CategoryChanged {
                    previous: previous.category,
                    current: quality.category,
                });
            }
        }

        if let Some(baseline) = baseline {
            if baseline.score - quality.score > self.inner.config.degradation_threshold {
                warn!(
                    current = quality.score,
                    baseline = baseline.score,
                    "Network quality degraded"
                );
                self.inner.events.emit(NetworkEvent::Degradation {
                    current: quality,
                    baseline,
                });
            }
        }
    }
}

fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Averaged snapshot of the baseline window.
fn average(window: &VecDeque<NetworkQuality>) -> Option<NetworkQuality> {
    let last = window.back()?;
    let n = window.len() as f64;
    let score = window.iter().map(|q| q.score).sum::<f64>() / n;
    let inputs = QualityInputs {
        rtt_ms: mean(window.iter().map(|q| q.rtt_ms)),
        packet_loss_pct: mean(window.iter().map(|q| q.packet_loss_pct)),
        jitter_ms: mean(window.iter().map(|q| q.jitter_ms)),
        bandwidth_mbps: mean(window.iter().map(|q| q.downlink_mbps)),
    };
    let category = categorize(score, &inputs);
    Some(NetworkQuality {
        rtt_ms: inputs.rtt_ms,
        packets_lost: last.packets_lost,
        packet_loss_pct: inputs.packet_loss_pct,
        jitter_ms: inputs.jitter_ms,
        downlink_mbps: inputs.bandwidth_mbps,
        effective_type: last.effective_type.clone(),
        score,
        category,
        recommendation: category.recommendation().to_string(),
        timestamp: last.timestamp,
    })
}
