use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::media::{EncodingParameters, PeerConnection, TransportStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkQuality {
    Good,
    Medium,
    Poor,
}

/// Thresholds and tier rates for the outbound video controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BitratePolicy {
    pub good_rtt_ms: u64,
    pub good_loss_percent: f64,
    pub poor_rtt_ms: u64,
    pub poor_loss_percent: f64,
    pub good_bps: u64,
    pub medium_bps: u64,
    pub poor_bps: u64,
    pub relay_cap_bps: u64,
    pub start_bps: u64,
    /// Relative change required before a new target is applied.
    pub hysteresis: f64,
    pub poor_max_framerate: f64,
    pub sample_interval_ms: u64,
}

impl Default for BitratePolicy {
    fn default() -> Self {
        Self {
            good_rtt_ms: 100,
            good_loss_percent: 2.0,
            poor_rtt_ms: 250,
            poor_loss_percent: 5.0,
            good_bps: 5_000_000,
            medium_bps: 2_000_000,
            poor_bps: 800_000,
            relay_cap_bps: 1_500_000,
            start_bps: 3_500_000,
            hysteresis: 0.10,
            poor_max_framerate: 15.0,
            sample_interval_ms: 3_000,
        }
    }
}

impl BitratePolicy {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    /// Good needs both low RTT and low loss; either bad signal makes it poor.
    /// A missing RTT sample only counts against `Good`.
    pub fn classify(&self, rtt: Option<Duration>, loss_percent: f64) -> NetworkQuality {
        let rtt_ms = rtt.map(|d| d.as_secs_f64() * 1000.0);
        let poor_rtt = rtt_ms.is_some_and(|ms| ms >= self.poor_rtt_ms as f64);
        if poor_rtt || loss_percent >= self.poor_loss_percent {
            return NetworkQuality::Poor;
        }
        let good_rtt = rtt_ms.is_some_and(|ms| ms < self.good_rtt_ms as f64);
        if good_rtt && loss_percent < self.good_loss_percent {
            NetworkQuality::Good
        } else {
            NetworkQuality::Medium
        }
    }

    pub fn target_bps(&self, quality: NetworkQuality, relayed: bool) -> u64 {
        let tier = match quality {
            NetworkQuality::Good => self.good_bps,
            NetworkQuality::Medium => self.medium_bps,
            NetworkQuality::Poor => self.poor_bps,
        };
        if relayed {
            tier.min(self.relay_cap_bps)
        } else {
            tier
        }
    }
}

/// Packets lost per hundred sent over the interval between consecutive
/// samples, capped at 100.
#[derive(Debug, Default)]
struct LossWindow {
    previous: Option<(u64, u64)>,
}

impl LossWindow {
    fn loss_percent(&mut self, sent: u64, lost: u64) -> f64 {
        let (prev_sent, prev_lost) = self.previous.unwrap_or((0, 0));
        self.previous = Some((sent, lost));
        let sent_delta = sent.saturating_sub(prev_sent);
        let lost_delta = lost.saturating_sub(prev_lost);
        if sent_delta == 0 {
            return 0.0;
        }
        (lost_delta as f64 * 100.0 / sent_delta as f64).min(100.0)
    }
}

/// Decision half of the controller: stats in, encoding changes out.
#[derive(Debug)]
pub struct BitrateController {
    policy: BitratePolicy,
    applied_bps: u64,
    loss: LossWindow,
    last_quality: Option<NetworkQuality>,
}

impl BitrateController {
    pub fn new(policy: BitratePolicy) -> Self {
        let applied_bps = policy.start_bps;
        Self {
            policy,
            applied_bps,
            loss: LossWindow::default(),
            last_quality: None,
        }
    }

    pub fn applied_bps(&self) -> u64 {
        self.applied_bps
    }

    pub fn last_quality(&self) -> Option<NetworkQuality> {
        self.last_quality
    }

    /// Returns the encoding to apply, or `None` when the change is inside the
    /// hysteresis band. Above the relay cap on a relayed path always applies.
    pub fn evaluate(&mut self, stats: &TransportStats) -> Option<EncodingParameters> {
        let loss = self.loss.loss_percent(stats.packets_sent, stats.packets_lost);
        let quality = self.policy.classify(stats.round_trip_time, loss);
        self.last_quality = Some(quality);
        let target = self.policy.target_bps(quality, stats.relayed);

        let over_cap = stats.relayed && self.applied_bps > self.policy.relay_cap_bps;
        let delta = target.abs_diff(self.applied_bps) as f64;
        let significant = self.applied_bps == 0
            || delta / self.applied_bps as f64 > self.policy.hysteresis;
        if !significant && !over_cap {
            return None;
        }

        let poor = quality == NetworkQuality::Poor;
        self.applied_bps = target;
        Some(EncodingParameters {
            max_bitrate_bps: target,
            max_framerate: poor.then_some(self.policy.poor_max_framerate),
        })
    }
}

/// Sample, decide, apply until `cancel` fires. One instance per live path.
pub fn spawn_controller(
    peer: Arc<dyn PeerConnection>,
    policy: BitratePolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut controller = BitrateController::new(policy);
        let mut ticker = tokio::time::interval(controller.policy.sample_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first sample
        // covers a full period.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let stats = match peer.sample_stats().await {
                Ok(stats) => stats,
                Err(err) => {
                    tracing::debug!(target = "duet::bitrate", error = %err, "stats sample failed");
                    continue;
                }
            };
            let Some(parameters) = controller.evaluate(&stats) else {
                continue;
            };
            if cancel.is_cancelled() {
                break;
            }
            tracing::info!(
                target = "duet::bitrate",
                quality = ?controller.last_quality(),
                max_bitrate_bps = parameters.max_bitrate_bps,
                max_framerate = ?parameters.max_framerate,
                relayed = stats.relayed,
                "adjusting outbound video encoding"
            );
            if let Err(err) = peer.apply_encoding(parameters).await {
                tracing::warn!(target = "duet::bitrate", error = %err, "failed to apply encoding");
            }
        }
        tracing::debug!(target = "duet::bitrate", "bitrate controller stopped");
    })
}
