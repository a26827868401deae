//! Adaptive quality — the feedback loop choosing the active profile
//!
//! Classifies rolling network and performance windows, maps the network
//! condition to a base preset, downgrades for performance pressure, and
//! applies hysteresis so the profile does not thrash.

use signstream_core::{
    ClientId, NetworkMetrics, PerformanceMetrics, QualityProfile, QualitySettings,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const HISTORY_CAP: usize = 60;
const CHANGE_HISTORY_CAP: usize = 100;
/// Only samples this recent feed the classifiers.
const ASSESSMENT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCondition {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl NetworkCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkCondition::Excellent => "excellent",
            NetworkCondition::Good => "good",
            NetworkCondition::Fair => "fair",
            NetworkCondition::Poor => "poor",
            NetworkCondition::Critical => "critical",
        }
    }

    fn base_profile(&self) -> QualityProfile {
        match self {
            NetworkCondition::Excellent => QualityProfile::UltraHigh,
            NetworkCondition::Good => QualityProfile::High,
            NetworkCondition::Fair => QualityProfile::Medium,
            NetworkCondition::Poor => QualityProfile::Low,
            NetworkCondition::Critical => QualityProfile::UltraLow,
        }
    }
}

/// (condition, max latency ms, min bandwidth mbps, max loss %)
const NETWORK_THRESHOLDS: [(NetworkCondition, f64, f64, f64); 4] = [
    (NetworkCondition::Excellent, 30.0, 10.0, 0.1),
    (NetworkCondition::Good, 50.0, 5.0, 0.5),
    (NetworkCondition::Fair, 100.0, 2.0, 1.0),
    (NetworkCondition::Poor, 200.0, 1.0, 2.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceCondition {
    Good,
    Moderate,
    Poor,
    Unknown,
}

impl PerformanceCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceCondition::Good => "good",
            PerformanceCondition::Moderate => "moderate",
            PerformanceCondition::Poor => "poor",
            PerformanceCondition::Unknown => "unknown",
        }
    }
}

/// One recorded profile change, kept for telemetry.
#[derive(Debug, Clone)]
pub struct QualityChange {
    pub at: chrono::DateTime<chrono::Utc>,
    pub old_profile: QualityProfile,
    pub new_profile: QualityProfile,
    pub network_condition: NetworkCondition,
    pub performance_condition: PerformanceCondition,
}

pub struct AdaptiveQualityController {
    client_id: ClientId,
    current: QualitySettings,
    network_history: VecDeque<(Instant, NetworkMetrics)>,
    performance_history: VecDeque<(Instant, PerformanceMetrics)>,
    change_history: VecDeque<QualityChange>,
    last_adaptation: Option<Instant>,
    adaptation_interval: Duration,
    stability_threshold: Duration,
    degradation_threshold: Duration,
    estimator: BandwidthEstimator,
}

impl AdaptiveQualityController {
    pub fn new(client_id: ClientId, initial: QualityProfile) -> Self {
        Self {
            client_id,
            current: QualitySettings::preset(initial),
            network_history: VecDeque::new(),
            performance_history: VecDeque::new(),
            change_history: VecDeque::new(),
            last_adaptation: None,
            adaptation_interval: Duration::from_secs(2),
            stability_threshold: Duration::from_secs(5),
            degradation_threshold: Duration::from_secs(1),
            estimator: BandwidthEstimator::new(),
        }
    }

    pub fn current(&self) -> QualitySettings {
        self.current
    }

    pub fn update_network_metrics(&mut self, metrics: NetworkMetrics, now: Instant) {
        self.estimator.add_sample(
            metrics.throughput_mbps,
            metrics.latency_ms,
            metrics.packet_loss_percent,
            now,
        );
        self.network_history.push_back((now, metrics));
        while self.network_history.len() > HISTORY_CAP {
            self.network_history.pop_front();
        }
    }

    pub fn update_performance_metrics(&mut self, metrics: PerformanceMetrics, now: Instant) {
        self.performance_history.push_back((now, metrics));
        while self.performance_history.len() > HISTORY_CAP {
            self.performance_history.pop_front();
        }
    }

    /// One adaptation cycle. Returns the new settings iff the profile changed.
    pub fn adapt(&mut self, now: Instant) -> Option<QualitySettings> {
        let elapsed = self
            .last_adaptation
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::MAX);
        if elapsed < self.adaptation_interval {
            return None;
        }

        let network = self.assess_network(now);
        let performance = self.assess_performance(now);
        let target = Self::optimal_profile(network, performance);

        if target == self.current.profile {
            return None;
        }

        if target > self.current.profile {
            // Upgrades wait out the stability window.
            if elapsed < self.stability_threshold {
                debug!(client = %self.client_id, "quality upgrade delayed for stability");
                return None;
            }
        } else if elapsed < self.degradation_threshold {
            return None;
        }

        let old = self.current.profile;
        self.current = QualitySettings::preset(target);
        self.last_adaptation = Some(now);
        self.change_history.push_back(QualityChange {
            at: chrono::Utc::now(),
            old_profile: old,
            new_profile: target,
            network_condition: network,
            performance_condition: performance,
        });
        while self.change_history.len() > CHANGE_HISTORY_CAP {
            self.change_history.pop_front();
        }

        info!(
            client = %self.client_id,
            old = old.as_str(),
            new = target.as_str(),
            network = network.as_str(),
            performance = performance.as_str(),
            "quality adapted"
        );
        Some(self.current)
    }

    /// Operator override; the next adaptation cycle may overwrite it.
    pub fn force_profile(&mut self, profile: QualityProfile, now: Instant) -> QualitySettings {
        let old = self.current.profile;
        self.current = QualitySettings::preset(profile);
        self.last_adaptation = Some(now);
        info!(
            client = %self.client_id,
            old = old.as_str(),
            new = profile.as_str(),
            "quality profile forced"
        );
        self.current
    }

    pub fn assess_network(&self, now: Instant) -> NetworkCondition {
        let recent: Vec<&NetworkMetrics> = self
            .network_history
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= ASSESSMENT_WINDOW)
            .map(|(_, m)| m)
            .collect();
        if recent.is_empty() {
            return NetworkCondition::Fair;
        }

        let n = recent.len() as f64;
        let avg_latency = recent.iter().map(|m| m.latency_ms).sum::<f64>() / n;
        let avg_bandwidth = recent.iter().map(|m| m.bandwidth_mbps).sum::<f64>() / n;
        let avg_loss = recent.iter().map(|m| m.packet_loss_percent).sum::<f64>() / n;

        for (condition, max_latency, min_bandwidth, max_loss) in NETWORK_THRESHOLDS {
            if avg_latency <= max_latency && avg_bandwidth >= min_bandwidth && avg_loss <= max_loss
            {
                return condition;
            }
        }
        NetworkCondition::Critical
    }

    pub fn assess_performance(&self, now: Instant) -> PerformanceCondition {
        let recent: Vec<&PerformanceMetrics> = self
            .performance_history
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= ASSESSMENT_WINDOW)
            .map(|(_, m)| m)
            .collect();
        if recent.is_empty() {
            return PerformanceCondition::Unknown;
        }

        let n = recent.len() as f64;
        let avg = |f: fn(&PerformanceMetrics) -> f64| recent.iter().map(|m| f(m)).sum::<f64>() / n;

        let mut violations = 0;
        if avg(|m| m.cpu_usage_percent) > 80.0 {
            violations += 1;
        }
        if avg(|m| m.memory_usage_percent) > 85.0 {
            violations += 1;
        }
        if avg(|m| m.processing_time_ms) > 100.0 {
            violations += 1;
        }
        if avg(|m| m.queue_depth as f64) > 10.0 {
            violations += 1;
        }
        if avg(|m| m.frame_drop_rate) > 5.0 {
            violations += 1;
        }
        if avg(|m| m.error_rate) > 2.0 {
            violations += 1;
        }

        match violations {
            0 => PerformanceCondition::Good,
            1 | 2 => PerformanceCondition::Moderate,
            _ => PerformanceCondition::Poor,
        }
    }

    fn optimal_profile(
        network: NetworkCondition,
        performance: PerformanceCondition,
    ) -> QualityProfile {
        let base = network.base_profile();
        match performance {
            PerformanceCondition::Good => base,
            PerformanceCondition::Moderate => base.downgraded(1),
            PerformanceCondition::Poor => base.downgraded(2),
            PerformanceCondition::Unknown => QualityProfile::Medium,
        }
    }

    pub fn adaptation_count(&self) -> usize {
        self.change_history.len()
    }

    pub fn stats_snapshot(&self, now: Instant) -> serde_json::Value {
        let recent_changes: Vec<serde_json::Value> = self
            .change_history
            .iter()
            .rev()
            .take(5)
            .map(|c| {
                serde_json::json!({
                    "timestamp": c.at.to_rfc3339(),
                    "old_profile": c.old_profile.as_str(),
                    "new_profile": c.new_profile.as_str(),
                    "network_condition": c.network_condition.as_str(),
                    "performance_condition": c.performance_condition.as_str(),
                })
            })
            .collect();

        serde_json::json!({
            "client_id": self.client_id.as_str(),
            "current_profile": self.current.profile.as_str(),
            "current_settings": self.current,
            "network_condition": self.assess_network(now).as_str(),
            "performance_condition": self.assess_performance(now).as_str(),
            "adaptations_count": self.change_history.len(),
            "bandwidth_estimate": self.estimator.estimate_snapshot(),
            "recent_quality_changes": recent_changes,
        })
    }
}

// ---------------------------------------------------------------------------
// Bandwidth estimation
// ---------------------------------------------------------------------------

const SAMPLE_CAP: usize = 100;
const MIN_SAMPLES: usize = 10;
const ESTIMATION_WINDOW: Duration = Duration::from_secs(30);
const ESTIMATE_WEIGHTS: [f64; 5] = [0.3, 0.2, 0.2, 0.15, 0.15];

/// Combines several throughput views into one bandwidth figure plus a
/// confidence score.
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, f64, f64, f64)>,
    current_bandwidth: f64,
    confidence: f64,
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            current_bandwidth: 0.0,
            confidence: 0.0,
        }
    }

    pub fn add_sample(
        &mut self,
        throughput_mbps: f64,
        latency_ms: f64,
        loss_percent: f64,
        now: Instant,
    ) {
        self.samples
            .push_back((now, throughput_mbps, latency_ms, loss_percent));
        while self.samples.len() > SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.update_estimate(now);
    }

    fn update_estimate(&mut self, now: Instant) {
        let recent: Vec<(f64, f64, f64)> = self
            .samples
            .iter()
            .filter(|(at, ..)| now.duration_since(*at) <= ESTIMATION_WINDOW)
            .map(|(_, t, l, p)| (*t, *l, *p))
            .collect();

        if recent.len() < MIN_SAMPLES {
            self.confidence = 0.0;
            return;
        }

        let n = recent.len() as f64;
        let throughputs: Vec<f64> = recent.iter().map(|(t, ..)| *t).collect();
        let avg = throughputs.iter().sum::<f64>() / n;

        let mut sorted = throughputs.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if sorted.len() % 2 == 0 {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        } else {
            sorted[sorted.len() / 2]
        };
        let p90 = sorted[((sorted.len() as f64 * 0.9) as usize).min(sorted.len() - 1)];

        let avg_latency = recent.iter().map(|(_, l, _)| *l).sum::<f64>() / n;
        let latency_factor = (1.0 - (avg_latency - 50.0) / 200.0).max(0.1);
        let latency_adjusted = avg * latency_factor;

        let avg_loss = recent.iter().map(|(_, _, p)| *p).sum::<f64>() / n;
        let loss_factor = (1.0 - avg_loss / 10.0).max(0.1);
        let loss_adjusted = avg * loss_factor;

        let estimates = [avg, median, p90, latency_adjusted, loss_adjusted];
        let weight_sum: f64 = ESTIMATE_WEIGHTS.iter().sum();
        self.current_bandwidth = estimates
            .iter()
            .zip(ESTIMATE_WEIGHTS.iter())
            .map(|(e, w)| e * w)
            .sum::<f64>()
            / weight_sum;

        let variance =
            throughputs.iter().map(|t| (t - avg) * (t - avg)).sum::<f64>() / (n - 1.0).max(1.0);
        let sample_factor = (n / 50.0).min(1.0);
        let variance_factor = (1.0 - variance / (avg + 1.0)).max(0.1);
        self.confidence = sample_factor * variance_factor;
    }

    pub fn bandwidth_mbps(&self) -> f64 {
        self.current_bandwidth
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn estimate_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "bandwidth_mbps": (self.current_bandwidth * 100.0).round() / 100.0,
            "confidence": (self.confidence * 100.0).round() / 100.0,
            "sample_count": self.samples.len(),
        })
    }
}
