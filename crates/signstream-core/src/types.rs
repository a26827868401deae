//! Core types for Signstream

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Client identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ClientId(Arc<str>);

impl ClientId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Message priority for queued delivery. Ordering: Critical > High > Normal > Low.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Quality profile levels. The derived `Ord` pins the upgrade axis:
/// UltraLow < Low < Medium < High < UltraHigh.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    UltraLow = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    UltraHigh = 4,
}

impl QualityProfile {
    pub const ALL: [QualityProfile; 5] = [
        QualityProfile::UltraLow,
        QualityProfile::Low,
        QualityProfile::Medium,
        QualityProfile::High,
        QualityProfile::UltraHigh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityProfile::UltraLow => "ultra_low",
            QualityProfile::Low => "low",
            QualityProfile::Medium => "medium",
            QualityProfile::High => "high",
            QualityProfile::UltraHigh => "ultra_high",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ultra_low" => Some(QualityProfile::UltraLow),
            "low" => Some(QualityProfile::Low),
            "medium" => Some(QualityProfile::Medium),
            "high" => Some(QualityProfile::High),
            "ultra_high" => Some(QualityProfile::UltraHigh),
            _ => None,
        }
    }

    /// Downgrade by `steps`, clamped at UltraLow.
    pub fn downgraded(&self, steps: usize) -> Self {
        let idx = (*self as usize).saturating_sub(steps);
        Self::ALL[idx]
    }
}

/// Immutable tuple of encoding and processing knobs for one profile.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct QualitySettings {
    pub profile: QualityProfile,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Linear downscale applied before the extractor, (0, 1].
    pub resolution_scale: f32,
    /// Advisory frame-rate hint returned to the client.
    pub frame_rate: u32,
    /// Extractor complexity knob: 0 fast, 1 medium, 2 accurate.
    pub extractor_complexity: u8,
    /// Ingest batch collapse factor, >= 1.
    pub batch_size: usize,
    pub compression_level: u8,
    /// Drop n of every n+1 frames.
    pub skip_frames: u32,
}

impl QualitySettings {
    /// Preset table. Monotone in every dimension across profiles.
    pub fn preset(profile: QualityProfile) -> Self {
        match profile {
            QualityProfile::UltraLow => Self {
                profile,
                jpeg_quality: 25,
                resolution_scale: 0.5,
                frame_rate: 10,
                extractor_complexity: 0,
                batch_size: 5,
                compression_level: 9,
                skip_frames: 3,
            },
            QualityProfile::Low => Self {
                profile,
                jpeg_quality: 40,
                resolution_scale: 0.65,
                frame_rate: 15,
                extractor_complexity: 0,
                batch_size: 3,
                compression_level: 7,
                skip_frames: 2,
            },
            QualityProfile::Medium => Self {
                profile,
                jpeg_quality: 60,
                resolution_scale: 0.8,
                frame_rate: 20,
                extractor_complexity: 1,
                batch_size: 2,
                compression_level: 5,
                skip_frames: 1,
            },
            QualityProfile::High => Self {
                profile,
                jpeg_quality: 75,
                resolution_scale: 0.9,
                frame_rate: 25,
                extractor_complexity: 1,
                batch_size: 1,
                compression_level: 3,
                skip_frames: 0,
            },
            QualityProfile::UltraHigh => Self {
                profile,
                jpeg_quality: 90,
                resolution_scale: 1.0,
                frame_rate: 30,
                extractor_complexity: 2,
                batch_size: 1,
                compression_level: 1,
                skip_frames: 0,
            },
        }
    }
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self::preset(QualityProfile::Medium)
    }
}

/// Which landmark groups the extractor detected in a frame.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionFlags {
    pub hands: bool,
    pub face: bool,
    pub pose: bool,
}

impl DetectionFlags {
    pub fn none() -> Self {
        Self::default()
    }

    /// Fraction of landmark groups detected, 0.0..=1.0.
    pub fn confidence(&self) -> f64 {
        let detected = [self.hands, self.face, self.pose]
            .iter()
            .filter(|d| **d)
            .count();
        detected as f64 / 3.0
    }
}

/// Network performance sample fed into the adaptive controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub packet_loss_percent: f64,
    pub jitter_ms: f64,
    pub throughput_mbps: f64,
}

/// System performance sample fed into the adaptive controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub processing_time_ms: f64,
    pub queue_depth: usize,
    pub frame_drop_rate: f64,
    pub error_rate: f64,
}

/// Feedback record produced by signing analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub feedback: String,
    pub confidence_score: f64,
    pub suggestions: Vec<String>,
    pub analysis_summary: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl FeedbackRecord {
    /// Canned record returned when analysis fails permanently.
    pub fn analysis_error(message: impl Into<String>) -> Self {
        Self {
            feedback: format!(
                "Analysis error: {}. Please try signing again.",
                message.into()
            ),
            confidence_score: 0.0,
            suggestions: vec![
                "Try signing again with clear movements".to_string(),
                "Ensure good lighting".to_string(),
            ],
            analysis_summary: "Analysis failed".to_string(),
            error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_monotone() {
        let all: Vec<QualitySettings> = QualityProfile::ALL
            .iter()
            .map(|p| QualitySettings::preset(*p))
            .collect();
        for pair in all.windows(2) {
            assert!(pair[0].jpeg_quality < pair[1].jpeg_quality);
            assert!(pair[0].resolution_scale <= pair[1].resolution_scale);
            assert!(pair[0].frame_rate < pair[1].frame_rate);
            assert!(pair[0].extractor_complexity <= pair[1].extractor_complexity);
            assert!(pair[0].batch_size >= pair[1].batch_size);
            assert!(pair[0].skip_frames >= pair[1].skip_frames);
        }
    }

    #[test]
    fn downgrade_clamps_at_ultra_low() {
        assert_eq!(
            QualityProfile::Low.downgraded(3),
            QualityProfile::UltraLow
        );
        assert_eq!(QualityProfile::High.downgraded(2), QualityProfile::Low);
    }
}
