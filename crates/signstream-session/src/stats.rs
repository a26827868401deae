//! Per-client pipeline counters — monotone, lock-free, shared between the
//! socket reader, the pipeline worker, and stats snapshots.

use signstream_core::QualityProfile;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct PipelineStats {
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    frames_skipped: AtomicU64,
    fallback_frames: AtomicU64,
    errors: AtomicU64,
    queue_overflows: AtomicU64,
    quality_adaptations: AtomicU64,
    total_processing_micros: AtomicU64,
    peak_processing_micros: AtomicU64,
    current_profile: AtomicU8,
}

impl PipelineStats {
    pub fn new(initial_profile: QualityProfile) -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            fallback_frames: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
            quality_adaptations: AtomicU64::new(0),
            total_processing_micros: AtomicU64::new(0),
            peak_processing_micros: AtomicU64::new(0),
            current_profile: AtomicU8::new(initial_profile as u8),
        }
    }

    pub fn record_processed(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.peak_processing_micros
            .fetch_max(micros, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_adaptation(&self, new_profile: QualityProfile) {
        self.quality_adaptations.fetch_add(1, Ordering::Relaxed);
        self.current_profile
            .store(new_profile as u8, Ordering::Relaxed);
    }

    pub fn set_profile(&self, profile: QualityProfile) {
        self.current_profile.store(profile as u8, Ordering::Relaxed);
    }

    pub fn current_profile(&self) -> QualityProfile {
        let idx = self.current_profile.load(Ordering::Relaxed) as usize;
        QualityProfile::ALL[idx.min(QualityProfile::ALL.len() - 1)]
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn total_frames(&self) -> u64 {
        self.frames_processed() + self.frames_dropped() + self.frames_skipped()
    }

    /// Dropped frames as a percentage of all frames seen.
    pub fn drop_rate_percent(&self) -> f64 {
        let total = self.total_frames();
        if total == 0 {
            return 0.0;
        }
        self.frames_dropped() as f64 / total as f64 * 100.0
    }

    /// Errors as a percentage of all frames seen.
    pub fn error_rate_percent(&self) -> f64 {
        let total = self.total_frames();
        if total == 0 {
            return 0.0;
        }
        self.errors() as f64 / total as f64 * 100.0
    }

    pub fn avg_processing_ms(&self) -> f64 {
        let processed = self.frames_processed();
        if processed == 0 {
            return 0.0;
        }
        self.total_processing_micros.load(Ordering::Relaxed) as f64 / processed as f64 / 1000.0
    }

    pub fn peak_processing_ms(&self) -> f64 {
        self.peak_processing_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "frames_processed": self.frames_processed(),
            "frames_dropped": self.frames_dropped(),
            "frames_skipped": self.frames_skipped(),
            "fallback_frames": self.fallback_frames.load(Ordering::Relaxed),
            "errors": self.errors(),
            "queue_overflows": self.queue_overflows.load(Ordering::Relaxed),
            "quality_adaptations": self.quality_adaptations.load(Ordering::Relaxed),
            "avg_processing_time_ms": self.avg_processing_ms(),
            "peak_processing_time_ms": self.peak_processing_ms(),
            "drop_rate_percent": self.drop_rate_percent(),
            "error_rate_percent": self.error_rate_percent(),
            "current_profile": self.current_profile().as_str(),
        })
    }
}
