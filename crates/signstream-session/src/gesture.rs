//! Gesture detection — segments a signing attempt out of the frame stream
//!
//! Velocity is the Euclidean distance between successive hand centroids over
//! the wall-clock delta, smoothed over a small window. Timestamps are passed
//! in by the pipeline worker so the detector stays deterministic under test.

use signstream_core::config::GestureConfig;
use signstream_core::DetectionFlags;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info};

/// One buffered landmark observation. The payload beyond the flags is opaque
/// to the state machine.
#[derive(Debug, Clone)]
pub struct LandmarkSnapshot {
    pub flags: DetectionFlags,
    pub hand_center: Option<[f32; 2]>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of an end-of-gesture check while detecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureEnd {
    /// Still moving or still within the pause window.
    Continuing,
    /// Paused long enough but the gesture was shorter than the minimum.
    TooShort,
    /// Gesture completed; the buffer is ready to freeze.
    Completed,
}

pub struct GestureDetector {
    config: GestureConfig,
    detecting: bool,
    gesture_start: Option<Instant>,
    last_movement: Option<Instant>,
    buffer: VecDeque<LandmarkSnapshot>,
    velocity_history: VecDeque<f64>,
    prev_center: Option<[f32; 2]>,
    prev_sample_at: Option<Instant>,
}

impl GestureDetector {
    pub fn new(config: GestureConfig) -> Self {
        info!(
            velocity_threshold = config.velocity_threshold,
            "gesture detector initialized"
        );
        Self {
            config,
            detecting: false,
            gesture_start: None,
            last_movement: None,
            buffer: VecDeque::new(),
            velocity_history: VecDeque::new(),
            prev_center: None,
            prev_sample_at: None,
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting
    }

    /// Feed one frame's observation and get the smoothed hand velocity in
    /// normalized units per second. Hands absent clears tracking and reads 0.
    pub fn update_velocity(
        &mut self,
        flags: DetectionFlags,
        hand_center: Option<[f32; 2]>,
        now: Instant,
    ) -> f64 {
        let center = match (flags.hands, hand_center) {
            (true, Some(c)) => c,
            _ => {
                self.prev_center = None;
                self.prev_sample_at = None;
                return 0.0;
            }
        };

        let smoothed = if let (Some(prev), Some(prev_at)) = (self.prev_center, self.prev_sample_at)
        {
            let dt = now.duration_since(prev_at).as_secs_f64();
            if dt > 0.0 {
                let dx = (center[0] - prev[0]) as f64;
                let dy = (center[1] - prev[1]) as f64;
                let velocity = (dx * dx + dy * dy).sqrt() / dt;

                self.velocity_history.push_back(velocity);
                while self.velocity_history.len() > self.config.smoothing_window {
                    self.velocity_history.pop_front();
                }
                self.velocity_history.iter().sum::<f64>() / self.velocity_history.len() as f64
            } else {
                self.velocity_history.back().copied().unwrap_or(0.0)
            }
        } else {
            0.0
        };

        self.prev_center = Some(center);
        self.prev_sample_at = Some(now);
        smoothed
    }

    /// Check for a gesture start while listening. Arms the segment buffer.
    pub fn detect_start(&mut self, velocity: f64, now: Instant) -> bool {
        if !self.config.enabled || self.detecting {
            return false;
        }
        if velocity > self.config.velocity_threshold {
            self.detecting = true;
            self.gesture_start = Some(now);
            self.last_movement = Some(now);
            self.buffer.clear();
            info!(velocity, "gesture start detected");
            return true;
        }
        false
    }

    /// Check for a gesture end while detecting.
    pub fn detect_end(&mut self, velocity: f64, now: Instant) -> GestureEnd {
        if !self.config.enabled || !self.detecting {
            return GestureEnd::Continuing;
        }

        if velocity > self.config.velocity_threshold {
            self.last_movement = Some(now);
            return GestureEnd::Continuing;
        }

        let Some(last_movement) = self.last_movement else {
            return GestureEnd::Continuing;
        };
        let pause_ms = now.duration_since(last_movement).as_millis() as u64;
        if pause_ms < self.config.pause_duration_ms {
            return GestureEnd::Continuing;
        }

        let gesture_ms = self
            .gesture_start
            .map(|s| now.duration_since(s).as_millis() as u64)
            .unwrap_or(0);

        if gesture_ms >= self.config.min_gesture_duration_ms {
            self.detecting = false;
            info!(gesture_ms, pause_ms, "gesture end detected");
            GestureEnd::Completed
        } else {
            debug!(gesture_ms, "gesture too short, resetting");
            self.reset();
            GestureEnd::TooShort
        }
    }

    /// Buffer a snapshot while detecting, FIFO-evicting past the cap.
    pub fn collect(&mut self, snapshot: LandmarkSnapshot) {
        if !self.config.enabled || !self.detecting {
            return;
        }
        self.buffer.push_back(snapshot);
        while self.buffer.len() > self.config.landmark_buffer_size {
            self.buffer.pop_front();
        }
    }

    /// Freeze and take the captured segment buffer.
    pub fn take_buffer(&mut self) -> Vec<LandmarkSnapshot> {
        self.buffer.drain(..).collect()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Gesture duration so far, in milliseconds.
    pub fn gesture_duration_ms(&self, now: Instant) -> Option<u64> {
        self.gesture_start
            .filter(|_| self.detecting)
            .map(|s| now.duration_since(s).as_millis() as u64)
    }

    pub fn reset(&mut self) {
        self.detecting = false;
        self.gesture_start = None;
        self.last_movement = None;
        self.buffer.clear();
        self.velocity_history.clear();
        self.prev_center = None;
        self.prev_sample_at = None;
    }

    pub fn state_snapshot(&self, now: Instant) -> serde_json::Value {
        let mut state = serde_json::json!({
            "is_detecting": self.detecting,
            "buffer_size": self.buffer.len(),
            "enabled": self.config.enabled,
        });
        if let Some(duration) = self.gesture_duration_ms(now) {
            state["gesture_duration_ms"] = duration.into();
            let pause = self
                .last_movement
                .map(|m| now.duration_since(m).as_millis() as u64)
                .unwrap_or(0);
            state["pause_duration_ms"] = pause.into();
        }
        state
    }
}
