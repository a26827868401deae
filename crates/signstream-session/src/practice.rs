//! Practice session — the per-client FSM over gesture detection
//!
//! Listening → Detecting → Analyzing → Feedback → Listening, with a cursor
//! over the story's target sentences; Idle when no session is running, and
//! `stop_session` resets to Idle from any mode. Exactly one instance per
//! client; every transition is driven from the pipeline worker.

use crate::gesture::{GestureDetector, GestureEnd, LandmarkSnapshot};
use signstream_core::config::GestureConfig;
use signstream_core::{DetectionFlags, FeedbackRecord};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PracticeMode {
    /// No session running.
    Idle,
    Listening,
    Detecting,
    Analyzing,
    Feedback,
    Completed,
}

impl PracticeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PracticeMode::Idle => "idle",
            PracticeMode::Listening => "listening",
            PracticeMode::Detecting => "detecting",
            PracticeMode::Analyzing => "analyzing",
            PracticeMode::Feedback => "feedback",
            PracticeMode::Completed => "completed",
        }
    }
}

/// A frozen gesture segment handed to the analysis dispatcher.
#[derive(Debug, Clone)]
pub struct CompletedSegment {
    pub target_sentence: String,
    pub snapshots: Vec<LandmarkSnapshot>,
    pub duration_ms: u64,
}

/// Per-frame FSM output: the session block for the response plus an optional
/// frozen segment on the detect→analyze edge.
pub struct PracticeUpdate {
    pub session_block: serde_json::Value,
    pub completed_segment: Option<CompletedSegment>,
}

pub struct PracticeSessionManager {
    active: bool,
    session_id: Option<String>,
    sentences: Vec<String>,
    sentence_index: usize,
    mode: PracticeMode,
    last_feedback: Option<FeedbackRecord>,
    analysis_in_progress: bool,
    detector: GestureDetector,
    gesture_started_at: Option<Instant>,
}

impl PracticeSessionManager {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            active: false,
            session_id: None,
            sentences: Vec::new(),
            sentence_index: 0,
            mode: PracticeMode::Idle,
            last_feedback: None,
            analysis_in_progress: false,
            detector: GestureDetector::new(config),
            gesture_started_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mode(&self) -> PracticeMode {
        self.mode
    }

    pub fn current_sentence(&self) -> Option<&str> {
        self.sentences.get(self.sentence_index).map(|s| s.as_str())
    }

    pub fn analysis_in_progress(&self) -> bool {
        self.analysis_in_progress
    }

    /// Start a practice session over the given sentences.
    pub fn start_session(
        &mut self,
        sentences: Vec<String>,
        session_id: Option<String>,
    ) -> serde_json::Value {
        if sentences.is_empty() {
            return serde_json::json!({
                "success": false,
                "error": "no sentences provided",
            });
        }

        self.active = true;
        self.sentences = sentences;
        self.sentence_index = 0;
        self.session_id = session_id.or_else(|| Some(uuid::Uuid::new_v4().to_string()));
        self.mode = PracticeMode::Listening;
        self.last_feedback = None;
        self.analysis_in_progress = false;
        self.detector.reset();
        self.gesture_started_at = None;

        info!(
            session_id = self.session_id.as_deref().unwrap_or(""),
            sentences = self.sentences.len(),
            "practice session started"
        );

        serde_json::json!({
            "success": true,
            "session_id": self.session_id,
            "total_sentences": self.sentences.len(),
            "current_sentence_index": self.sentence_index,
            "current_sentence": self.current_sentence(),
            "practice_mode": self.mode.as_str(),
        })
    }

    /// Drive the FSM with one frame's detection output.
    pub fn process_frame(
        &mut self,
        flags: DetectionFlags,
        hand_center: Option<[f32; 2]>,
        now: Instant,
    ) -> Option<PracticeUpdate> {
        if !self.active {
            return None;
        }

        let velocity = self.detector.update_velocity(flags, hand_center, now);
        let mut completed_segment = None;
        let mut gesture_started = false;
        let mut gesture_completed = false;

        match self.mode {
            PracticeMode::Listening => {
                if self.detector.detect_start(velocity, now) {
                    self.mode = PracticeMode::Detecting;
                    self.gesture_started_at = Some(now);
                    gesture_started = true;
                }
            }
            PracticeMode::Detecting => {
                self.detector.collect(LandmarkSnapshot {
                    flags,
                    hand_center,
                    captured_at: chrono::Utc::now(),
                });

                match self.detector.detect_end(velocity, now) {
                    GestureEnd::Completed => {
                        gesture_completed = true;
                        completed_segment = self.freeze_segment(now);
                        self.mode = PracticeMode::Analyzing;
                    }
                    GestureEnd::TooShort => {
                        self.mode = PracticeMode::Listening;
                        self.gesture_started_at = None;
                    }
                    GestureEnd::Continuing => {}
                }
            }
            PracticeMode::Idle
            | PracticeMode::Analyzing
            | PracticeMode::Feedback
            | PracticeMode::Completed => {}
        }

        let mut block = serde_json::json!({
            "practice_active": true,
            "session_id": self.session_id,
            "current_sentence": self.current_sentence(),
            "current_sentence_index": self.sentence_index,
            "practice_mode": self.mode.as_str(),
            "gesture_state": self.detector.state_snapshot(now),
            "analysis_in_progress": self.analysis_in_progress,
        });
        if gesture_started {
            block["gesture_started"] = true.into();
        }
        if gesture_completed {
            block["gesture_completed"] = true.into();
        }
        if self.mode == PracticeMode::Feedback {
            if let Some(feedback) = &self.last_feedback {
                block["feedback"] = serde_json::to_value(feedback).unwrap_or_default();
            }
        }

        Some(PracticeUpdate {
            session_block: block,
            completed_segment,
        })
    }

    fn freeze_segment(&mut self, now: Instant) -> Option<CompletedSegment> {
        let snapshots = self.detector.take_buffer();
        let Some(target) = self.current_sentence().map(String::from) else {
            warn!("gesture completed without a target sentence");
            self.set_analysis_error("No target sentence available");
            return None;
        };
        if snapshots.is_empty() {
            warn!("gesture completed with an empty buffer");
            self.set_analysis_error("No gesture data captured");
            return None;
        }

        let duration_ms = self
            .gesture_started_at
            .map(|s| now.duration_since(s).as_millis() as u64)
            .unwrap_or(0);
        self.gesture_started_at = None;
        self.analysis_in_progress = true;

        info!(
            frames = snapshots.len(),
            duration_ms, "gesture segment frozen for analysis"
        );

        Some(CompletedSegment {
            target_sentence: target,
            snapshots,
            duration_ms,
        })
    }

    /// Store an analysis result and transition to Feedback.
    pub fn set_analysis_result(&mut self, record: FeedbackRecord) {
        self.analysis_in_progress = false;
        self.mode = PracticeMode::Feedback;
        self.last_feedback = Some(record);
    }

    /// Store an error-feedback record and transition to Feedback.
    pub fn set_analysis_error(&mut self, message: &str) {
        self.analysis_in_progress = false;
        self.mode = PracticeMode::Feedback;
        self.last_feedback = Some(FeedbackRecord::analysis_error(message));
    }

    /// Handle a control action. Returns the wire result payload.
    pub fn handle_control(&mut self, action: &str, data: &serde_json::Value) -> serde_json::Value {
        match action {
            "start_session" => {
                let sentences = data
                    .get("sentences")
                    .or_else(|| data.get("story_sentences"))
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|s| s.as_str().map(String::from))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let session_id = data
                    .get("id")
                    .or_else(|| data.get("session_id"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                self.start_session(sentences, session_id)
            }
            "next_sentence" => self.next_sentence(),
            "try_again" => self.try_again(),
            "stop_session" => self.stop_session(),
            "complete_story" => self.complete_story(),
            "set_feedback" => self.set_feedback(data),
            other => serde_json::json!({
                "success": false,
                "error": format!("unknown action: {other}"),
            }),
        }
    }

    fn next_sentence(&mut self) -> serde_json::Value {
        if self.sentence_index + 1 < self.sentences.len() {
            self.sentence_index += 1;
            self.mode = PracticeMode::Listening;
            self.last_feedback = None;
            self.detector.reset();
            serde_json::json!({
                "success": true,
                "action": "next_sentence",
                "current_sentence_index": self.sentence_index,
                "current_sentence": self.current_sentence(),
                "practice_mode": self.mode.as_str(),
                "is_last_sentence": self.sentence_index + 1 == self.sentences.len(),
            })
        } else {
            info!("story practice completed");
            serde_json::json!({
                "success": true,
                "action": "story_completed",
                "total_sentences": self.sentences.len(),
            })
        }
    }

    fn try_again(&mut self) -> serde_json::Value {
        self.mode = PracticeMode::Listening;
        self.last_feedback = None;
        self.detector.reset();
        serde_json::json!({
            "success": true,
            "action": "try_again",
            "current_sentence_index": self.sentence_index,
            "current_sentence": self.current_sentence(),
            "practice_mode": self.mode.as_str(),
        })
    }

    fn stop_session(&mut self) -> serde_json::Value {
        self.active = false;
        self.mode = PracticeMode::Idle;
        self.detector.reset();
        self.analysis_in_progress = false;
        self.gesture_started_at = None;
        info!(
            session_id = self.session_id.as_deref().unwrap_or(""),
            "practice session stopped"
        );
        serde_json::json!({
            "success": true,
            "action": "session_stopped",
            "session_id": self.session_id,
            "practice_mode": self.mode.as_str(),
        })
    }

    fn complete_story(&mut self) -> serde_json::Value {
        self.mode = PracticeMode::Completed;
        self.last_feedback = None;
        serde_json::json!({
            "success": true,
            "action": "story_completed",
            "session_id": self.session_id,
            "total_sentences": self.sentences.len(),
            "practice_mode": self.mode.as_str(),
        })
    }

    fn set_feedback(&mut self, data: &serde_json::Value) -> serde_json::Value {
        match data
            .get("feedback")
            .and_then(|f| serde_json::from_value::<FeedbackRecord>(f.clone()).ok())
        {
            Some(record) => {
                self.set_analysis_result(record);
                serde_json::json!({
                    "success": true,
                    "action": "feedback_set",
                    "practice_mode": self.mode.as_str(),
                })
            }
            None => serde_json::json!({
                "success": false,
                "error": "no feedback data provided",
            }),
        }
    }

    pub fn session_state(&self, now: Instant) -> serde_json::Value {
        serde_json::json!({
            "is_active": self.active,
            "session_id": self.session_id,
            "current_sentence": self.current_sentence(),
            "current_sentence_index": self.sentence_index,
            "total_sentences": self.sentences.len(),
            "practice_mode": self.mode.as_str(),
            "analysis_in_progress": self.analysis_in_progress,
            "gesture_state": if self.active {
                self.detector.state_snapshot(now)
            } else {
                serde_json::Value::Null
            },
        })
    }
}
