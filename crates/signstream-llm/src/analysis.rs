//! Signing-attempt analysis — scores a captured gesture segment
//!
//! The gesture buffer itself never leaves the server; analysis works from a
//! compact summary of the segment plus the target sentence.

use crate::client::{LlmClient, LlmError};
use crate::types::ChatMessage;
use serde::Deserialize;
use signstream_core::FeedbackRecord;
use std::sync::Arc;
use tracing::info;

/// Compact description of a frozen gesture segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentSummary {
    pub frame_count: usize,
    pub duration_ms: u64,
    /// Fraction of snapshots with each landmark group detected.
    pub hands_ratio: f64,
    pub face_ratio: f64,
    pub pose_ratio: f64,
}

#[derive(Debug, Deserialize)]
struct AnalysisReply {
    feedback: String,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    analysis_summary: String,
}

pub struct AnalysisService {
    client: Arc<LlmClient>,
    model: String,
}

impl AnalysisService {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Score a signing attempt against its target sentence. Retries are
    /// handled inside the client; callers degrade to
    /// [`FeedbackRecord::analysis_error`] on `Err`.
    pub async fn analyze_signing(
        &self,
        summary: &SegmentSummary,
        target_sentence: &str,
    ) -> Result<FeedbackRecord, LlmError> {
        info!(
            target_sentence,
            frames = summary.frame_count,
            duration_ms = summary.duration_ms,
            "analyzing signing attempt"
        );

        let prompt = analysis_prompt(summary, target_sentence);
        let value = self
            .client
            .chat_json(&self.model, vec![ChatMessage::user(prompt)])
            .await?;

        let reply: AnalysisReply = serde_json::from_value(value)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if reply.feedback.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty feedback".to_string()));
        }

        Ok(FeedbackRecord {
            feedback: reply.feedback,
            confidence_score: reply.confidence_score.clamp(0.0, 1.0),
            suggestions: reply.suggestions,
            analysis_summary: reply.analysis_summary,
            error: false,
        })
    }
}

fn analysis_prompt(summary: &SegmentSummary, target_sentence: &str) -> String {
    format!(
        "You are an encouraging ASL tutor. A learner just attempted to sign the sentence \
         \"{target_sentence}\". Motion capture summary: {frames} frames over {duration} ms; \
         hands visible in {hands:.0}% of frames, face in {face:.0}%, body pose in {pose:.0}%. \
         Give constructive feedback on the attempt. Respond with ONLY a valid JSON object: \
         {{\"feedback\": \"...\", \"confidence_score\": 0.0-1.0, \
         \"suggestions\": [\"...\"], \"analysis_summary\": \"...\"}}",
        frames = summary.frame_count,
        duration = summary.duration_ms,
        hands = summary.hands_ratio * 100.0,
        face = summary.face_ratio * 100.0,
        pose = summary.pose_ratio * 100.0,
    )
}
