//! Analysis dispatch — ships a frozen gesture segment to the scoring service
//!
//! Runs off the pipeline's hot path: the worker keeps serving frames while
//! the scoring call is in flight. At most one analysis per client is in
//! flight, gated by the FSM's Analyzing state.

use crate::practice::CompletedSegment;
use signstream_core::FeedbackRecord;
use signstream_llm::{AnalysisService, SegmentSummary};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Result delivered back to the pipeline worker.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub target_sentence: String,
    pub record: FeedbackRecord,
}

pub struct AnalysisDispatcher {
    service: Arc<AnalysisService>,
}

impl AnalysisDispatcher {
    pub fn new(service: Arc<AnalysisService>) -> Self {
        Self { service }
    }

    /// Spawn the scoring call. Retries/backoff live inside the LLM client;
    /// permanent failure degrades to the canned error-feedback record, so an
    /// outcome is always delivered.
    pub fn dispatch(&self, segment: CompletedSegment, result_tx: mpsc::Sender<AnalysisOutcome>) {
        let service = self.service.clone();
        let summary = summarize(&segment);
        let target = segment.target_sentence;

        tokio::spawn(async move {
            let record = match service.analyze_signing(&summary, &target).await {
                Ok(record) => {
                    info!(
                        target_sentence = %target,
                        confidence = record.confidence_score,
                        "signing analysis completed"
                    );
                    record
                }
                Err(e) => {
                    warn!(target_sentence = %target, error = %e, "signing analysis failed");
                    FeedbackRecord::analysis_error(e.to_string())
                }
            };

            let _ = result_tx
                .send(AnalysisOutcome {
                    target_sentence: target,
                    record,
                })
                .await;
        });
    }
}

fn summarize(segment: &CompletedSegment) -> SegmentSummary {
    let total = segment.snapshots.len().max(1) as f64;
    let count = |f: fn(&signstream_core::DetectionFlags) -> bool| {
        segment.snapshots.iter().filter(|s| f(&s.flags)).count() as f64 / total
    };
    SegmentSummary {
        frame_count: segment.snapshots.len(),
        duration_ms: segment.duration_ms,
        hands_ratio: count(|f| f.hands),
        face_ratio: count(|f| f.face),
        pose_ratio: count(|f| f.pose),
    }
}
