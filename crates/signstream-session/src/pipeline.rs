//! Per-client processing pipeline
//!
//! One worker task per client: dequeues from the session's ingress queue,
//! runs decode → scale → extract → FSM → encode, feeds metrics into the
//! adaptive controller, and pushes responses onto the egress channel.
//! CPU-bound work runs on the blocking pool; the FSM only ever transitions
//! on this worker.

use crate::dispatch::{AnalysisDispatcher, AnalysisOutcome};
use crate::monitor::{EnforcementAction, ResourceMonitor};
use crate::practice::PracticeSessionManager;
use crate::quality::AdaptiveQualityController;
use crate::queue::MessageQueue;
use crate::stats::PipelineStats;
use signstream_core::config::AppConfig;
use signstream_core::{
    ClientId, ControlAction, DetectionFlags, FrameMetadata, NetworkMetrics, PerformanceMetrics,
    ProcessedFrameMetadata, QualityProfile, ServerMessage,
};
use signstream_llm::AnalysisService;
use signstream_media::{
    decode_base64_frame, encode_frame_to_base64, scale_frame, CodecError, LandmarkExtractor,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Micro-batch collapse timer.
const MICRO_BATCH_TIMEOUT: Duration = Duration::from_millis(50);
/// Consecutive frame failures before the client is told to reconnect.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const INGRESS_WAIT: Duration = Duration::from_secs(1);

/// Commands consumed by the pipeline worker.
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    Frame {
        frame_data: String,
        metadata: FrameMetadata,
    },
    Control {
        action: ControlAction,
        data: serde_json::Value,
    },
    StatsRequest,
    ForceProfile {
        profile: QualityProfile,
    },
}

/// Egress envelope: the message plus its delivery class.
#[derive(Debug)]
pub struct Outbound {
    pub message: ServerMessage,
    pub priority: bool,
    pub may_batch: bool,
}

impl Outbound {
    pub fn priority(message: ServerMessage) -> Self {
        Self {
            message,
            priority: true,
            may_batch: false,
        }
    }

    pub fn batched(message: ServerMessage) -> Self {
        Self {
            message,
            priority: false,
            may_batch: true,
        }
    }
}

pub struct ProcessingPipeline {
    client_id: ClientId,
    extractor: Arc<dyn LandmarkExtractor>,
    practice: PracticeSessionManager,
    quality: AdaptiveQualityController,
    stats: Arc<PipelineStats>,
    monitor: ResourceMonitor,
    dispatcher: AnalysisDispatcher,
    egress: mpsc::Sender<Outbound>,
    ingress: Arc<MessageQueue<PipelineCommand>>,
    analysis_tx: mpsc::Sender<AnalysisOutcome>,
    server_frame_number: u64,
    skip_counter: u32,
    micro_batch: Vec<(String, FrameMetadata)>,
    batch_deadline: Option<Instant>,
    consecutive_failures: u32,
}

impl ProcessingPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: ClientId,
        config: &AppConfig,
        extractor: Arc<dyn LandmarkExtractor>,
        analysis: Arc<AnalysisService>,
        egress: mpsc::Sender<Outbound>,
        ingress: Arc<MessageQueue<PipelineCommand>>,
        stats: Arc<PipelineStats>,
    ) -> (Self, mpsc::Receiver<AnalysisOutcome>) {
        let (analysis_tx, analysis_rx) = mpsc::channel(8);
        let initial = config.video.default_quality_profile();
        stats.set_profile(initial);
        let pipeline = Self {
            quality: AdaptiveQualityController::new(client_id.clone(), initial),
            practice: PracticeSessionManager::new(config.gesture.clone()),
            monitor: ResourceMonitor::new(config.limits.clone()),
            dispatcher: AnalysisDispatcher::new(analysis),
            client_id,
            extractor,
            stats,
            egress,
            ingress,
            analysis_tx,
            server_frame_number: 0,
            skip_counter: 0,
            micro_batch: Vec::new(),
            batch_deadline: None,
            consecutive_failures: 0,
        };
        (pipeline, analysis_rx)
    }

    pub async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::Frame {
                frame_data,
                metadata,
            } => self.handle_frame(frame_data, metadata).await,
            PipelineCommand::Control { action, data } => self.handle_control(action, data).await,
            PipelineCommand::StatsRequest => self.handle_stats_request().await,
            PipelineCommand::ForceProfile { profile } => {
                let settings = self.quality.force_profile(profile, Instant::now());
                self.stats.set_profile(settings.profile);
            }
        }
    }

    async fn handle_frame(&mut self, frame_data: String, metadata: FrameMetadata) {
        let pipeline_start = Instant::now();
        self.ingest_network_metrics(&metadata);

        let settings = self.quality.current();

        // skip-frame gate: process 1 of every skip_frames + 1
        if settings.skip_frames > 0 {
            let position = self.skip_counter;
            self.skip_counter = (self.skip_counter + 1) % (settings.skip_frames + 1);
            if position != 0 {
                self.stats.record_skipped();
                let response = ServerMessage::ProcessedFrame {
                    frame_data: Some(frame_data),
                    landmarks_detected: DetectionFlags::none(),
                    metadata: ProcessedFrameMetadata {
                        frame_number: metadata.frame_number,
                        server_frame_number: self.server_frame_number,
                        processing_time_ms: 0.0,
                        total_pipeline_time_ms: elapsed_ms(pipeline_start),
                        quality_profile: Some(settings.profile),
                        skipped: true,
                        frames_collapsed: None,
                        timestamp: now_iso(),
                    },
                    success: true,
                    fallback: false,
                    error: None,
                    practice_session: None,
                };
                self.send(Outbound::batched(response)).await;
                return;
            }
        } else {
            self.skip_counter = 0;
        }

        // micro-batch collapse: only the most recent frame gets processed
        if settings.batch_size > 1 {
            self.micro_batch.push((frame_data, metadata));
            if self.micro_batch.len() >= settings.batch_size {
                self.flush_micro_batch().await;
            } else if self.micro_batch.len() == 1 {
                self.batch_deadline = Some(Instant::now() + MICRO_BATCH_TIMEOUT);
            }
            return;
        }

        self.process_now(frame_data, metadata, None, pipeline_start)
            .await;
    }

    /// Flush the pending micro-batch if its timer has fired.
    pub async fn maybe_flush_batch(&mut self) {
        if let Some(deadline) = self.batch_deadline {
            if Instant::now() >= deadline {
                self.flush_micro_batch().await;
            }
        }
    }

    async fn flush_micro_batch(&mut self) {
        self.batch_deadline = None;
        if self.micro_batch.is_empty() {
            return;
        }
        let total = self.micro_batch.len();
        let (frame_data, metadata) = self.micro_batch.pop().expect("non-empty");
        let dropped = self.micro_batch.len();
        self.micro_batch.clear();
        if dropped > 0 {
            self.stats.record_dropped(dropped as u64);
        }
        self.process_now(frame_data, metadata, Some(total), Instant::now())
            .await;
    }

    async fn process_now(
        &mut self,
        frame_data: String,
        metadata: FrameMetadata,
        collapsed: Option<usize>,
        pipeline_start: Instant,
    ) {
        let settings = self.quality.current();
        let extractor = self.extractor.clone();
        let input = frame_data;
        let original = input.clone();
        let processing_start = Instant::now();

        let processed = tokio::task::spawn_blocking(move || {
            let frame = decode_base64_frame(&input)?;
            let scaled = scale_frame(frame, settings.resolution_scale);
            let extraction = extractor.extract(&scaled, settings.extractor_complexity);
            let encoded = encode_frame_to_base64(&extraction.frame, &settings)?;
            Ok::<_, CodecError>((encoded, extraction.flags, extraction.hand_center))
        })
        .await;

        let (encoded, flags, hand_center) = match processed {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.frame_failure(original, metadata, e.to_string(), pipeline_start)
                    .await;
                return;
            }
            Err(e) => {
                error!(client = %self.client_id, error = %e, "processing task aborted");
                self.frame_failure(original, metadata, "processing task aborted".into(), pipeline_start)
                    .await;
                return;
            }
        };

        let processing_time = processing_start.elapsed();
        let now = Instant::now();
        self.consecutive_failures = 0;
        self.server_frame_number += 1;
        self.stats.record_processed(processing_time);

        let mut practice_block = None;
        if self.practice.is_active() {
            if let Some(update) = self.practice.process_frame(flags, hand_center, now) {
                practice_block = Some(update.session_block);
                if let Some(segment) = update.completed_segment {
                    self.dispatcher.dispatch(segment, self.analysis_tx.clone());
                }
            }
        }

        self.push_performance_metrics(processing_time.as_secs_f64() * 1000.0, now);

        let response = ServerMessage::ProcessedFrame {
            frame_data: Some(encoded),
            landmarks_detected: flags,
            metadata: ProcessedFrameMetadata {
                frame_number: metadata.frame_number,
                server_frame_number: self.server_frame_number,
                processing_time_ms: processing_time.as_secs_f64() * 1000.0,
                total_pipeline_time_ms: elapsed_ms(pipeline_start),
                quality_profile: Some(settings.profile),
                skipped: false,
                frames_collapsed: collapsed,
                timestamp: now_iso(),
            },
            success: true,
            fallback: false,
            error: None,
            practice_session: practice_block,
        };
        self.send(Outbound::batched(response)).await;
    }

    /// Per-frame errors never kill the session: echo the original frame as a
    /// fallback, or tell the client to reconnect after repeated failures.
    async fn frame_failure(
        &mut self,
        original: String,
        metadata: FrameMetadata,
        error: String,
        pipeline_start: Instant,
    ) {
        self.stats.record_error();
        self.consecutive_failures += 1;
        warn!(
            client = %self.client_id,
            failures = self.consecutive_failures,
            error = %error,
            "frame processing failed"
        );

        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            let response = ServerMessage::critical_error(format!(
                "repeated processing failures: {error}"
            ));
            self.send(Outbound::priority(response)).await;
            return;
        }

        self.stats.record_fallback();
        let response = ServerMessage::ProcessedFrame {
            frame_data: Some(original),
            landmarks_detected: DetectionFlags::none(),
            metadata: ProcessedFrameMetadata {
                frame_number: metadata.frame_number,
                server_frame_number: self.server_frame_number,
                processing_time_ms: 0.0,
                total_pipeline_time_ms: elapsed_ms(pipeline_start),
                quality_profile: Some(self.quality.current().profile),
                skipped: false,
                frames_collapsed: None,
                timestamp: now_iso(),
            },
            success: true,
            fallback: true,
            error: Some(error),
            practice_session: None,
        };
        self.send(Outbound::batched(response)).await;
    }

    async fn handle_control(&mut self, action: ControlAction, data: serde_json::Value) {
        debug!(client = %self.client_id, action = action.as_str(), "control message");
        let result = self.practice.handle_control(action.as_str(), &data);
        let success = result
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let response = match action {
            ControlAction::StartSession => {
                ServerMessage::PracticeSessionResponse { success, result }
            }
            _ => ServerMessage::ControlResponse {
                action: action.as_str().to_string(),
                success,
                result,
            },
        };
        self.send(Outbound::priority(response)).await;
    }

    async fn handle_stats_request(&mut self) {
        let now = Instant::now();
        let response = ServerMessage::Stats {
            data: serde_json::json!({
                "client_id": self.client_id.as_str(),
                "pipeline": self.stats.snapshot(),
                "quality": self.quality.stats_snapshot(now),
                "practice": self.practice.session_state(now),
                "ingress_queue": self.ingress.stats(),
            }),
        };
        self.send(Outbound::priority(response)).await;
    }

    /// Deliver a finished analysis: update the FSM and emit `asl_feedback`.
    pub async fn handle_analysis(&mut self, outcome: AnalysisOutcome) {
        info!(
            client = %self.client_id,
            target_sentence = %outcome.target_sentence,
            error = outcome.record.error,
            "delivering analysis feedback"
        );
        self.practice.set_analysis_result(outcome.record.clone());
        let response = ServerMessage::AslFeedback {
            data: signstream_core::FeedbackPayload::from_record(
                outcome.target_sentence,
                outcome.record,
            ),
        };
        self.send(Outbound::batched(response)).await;
    }

    /// Adaptation tick: refresh resource readings, enforce soft limits, and
    /// run one controller cycle.
    pub async fn run_adaptation(&mut self) {
        let now = Instant::now();
        self.monitor.sample();

        if self.monitor.check_limits() == EnforcementAction::Downgrade {
            let target = self.quality.current().profile.downgraded(1);
            if target != self.quality.current().profile {
                let settings = self.quality.force_profile(target, now);
                self.stats.record_adaptation(settings.profile);
            }
        }

        if let Some(settings) = self.quality.adapt(now) {
            self.stats.record_adaptation(settings.profile);
        }
    }

    fn ingest_network_metrics(&mut self, metadata: &FrameMetadata) {
        let latency = metadata.network_latency_ms.unwrap_or(0.0);
        let throughput = metadata.throughput_mbps.unwrap_or(0.0);
        if latency <= 0.0 && throughput <= 0.0 {
            return;
        }
        let metrics = NetworkMetrics {
            latency_ms: latency,
            throughput_mbps: throughput,
            bandwidth_mbps: throughput,
            packet_loss_percent: 0.0,
            jitter_ms: 0.0,
        };
        self.quality.update_network_metrics(metrics, Instant::now());
    }

    fn push_performance_metrics(&mut self, processing_time_ms: f64, now: Instant) {
        let sample = self.monitor.cached();
        let metrics = PerformanceMetrics {
            cpu_usage_percent: sample.cpu_percent,
            memory_usage_percent: sample.memory_percent,
            processing_time_ms,
            queue_depth: self.ingress.depth(),
            frame_drop_rate: self.stats.drop_rate_percent(),
            error_rate: self.stats.error_rate_percent(),
        };
        self.quality.update_performance_metrics(metrics, now);
    }

    /// How long the worker may wait on the ingress queue before the pending
    /// micro-batch must be flushed.
    pub fn ingress_wait(&self) -> Duration {
        match self.batch_deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(INGRESS_WAIT)
                .max(Duration::from_millis(1)),
            None => INGRESS_WAIT,
        }
    }

    async fn send(&self, outbound: Outbound) {
        if self.egress.send(outbound).await.is_err() {
            debug!(client = %self.client_id, "egress closed, response suppressed");
        }
    }
}

/// The cooperative worker driving one client's pipeline.
pub struct PipelineWorker {
    pipeline: ProcessingPipeline,
    analysis_rx: mpsc::Receiver<AnalysisOutcome>,
    cancel: CancellationToken,
}

impl PipelineWorker {
    pub fn new(
        pipeline: ProcessingPipeline,
        analysis_rx: mpsc::Receiver<AnalysisOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            analysis_rx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        debug!(client = %self.pipeline.client_id, "pipeline worker started");
        let mut adapt_tick = tokio::time::interval(Duration::from_secs(1));
        adapt_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ingress = self.pipeline.ingress.clone();

        loop {
            let wait = self.pipeline.ingress_wait();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = adapt_tick.tick() => {
                    self.pipeline.run_adaptation().await;
                }
                Some(outcome) = self.analysis_rx.recv() => {
                    self.pipeline.handle_analysis(outcome).await;
                }
                command = ingress.dequeue(wait) => {
                    if let Some(command) = command {
                        self.pipeline.handle_command(command.content).await;
                    }
                    self.pipeline.maybe_flush_batch().await;
                }
            }
        }
        debug!(client = %self.pipeline.client_id, "pipeline worker stopped");
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
