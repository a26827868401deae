//! Wire protocol — UTF-8 JSON frames over a persistent WebSocket
//!
//! Client → Server:
//!   { "type": "raw_frame", "frame_data": "<base64 jpeg>", "metadata": { "frame_number": 7 } }
//!   { "type": "control", "action": "start_session", "data": { ... } }
//!   { "type": "ping", "timestamp": 1712.5 }
//!   { "type": "stats_request" }
//!
//! Server → Client: tagged responses (`processed_frame`, `asl_feedback`, ...)
//! plus `batch` wrappers for non-priority egress.

use crate::types::{DetectionFlags, FeedbackRecord, QualityProfile};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Client-to-server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "raw_frame")]
    RawFrame {
        frame_data: String,
        #[serde(default)]
        metadata: FrameMetadata,
    },

    #[serde(rename = "control")]
    Control {
        action: ControlAction,
        #[serde(default)]
        data: serde_json::Value,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: f64 },

    #[serde(rename = "stats_request")]
    StatsRequest,
}

/// Client-reported frame metadata, echoed network observations included.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMetadata {
    #[serde(default)]
    pub frame_number: u64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub network_latency_ms: Option<f64>,
    #[serde(default)]
    pub throughput_mbps: Option<f64>,
}

/// Practice-session control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    StartSession,
    NextSentence,
    TryAgain,
    StopSession,
    CompleteStory,
    SetFeedback,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::StartSession => "start_session",
            ControlAction::NextSentence => "next_sentence",
            ControlAction::TryAgain => "try_again",
            ControlAction::StopSession => "stop_session",
            ControlAction::CompleteStory => "complete_story",
            ControlAction::SetFeedback => "set_feedback",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Server-to-client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        client_id: String,
        features: Vec<String>,
        server_info: serde_json::Value,
        timestamp: String,
    },

    #[serde(rename = "processed_frame")]
    ProcessedFrame {
        #[serde(skip_serializing_if = "Option::is_none")]
        frame_data: Option<String>,
        landmarks_detected: DetectionFlags,
        metadata: ProcessedFrameMetadata,
        success: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        fallback: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        practice_session: Option<serde_json::Value>,
    },

    #[serde(rename = "asl_feedback")]
    AslFeedback { data: FeedbackPayload },

    #[serde(rename = "control_response")]
    ControlResponse {
        action: String,
        success: bool,
        result: serde_json::Value,
    },

    #[serde(rename = "practice_session_response")]
    PracticeSessionResponse {
        success: bool,
        result: serde_json::Value,
    },

    #[serde(rename = "stats")]
    Stats { data: serde_json::Value },

    #[serde(rename = "keepalive")]
    Keepalive { timestamp: String },

    #[serde(rename = "pong")]
    Pong { timestamp: f64 },

    #[serde(rename = "ping")]
    Ping { timestamp: String },

    #[serde(rename = "batch")]
    Batch {
        count: usize,
        messages: Vec<ServerMessage>,
        timestamp: String,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        error_code: String,
        error_id: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        retry_allowed: bool,
    },

    #[serde(rename = "critical_error")]
    CriticalError {
        message: String,
        error_id: String,
        requires_reconnection: bool,
    },

    #[serde(rename = "server_shutdown")]
    ServerShutdown { message: String, timestamp: String },
}

/// Per-frame processing metadata returned to the client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessedFrameMetadata {
    pub frame_number: u64,
    pub server_frame_number: u64,
    pub processing_time_ms: f64,
    pub total_pipeline_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_profile: Option<QualityProfile>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_collapsed: Option<usize>,
    pub timestamp: String,
}

/// Payload of an `asl_feedback` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPayload {
    pub target_sentence: String,
    pub feedback: String,
    pub confidence_score: f64,
    pub suggestions: Vec<String>,
    pub analysis_summary: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl FeedbackPayload {
    pub fn from_record(target_sentence: impl Into<String>, record: FeedbackRecord) -> Self {
        Self {
            target_sentence: target_sentence.into(),
            feedback: record.feedback,
            confidence_score: record.confidence_score,
            suggestions: record.suggestions,
            analysis_summary: record.analysis_summary,
            error: record.error,
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            error_code: error_code.into(),
            error_id: uuid::Uuid::new_v4().to_string(),
            retry_allowed: false,
        }
    }

    pub fn retryable_error(message: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            error_code: error_code.into(),
            error_id: uuid::Uuid::new_v4().to_string(),
            retry_allowed: true,
        }
    }

    pub fn critical_error(message: impl Into<String>) -> Self {
        Self::CriticalError {
            message: message.into(),
            error_id: uuid::Uuid::new_v4().to_string(),
            requires_reconnection: true,
        }
    }

    pub fn server_shutdown() -> Self {
        Self::ServerShutdown {
            message: "Server is shutting down gracefully".to_string(),
            timestamp: now_iso(),
        }
    }

    pub fn keepalive() -> Self {
        Self::Keepalive {
            timestamp: now_iso(),
        }
    }

    pub fn health_ping() -> Self {
        Self::Ping {
            timestamp: now_iso(),
        }
    }

    pub fn batch(messages: Vec<ServerMessage>) -> Self {
        Self::Batch {
            count: messages.len(),
            messages,
            timestamp: now_iso(),
        }
    }

    pub fn connection_established(
        client_id: &str,
        features: Vec<String>,
        server_info: serde_json::Value,
    ) -> Self {
        Self::ConnectionEstablished {
            client_id: client_id.to_string(),
            features,
            server_info,
            timestamp: now_iso(),
        }
    }

    /// Wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::ProcessedFrame { .. } => "processed_frame",
            ServerMessage::AslFeedback { .. } => "asl_feedback",
            ServerMessage::ControlResponse { .. } => "control_response",
            ServerMessage::PracticeSessionResponse { .. } => "practice_session_response",
            ServerMessage::Stats { .. } => "stats",
            ServerMessage::Keepalive { .. } => "keepalive",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Batch { .. } => "batch",
            ServerMessage::Error { .. } => "error",
            ServerMessage::CriticalError { .. } => "critical_error",
            ServerMessage::ServerShutdown { .. } => "server_shutdown",
        }
    }
}
