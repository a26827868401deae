//! Signstream Session - everything owned by one client connection
//!
//! Gesture segmentation, practice-session state, adaptive quality, the
//! bounded priority queue, resource monitoring, and the per-client
//! processing pipeline worker.

pub mod dispatch;
pub mod gesture;
pub mod monitor;
pub mod pipeline;
pub mod practice;
pub mod quality;
pub mod queue;
pub mod stats;

pub use dispatch::{AnalysisDispatcher, AnalysisOutcome};
pub use gesture::{GestureDetector, GestureEnd, LandmarkSnapshot};
pub use pipeline::{Outbound, PipelineCommand, PipelineWorker, ProcessingPipeline};
pub use practice::{CompletedSegment, PracticeMode, PracticeSessionManager};
pub use quality::{AdaptiveQualityController, NetworkCondition, PerformanceCondition};
pub use queue::{MessageQueue, QueueConfig, QueueError, QueueHandler, QueuedMessage};
pub use stats::PipelineStats;
