//! Signstream LLM - chat-completions client, story generation, signing analysis

pub mod analysis;
pub mod client;
pub mod story;
pub mod types;

pub use analysis::{AnalysisService, SegmentSummary};
pub use client::{LlmClient, LlmError, LlmResult};
pub use story::{StoryGenerator, StoryRequest, StoryRequestError};
pub use types::{ChatMessage, Story, StoryLevels};
