//! Story generation — multi-difficulty practice material
//!
//! One synchronous request with exactly one input source. Any LLM failure
//! degrades to the deterministic template fallback so the client always gets
//! five tiers back.

use crate::client::{LlmClient, LlmError};
use crate::types::{ChatMessage, Story, StoryLevels};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Inbound request body: exactly one of the three sources must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryRequest {
    pub frame_data: Option<String>,
    pub simple_word: Option<String>,
    pub custom_prompt: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StoryRequestError {
    #[error("exactly one of frame_data, simple_word, custom_prompt must be provided")]
    ConflictingInputs,

    #[error("no input provided")]
    Empty,

    #[error("prompt too long ({0} chars, max {MAX_PROMPT_CHARS})")]
    PromptTooLong(usize),

    #[error("frame data is not valid base64")]
    InvalidFrameData,

    #[error("frame data too large ({0} bytes)")]
    FrameTooLarge(usize),
}

const MAX_PROMPT_CHARS: usize = 500;
const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

impl StoryRequest {
    /// Validate and resolve the story topic.
    ///
    /// Object recognition on `frame_data` is an external collaborator; when
    /// only an image arrives, the topic falls back to a neutral subject.
    pub fn resolve_topic(&self) -> Result<String, StoryRequestError> {
        let provided = [
            self.frame_data.is_some(),
            self.simple_word.is_some(),
            self.custom_prompt.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();

        match provided {
            0 => return Err(StoryRequestError::Empty),
            1 => {}
            _ => return Err(StoryRequestError::ConflictingInputs),
        }

        if let Some(prompt) = &self.custom_prompt {
            let prompt = prompt.trim();
            if prompt.is_empty() {
                return Err(StoryRequestError::Empty);
            }
            if prompt.chars().count() > MAX_PROMPT_CHARS {
                return Err(StoryRequestError::PromptTooLong(prompt.chars().count()));
            }
            return Ok(prompt.to_string());
        }

        if let Some(word) = &self.simple_word {
            let word = word.trim();
            if word.is_empty() {
                return Err(StoryRequestError::Empty);
            }
            if word.chars().count() > MAX_PROMPT_CHARS {
                return Err(StoryRequestError::PromptTooLong(word.chars().count()));
            }
            return Ok(word.to_string());
        }

        let frame = self.frame_data.as_deref().unwrap_or_default();
        let stripped = frame.split(',').next_back().unwrap_or(frame);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(stripped.trim())
            .map_err(|_| StoryRequestError::InvalidFrameData)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(StoryRequestError::FrameTooLarge(bytes.len()));
        }
        Ok("everyday object".to_string())
    }
}

pub struct StoryGenerator {
    client: Arc<LlmClient>,
    model: String,
}

impl StoryGenerator {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Generate five difficulty tiers for a topic. Never fails: LLM errors
    /// and malformed responses fall back to the template stories.
    pub async fn generate(&self, topic: &str) -> (StoryLevels, bool) {
        info!(topic, model = %self.model, "generating multi-level story");

        match self.try_generate(topic).await {
            Ok(levels) => (levels, false),
            Err(e) => {
                warn!(topic, error = %e, "story generation failed, using fallback");
                (fallback_stories(topic), true)
            }
        }
    }

    async fn try_generate(&self, topic: &str) -> Result<StoryLevels, LlmError> {
        let prompt = story_prompt(topic);
        let value = self
            .client
            .chat_json(&self.model, vec![ChatMessage::user(prompt)])
            .await?;

        // Accept both { "stories": {...} } and a bare level map.
        let stories = value.get("stories").cloned().unwrap_or(value);
        serde_json::from_value(stories).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

fn story_prompt(topic: &str) -> String {
    format!(
        "You are an expert curriculum designer for American Sign Language (ASL). \
         Create five short stories about the topic: \"{topic}\", one per skill level: \
         amateur (3 sentences, simple subject-verb-object, basic vocabulary), \
         normal (3-4 sentences, slightly more complex structures), \
         mid_level (4 sentences, simple classifiers or rhetorical questions), \
         difficult (4-5 sentences, complex ASL grammar and classifiers), \
         expert (5 sentences, advanced concepts with suggested facial expressions in parentheses). \
         Respond with ONLY a valid JSON object of the form \
         {{\"stories\": {{\"amateur\": {{\"title\": \"...\", \"sentences\": [\"...\"]}}, \
         \"normal\": {{...}}, \"mid_level\": {{...}}, \"difficult\": {{...}}, \"expert\": {{...}}}}}}"
    )
}

/// Deterministic template stories used when generation is unavailable.
pub fn fallback_stories(topic: &str) -> StoryLevels {
    let t = topic.to_lowercase();
    StoryLevels {
        amateur: Story {
            title: format!("The {topic}"),
            sentences: vec![
                format!("I see a {t}."),
                format!("The {t} is nice."),
                format!("I like the {t}."),
            ],
        },
        normal: Story {
            title: format!("A Story About {topic}"),
            sentences: vec![
                format!("Today I found a {t}."),
                format!("The {t} was very interesting."),
                "I decided to learn more about it.".to_string(),
                format!("Now I understand {t} better."),
            ],
        },
        mid_level: Story {
            title: format!("The {topic} Adventure"),
            sentences: vec![
                format!("While walking, I discovered a {t}."),
                format!("The {t} had many interesting features."),
                "I wondered how it worked and what it was for.".to_string(),
                "After studying it carefully, I learned something new.".to_string(),
            ],
        },
        difficult: Story {
            title: format!("Exploring the {topic}"),
            sentences: vec![
                format!("During my exploration, I encountered a fascinating {t}."),
                format!("The {t} exhibited unique characteristics that caught my attention."),
                "I began to analyze its structure and function systematically.".to_string(),
                "Through careful observation, I gained valuable insights.".to_string(),
                format!("This experience taught me to appreciate the complexity of {t}."),
            ],
        },
        expert: Story {
            title: format!("The Complex Nature of {topic}"),
            sentences: vec![
                format!("In my comprehensive study, I investigated the multifaceted aspects of {t}."),
                format!("The {t} demonstrated intricate relationships between form and function."),
                "Through methodical analysis, I uncovered underlying principles governing its behavior."
                    .to_string(),
                format!("These discoveries challenged my preconceived notions about {t}."),
                format!(
                    "Ultimately, this research expanded my understanding of how {t} interacts with its environment."
                ),
            ],
        },
    }
}
