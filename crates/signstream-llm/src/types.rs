//! Request/response shapes for the chat-completions API

use serde::{Deserialize, Serialize};

/// One message in a chat-completions request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub format: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoiceMessage {
    pub content: String,
}

/// One generated story: a title plus the practice sentences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub title: String,
    pub sentences: Vec<String>,
}

/// The five difficulty tiers returned by story generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryLevels {
    pub amateur: Story,
    pub normal: Story,
    pub mid_level: Story,
    pub difficult: Story,
    pub expert: Story,
}
