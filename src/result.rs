//! Output accumulated by a worker while its request runs.

use crate::request::{RequestDescriptor, Role, Target};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn from_api(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(reason) => reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            total_tokens: Some(prompt_tokens.saturating_add(completion_tokens)),
        }
    }
}

/// One piece of partial output, forwarded to the UI as `chunkReceived`.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Image(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ResultContainer {
    pub target: Target,
    pub role: Role,
    pub model: String,
    pub prompt: String,
    pub content: String,
    pub images: Vec<Vec<u8>>,
    pub revised_prompt: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl ResultContainer {
    pub fn for_request(request: &RequestDescriptor) -> Self {
        Self {
            target: request.target(),
            role: Role::Assistant,
            model: request.model().to_string(),
            prompt: request.prompt().to_string(),
            content: String::new(),
            images: Vec::new(),
            revised_prompt: None,
            finish_reason: None,
            usage: Usage::default(),
            created_at: Utc::now(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub fn apply(&mut self, chunk: &Chunk) {
        match chunk {
            Chunk::Text(text) => self.content.push_str(text),
            Chunk::Image(bytes) => self.images.push(bytes.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.images.is_empty()
    }
}
