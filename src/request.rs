//! Immutable description of one outbound call.

use crate::error::ValidationError;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Chat,
    Image,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Chat => "chat",
            Target::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A prior turn sent along with the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageParams {
    pub width: u32,
    pub height: u32,
    pub count: u32,
    pub quality: Option<String>,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
    pub steps: u32,
    pub cfg_scale: f32,
    pub sampler: String,
    pub seed: Option<i64>,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            count: 1,
            quality: None,
            style: None,
            negative_prompt: None,
            steps: 20,
            cfg_scale: 7.0,
            sampler: "Euler a".to_string(),
            seed: None,
        }
    }
}

/// An image sent to the model together with the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    /// Sniff the format from the leading bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ValidationError> {
        let mime = match image::guess_format(&bytes) {
            Ok(ImageFormat::Png) => "image/png",
            Ok(ImageFormat::Jpeg) => "image/jpeg",
            Ok(ImageFormat::Gif) => "image/gif",
            Ok(ImageFormat::WebP) => "image/webp",
            _ => return Err(ValidationError::UnsupportedImage),
        };
        Ok(Self {
            mime: mime.to_string(),
            bytes,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ValidationError> {
        let bytes = std::fs::read(path).map_err(|source| ValidationError::UnreadableImage {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachments {
    pub images: Vec<ImageAttachment>,
    /// Raw text of the structured body; parsed during validation.
    pub json_body: Option<String>,
}

/// Everything needed to perform one call. Built once at submit time and only
/// read afterwards.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    target: Target,
    model: String,
    prompt: String,
    system: Option<String>,
    history: Vec<Turn>,
    sampling: SamplingParams,
    image: ImageParams,
    stream: bool,
    json_required: bool,
    attachments: Attachments,
}

impl RequestDescriptor {
    pub fn chat(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(Target::Chat, model.into(), prompt.into())
    }

    pub fn image(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(Target::Image, model.into(), prompt.into())
    }

    fn new(target: Target, model: String, prompt: String) -> Self {
        Self {
            target,
            model,
            prompt,
            system: None,
            history: Vec::new(),
            sampling: SamplingParams::default(),
            image: ImageParams::default(),
            stream: false,
            json_required: false,
            attachments: Attachments::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = if system.trim().is_empty() { None } else { Some(system) };
        self
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_image_params(mut self, image: ImageParams) -> Self {
        self.image = image;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Require a structured JSON body and ask the model for a JSON answer.
    pub fn with_json_body(mut self, body: Option<String>) -> Self {
        self.json_required = true;
        self.attachments.json_body = body;
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.attachments.images = images;
        self
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn image_params(&self) -> &ImageParams {
        &self.image
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn json_required(&self) -> bool {
        self.json_required
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    /// Check the request before a worker is created for it.
    ///
    /// Returns the parsed structured body when one is required.
    pub fn validate(&self) -> Result<Option<serde_json::Value>, ValidationError> {
        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if self.model.trim().is_empty() {
            return Err(ValidationError::EmptyModel);
        }
        if !self.json_required {
            return Ok(None);
        }

        let body = self
            .attachments
            .json_body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or(ValidationError::MissingJsonBody)?;
        serde_json::from_str(body)
            .map(Some)
            .map_err(ValidationError::InvalidJsonBody)
    }

    /// The user turn as it is sent to the model: the prompt, followed by the
    /// structured body when one is required.
    pub fn user_content(&self) -> String {
        match self.attachments.json_body.as_deref() {
            Some(body) if self.json_required => format!("{} JSON {}", self.prompt, body.trim()),
            _ => self.prompt.clone(),
        }
    }
}
