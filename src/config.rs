//! Application settings, loaded once and handed to whoever builds requests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::endpoint_type::EndpointType;
use crate::request::{ImageAttachment, ImageParams, RequestDescriptor, SamplingParams, Turn};

const APP_DIR: &str = "llm-workbench";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageProvider {
    OpenAi,
    Automatic1111,
}

impl ImageProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ImageProvider::OpenAi => "https://api.openai.com",
            ImageProvider::Automatic1111 => "http://localhost:7860",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint_type: EndpointType,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system: String,
    pub stream: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub use_max_tokens: bool,
    pub max_tokens: u32,
    pub json_object: bool,
    /// How many previous turns are sent along with a new prompt.
    pub maximum_messages_in_parameter: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint_type: EndpointType::Ollama,
            base_url: EndpointType::Ollama.default_base_url().to_string(),
            api_key: None,
            model: "llama3.2".to_string(),
            system: "You are a helpful assistant.".to_string(),
            stream: true,
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            use_max_tokens: false,
            max_tokens: 1024,
            json_object: false,
            maximum_messages_in_parameter: 10,
        }
    }
}

impl ChatConfig {
    pub fn api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key)
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            max_tokens: self.use_max_tokens.then_some(self.max_tokens),
        }
    }

    /// Build the request for `prompt` from the current settings and input.
    ///
    /// Only the last `maximum_messages_in_parameter` turns of `history` are sent.
    pub fn descriptor(
        &self,
        prompt: &str,
        history: &[Turn],
        images: Vec<ImageAttachment>,
        json_body: Option<String>,
    ) -> RequestDescriptor {
        let skip = history.len().saturating_sub(self.maximum_messages_in_parameter);
        let mut request = RequestDescriptor::chat(&self.model, prompt)
            .with_system(&self.system)
            .with_history(history[skip..].to_vec())
            .with_sampling(self.sampling())
            .with_stream(self.stream)
            .with_images(images);
        if self.json_object {
            request = request.with_json_body(json_body);
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub provider: ImageProvider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
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
    pub save_images: bool,
    pub save_prompt_as_text: bool,
    pub directory: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        let defaults = ImageParams::default();
        Self {
            provider: ImageProvider::OpenAi,
            base_url: ImageProvider::OpenAi.default_base_url().to_string(),
            api_key: None,
            model: "dall-e-3".to_string(),
            width: defaults.width,
            height: defaults.height,
            count: defaults.count,
            quality: Some("standard".to_string()),
            style: Some("vivid".to_string()),
            negative_prompt: None,
            steps: defaults.steps,
            cfg_scale: defaults.cfg_scale,
            sampler: defaults.sampler,
            seed: None,
            save_images: false,
            save_prompt_as_text: true,
            directory: dirs::picture_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR),
        }
    }
}

impl ImageConfig {
    pub fn api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key)
    }

    pub fn descriptor(&self, prompt: &str) -> RequestDescriptor {
        RequestDescriptor::image(&self.model, prompt).with_image_params(ImageParams {
            width: self.width,
            height: self.height,
            count: self.count.max(1),
            quality: self.quality.clone(),
            style: self.style.clone(),
            negative_prompt: self.negative_prompt.clone().filter(|p| !p.trim().is_empty()),
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            sampler: self.sampler.clone(),
            seed: self.seed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub chat: ChatConfig,
    pub image: ImageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("conversations.db"),
            chat: ChatConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Read settings from `path`, falling back to defaults when the file does
    /// not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).context(format!("Failed to read config file {:?}", path))?;
        toml::from_str(&text).context(format!("Failed to parse config file {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(format!("Failed to create config directory {:?}", parent))?;
        }
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text).context(format!("Failed to write config file {:?}", path))?;
        Ok(())
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

fn resolve_api_key(configured: &Option<String>) -> Option<String> {
    configured
        .clone()
        .filter(|key| !key.trim().is_empty())
        .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|key| !key.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Role;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.chat.model = "gpt-4o-mini".to_string();
        config.chat.json_object = true;
        config.image.provider = ImageProvider::Automatic1111;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat]\nmodel = \"mistral\"\ntemperature = 0.2\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.chat.model, "mistral");
        assert_eq!(config.chat.temperature, 0.2);
        assert!(config.chat.stream);
        assert_eq!(config.image, ImageConfig::default());
    }

    #[test]
    fn test_descriptor_keeps_last_turns_only() {
        let config = ChatConfig {
            maximum_messages_in_parameter: 2,
            ..ChatConfig::default()
        };
        let history = vec![
            Turn::new(Role::User, "one"),
            Turn::new(Role::Assistant, "two"),
            Turn::new(Role::User, "three"),
        ];

        let request = config.descriptor("four", &history, Vec::new(), None);
        let kept: Vec<&str> = request.history().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(kept, vec!["two", "three"]);
        assert!(request.stream());
        assert!(!request.json_required());
        assert_eq!(request.sampling().max_tokens, None);
    }

    #[test]
    fn test_descriptor_json_and_max_tokens() {
        let config = ChatConfig {
            json_object: true,
            use_max_tokens: true,
            max_tokens: 256,
            ..ChatConfig::default()
        };
        let request = config.descriptor("p", &[], Vec::new(), Some("{}".to_string()));
        assert!(request.json_required());
        assert_eq!(request.sampling().max_tokens, Some(256));
    }

    #[test]
    fn test_descriptor_carries_attachments() {
        let png = ImageAttachment::from_bytes(b"\x89PNG\r\n\x1a\n".to_vec()).unwrap();
        let request = ChatConfig::default().descriptor("what is this?", &[], vec![png], None);
        assert_eq!(request.attachments().images.len(), 1);
        assert_eq!(request.attachments().images[0].mime, "image/png");
    }
}
