use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{Backend, StreamSink};
use crate::config::{ImageConfig, ImageProvider};
use crate::endpoint_type::EndpointType;
use crate::error::RemoteError;
use crate::llmclient::check_status;
use crate::request::RequestDescriptor;
use crate::result::FinishReason;

#[derive(Debug, Serialize)]
pub struct TextToImageRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl TextToImageRequest {
    pub fn from_request(request: &RequestDescriptor) -> Self {
        let params = request.image_params();
        Self {
            prompt: request.prompt().to_string(),
            negative_prompt: params.negative_prompt.clone(),
            steps: params.steps,
            cfg_scale: params.cfg_scale,
            width: params.width,
            height: params.height,
            sampler_name: params.sampler.clone(),
            batch_size: params.count,
            seed: params.seed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TextToImageResponse {
    images: Vec<String>, // Base64 encoded images
}

#[derive(Debug, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub n: u32,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    pub response_format: &'static str,
}

impl GenerationRequest {
    pub fn from_request(request: &RequestDescriptor) -> Self {
        let params = request.image_params();
        Self {
            model: request.model().to_string(),
            prompt: request.prompt().to_string(),
            n: params.count,
            size: format!("{}x{}", params.width, params.height),
            quality: params.quality.clone(),
            style: params.style.clone(),
            response_format: "b64_json",
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    b64_json: Option<String>,
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Clone)]
pub struct ImageClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    provider: ImageProvider,
}

impl ImageClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, provider: ImageProvider) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300)) // 5 minute timeout
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
            api_key,
            provider,
        }
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        Self::new(config.base_url.clone(), config.api_key(), config.provider)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn txt2img(&self, request: &RequestDescriptor, sink: &mut StreamSink) -> Result<(), RemoteError> {
        let url = EndpointType::join(&self.base_url, "sdapi/v1/txt2img");
        let payload = TextToImageRequest::from_request(request);
        tracing::info!("Sending request to Stable Diffusion API: {}", url);
        tracing::debug!("Request payload: {}", serde_json::to_string_pretty(&payload).unwrap_or_default());

        let response = self.client.post(&url).json(&payload).send().await?;
        let text = check_status(response).await?.text().await?;
        let images = decode_txt2img(&text)?;

        for image in images {
            if !sink.push_image(image) {
                return Ok(());
            }
        }
        sink.finish(FinishReason::Stop);
        Ok(())
    }

    async fn generations(&self, request: &RequestDescriptor, sink: &mut StreamSink) -> Result<(), RemoteError> {
        let url = EndpointType::join(&self.base_url, "v1/images/generations");
        let payload = GenerationRequest::from_request(request);
        tracing::info!("Sending image generation request to: {}", url);

        let response = self.authorized(self.client.post(&url)).json(&payload).send().await?;
        let text = check_status(response).await?.text().await?;
        let (images, revised_prompt) = decode_generations(&text)?;

        if let Some(prompt) = revised_prompt {
            sink.set_revised_prompt(prompt);
        }
        for image in images {
            if !sink.push_image(image) {
                return Ok(());
            }
        }
        sink.finish(FinishReason::Stop);
        Ok(())
    }
}

#[async_trait]
impl Backend for ImageClient {
    fn name(&self) -> &str {
        match self.provider {
            ImageProvider::OpenAi => "OpenAI Images",
            ImageProvider::Automatic1111 => "Automatic1111",
        }
    }

    async fn invoke(&self, request: &RequestDescriptor, sink: &mut StreamSink) -> Result<(), RemoteError> {
        match self.provider {
            ImageProvider::OpenAi => self.generations(request, sink).await,
            ImageProvider::Automatic1111 => self.txt2img(request, sink).await,
        }
    }
}

fn decode_txt2img(text: &str) -> Result<Vec<Vec<u8>>, RemoteError> {
    let response: TextToImageResponse = serde_json::from_str(text)?;
    if response.images.is_empty() {
        return Err(RemoteError::EmptyResponse("No images returned from the server"));
    }
    response
        .images
        .iter()
        .map(|image| general_purpose::STANDARD.decode(image).map_err(RemoteError::from))
        .collect()
}

fn decode_generations(text: &str) -> Result<(Vec<Vec<u8>>, Option<String>), RemoteError> {
    let response: GenerationResponse = serde_json::from_str(text)?;
    let revised_prompt = response.data.iter().find_map(|image| image.revised_prompt.clone());
    let images = response
        .data
        .iter()
        .filter_map(|image| image.b64_json.as_deref())
        .map(|data| general_purpose::STANDARD.decode(data))
        .collect::<Result<Vec<_>, _>>()?;
    if images.is_empty() {
        return Err(RemoteError::EmptyResponse("No images returned from the server"));
    }
    Ok((images, revised_prompt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;

    #[test]
    fn test_generation_payload() {
        let config = ImageConfig {
            width: 1792,
            height: 1024,
            count: 0,
            ..ImageConfig::default()
        };
        let payload = GenerationRequest::from_request(&config.descriptor("a lighthouse"));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["size"], "1792x1024");
        assert_eq!(json["n"], 1);
        assert_eq!(json["response_format"], "b64_json");
        assert_eq!(json["model"], "dall-e-3");
    }

    #[test]
    fn test_txt2img_payload_skips_empty_fields() {
        let config = ImageConfig {
            provider: ImageProvider::Automatic1111,
            negative_prompt: Some("  ".into()),
            ..ImageConfig::default()
        };
        let payload = TextToImageRequest::from_request(&config.descriptor("a cat"));
        let json = serde_json::to_value(&payload).unwrap();

        assert!(json.get("negative_prompt").is_none());
        assert!(json.get("seed").is_none());
        assert_eq!(json["sampler_name"], "Euler a");
        assert_eq!(json["batch_size"], 1);
    }

    #[test]
    fn test_decode_generations() {
        let text = r#"{"created":1,"data":[{"b64_json":"AQID","revised_prompt":"a tall lighthouse"},{"b64_json":"BAU="}]}"#;
        let (images, revised) = decode_generations(text).unwrap();
        assert_eq!(images, vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(revised.as_deref(), Some("a tall lighthouse"));
    }

    #[test]
    fn test_decode_txt2img_errors() {
        assert!(matches!(
            decode_txt2img(r#"{"images":[],"parameters":{},"info":""}"#),
            Err(RemoteError::EmptyResponse(_))
        ));
        assert!(matches!(
            decode_txt2img(r#"{"images":["***"]}"#),
            Err(RemoteError::Base64(_))
        ));
    }
}
