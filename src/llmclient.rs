use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::backend::{Backend, StreamSink};
use crate::config::ChatConfig;
use crate::endpoint_type::EndpointType;
use crate::error::RemoteError;
use crate::request::RequestDescriptor;
use crate::result::{FinishReason, Usage};

#[derive(Debug, Deserialize)]
struct ModelData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelData>,
}

#[derive(Debug, Deserialize)]
struct ModelDetails {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OllamaModelsResponse {
    models: Vec<ModelDetails>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

impl From<ApiUsage> for Usage {
    fn from(usage: ApiUsage) -> Self {
        Usage {
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
            total_tokens: Some(
                usage
                    .total_tokens
                    .unwrap_or(usage.prompt_tokens.saturating_add(usage.completion_tokens)),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaContent {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: DeltaContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

/// Splits a byte stream into lines, keeping partial lines between network
/// chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let line = decode_line(&std::mem::take(&mut self.pending));
        (!line.is_empty()).then_some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .to_string()
}

type LineHandler = fn(&str, &mut StreamSink) -> Result<bool, RemoteError>;

/// Handle one line of an OpenAI-style server-sent event stream.
///
/// Returns `false` once the stream is over or the sink stopped accepting.
pub fn handle_sse_line(line: &str, sink: &mut StreamSink) -> Result<bool, RemoteError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(!sink.is_cancelled());
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(false);
    }
    if data.is_empty() {
        return Ok(!sink.is_cancelled());
    }

    let response = match serde_json::from_str::<StreamResponse>(data) {
        Ok(response) => response,
        Err(e) => {
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                let message = value
                    .pointer("/error/message")
                    .or_else(|| value.get("error"))
                    .and_then(Value::as_str);
                if let Some(message) = message {
                    return Err(RemoteError::Api(message.to_string()));
                }
            }
            tracing::warn!("Failed to parse stream chunk: {}. Raw JSON: {}", e, data);
            return Ok(!sink.is_cancelled());
        }
    };
    if let Some(error) = response.error {
        return Err(RemoteError::Api(error.message));
    }

    if let Some(usage) = response.usage {
        sink.set_usage(usage.into());
    }
    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(content) = &choice.delta.content {
            if !sink.push_text(content) {
                return Ok(false);
            }
        }
        // Keep reading: the usage chunk follows the finish chunk
        if let Some(reason) = &choice.finish_reason {
            sink.finish(FinishReason::from_api(reason));
        }
    }
    Ok(!sink.is_cancelled())
}

/// Handle one newline-delimited JSON object from Ollama.
pub fn handle_ollama_line(line: &str, sink: &mut StreamSink) -> Result<bool, RemoteError> {
    if line.trim().is_empty() {
        return Ok(!sink.is_cancelled());
    }
    let chunk: OllamaChunk = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        return Err(RemoteError::Api(error));
    }
    if let Some(message) = &chunk.message {
        if !sink.push_text(&message.content) {
            return Ok(false);
        }
    }
    if chunk.done {
        sink.finish(FinishReason::from_api(chunk.done_reason.as_deref().unwrap_or("stop")));
        if let (Some(prompt), Some(completion)) = (chunk.prompt_eval_count, chunk.eval_count) {
            sink.set_usage(Usage::new(prompt, completion));
        }
        return Ok(false);
    }
    Ok(!sink.is_cancelled())
}

#[derive(Clone)]
pub struct LLMClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    endpoint_type: EndpointType,
}

impl LLMClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, endpoint_type: EndpointType) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5)) // Model listing; chat requests override this
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
            api_key,
            endpoint_type,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.base_url.clone(), config.api_key(), config.endpoint_type)
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, RemoteError> {
        let models_url = self.endpoint_type.models_url(&self.base_url);
        tracing::info!("Fetching models from: {}", models_url);

        let response = self.authorized(self.client.get(&models_url)).send().await?;
        let response = check_status(response).await?;

        let text = response.text().await?;
        tracing::debug!("Raw models response: {}", text);

        let mut models = match self.endpoint_type {
            EndpointType::OpenAiCompatible => {
                let models: ModelsResponse = serde_json::from_str(&text)?;
                models.data.into_iter().map(|m| m.id).collect::<Vec<_>>()
            }
            EndpointType::Ollama => {
                let models: OllamaModelsResponse = serde_json::from_str(&text)?;
                models.models.into_iter().map(|m| m.name).collect()
            }
        };
        models.sort();
        Ok(models)
    }

    /// The JSON body sent for `request`, in this endpoint's dialect.
    pub fn request_body(&self, request: &RequestDescriptor) -> Value {
        match self.endpoint_type {
            EndpointType::OpenAiCompatible => openai_body(request),
            EndpointType::Ollama => ollama_body(request),
        }
    }

    async fn read_lines(response: Response, sink: &mut StreamSink, handle: LineHandler) -> Result<(), RemoteError> {
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if !handle(&line, sink)? {
                    return Ok(());
                }
            }
        }
        if let Some(line) = lines.finish() {
            handle(&line, sink)?;
        }
        Ok(())
    }

    fn read_completion(text: &str, sink: &mut StreamSink) -> Result<(), RemoteError> {
        let response: CompletionResponse = serde_json::from_str(text)?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or(RemoteError::EmptyResponse("No choices returned from the server"))?;

        if let Some(usage) = response.usage {
            sink.set_usage(usage.into());
        }
        if let Some(reason) = &choice.finish_reason {
            sink.finish(FinishReason::from_api(reason));
        }
        sink.push_text(choice.message.content.as_deref().unwrap_or_default());
        Ok(())
    }
}

#[async_trait]
impl Backend for LLMClient {
    fn name(&self) -> &str {
        self.endpoint_type.label()
    }

    async fn invoke(&self, request: &RequestDescriptor, sink: &mut StreamSink) -> Result<(), RemoteError> {
        let chat_url = self.endpoint_type.chat_url(&self.base_url);
        tracing::info!("Sending chat request to: {}", chat_url);

        let body = self.request_body(request);
        let response = self
            .authorized(self.client.post(&chat_url))
            .json(&body)
            .timeout(Duration::from_secs(300)) // 5 minute timeout for the entire stream
            .send()
            .await?;
        let response = check_status(response).await?;

        match (self.endpoint_type, request.stream()) {
            (EndpointType::OpenAiCompatible, true) => Self::read_lines(response, sink, handle_sse_line).await,
            (EndpointType::Ollama, true) => Self::read_lines(response, sink, handle_ollama_line).await,
            (EndpointType::OpenAiCompatible, false) => {
                let text = response.text().await?;
                Self::read_completion(&text, sink)
            }
            (EndpointType::Ollama, false) => {
                let text = response.text().await?;
                handle_ollama_line(&text, sink).map(|_| ())
            }
        }
    }
}

pub(crate) async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_else(|_| "No error message".to_string());
    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}

fn openai_body(request: &RequestDescriptor) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system() {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for turn in request.history() {
        messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
    }

    let images = &request.attachments().images;
    let user_content = if images.is_empty() {
        Value::String(request.user_content())
    } else {
        let mut parts = vec![json!({ "type": "text", "text": request.user_content() })];
        parts.extend(images.iter().map(|image| {
            let url = format!("data:{};base64,{}", image.mime, general_purpose::STANDARD.encode(&image.bytes));
            json!({ "type": "image_url", "image_url": { "url": url } })
        }));
        Value::Array(parts)
    };
    messages.push(json!({ "role": "user", "content": user_content }));

    let sampling = request.sampling();
    let mut body = json!({
        "model": request.model(),
        "messages": messages,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
        "frequency_penalty": sampling.frequency_penalty,
        "presence_penalty": sampling.presence_penalty,
        "stream": request.stream(),
    });
    if request.stream() {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if let Some(max_tokens) = sampling.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if request.json_required() {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

fn ollama_body(request: &RequestDescriptor) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system() {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for turn in request.history() {
        messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
    }

    let mut user = json!({ "role": "user", "content": request.user_content() });
    let images = &request.attachments().images;
    if !images.is_empty() {
        user["images"] = images
            .iter()
            .map(|image| Value::String(general_purpose::STANDARD.encode(&image.bytes)))
            .collect();
    }
    messages.push(user);

    let sampling = request.sampling();
    let mut options = json!({
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
        "frequency_penalty": sampling.frequency_penalty,
        "presence_penalty": sampling.presence_penalty,
    });
    if let Some(max_tokens) = sampling.max_tokens {
        options["num_predict"] = json!(max_tokens);
    }

    let mut body = json!({
        "model": request.model(),
        "messages": messages,
        "stream": request.stream(),
        "options": options,
    });
    if request.json_required() {
        body["format"] = json!("json");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ImageAttachment, Role, SamplingParams, Turn};
    use crate::result::{Chunk, ResultContainer};
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::{sync_channel, Receiver};
    use std::sync::Arc;

    fn sink() -> (StreamSink, Receiver<Chunk>) {
        let request = RequestDescriptor::chat("m", "p");
        let (tx, rx) = sync_channel(64);
        let sink = StreamSink::new(ResultContainer::for_request(&request), tx, Arc::new(AtomicBool::new(false)));
        (sink, rx)
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.push(b": 1}\r\n\ndata: [DO"), vec!["data: {\"a\": 1}", ""]);
        assert!(buffer.push(b"NE]").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_sse_stream() {
        let (mut sink, rx) = sink();
        let lines = [
            r#"data: {"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        ];
        for line in lines {
            assert!(handle_sse_line(line, &mut sink).unwrap());
        }
        assert!(!handle_sse_line("data: [DONE]", &mut sink).unwrap());

        let result = sink.into_result();
        assert_eq!(result.content, "Hello");
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage, Usage::new(5, 2));
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_sse_garbage_is_skipped_but_errors_surface() {
        let (mut sink, _rx) = sink();
        assert!(handle_sse_line("data: not json", &mut sink).unwrap());
        assert!(handle_sse_line(": keep-alive", &mut sink).unwrap());

        let err = handle_sse_line(r#"data: {"error":{"message":"quota exceeded"}}"#, &mut sink).unwrap_err();
        assert!(matches!(err, RemoteError::Api(msg) if msg == "quota exceeded"));
    }

    #[test]
    fn test_sse_error_chunk_is_not_a_completion() {
        let (mut sink, rx) = sink();
        assert!(handle_sse_line(r#"data: {"choices":[{"delta":{"content":"par"},"finish_reason":null}]}"#, &mut sink).unwrap());

        let line = r#"data: {"choices":[],"error":{"message":"rate limited","type":"requests","code":"429"}}"#;
        let err = handle_sse_line(line, &mut sink).unwrap_err();
        assert_eq!(err.to_string(), "API error: rate limited");

        let err = handle_sse_line(r#"data: {"error":"upstream closed"}"#, &mut sink).unwrap_err();
        assert!(matches!(err, RemoteError::Api(msg) if msg == "upstream closed"));

        assert_eq!(sink.result().content, "par");
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage: Usage = ApiUsage {
            prompt_tokens: u32::MAX,
            completion_tokens: 5,
            total_tokens: None,
        }
        .into();
        assert_eq!(usage.total_tokens, Some(u32::MAX));
    }

    #[test]
    fn test_ollama_stream() {
        let (mut sink, _rx) = sink();
        assert!(handle_ollama_line(r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#, &mut sink).unwrap());
        assert!(!handle_ollama_line(
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"length","prompt_eval_count":3,"eval_count":9}"#,
            &mut sink
        )
        .unwrap());

        let result = sink.into_result();
        assert_eq!(result.content, "Hi");
        assert_eq!(result.finish_reason, Some(FinishReason::Length));
        assert_eq!(result.usage.total_tokens, Some(12));
    }

    #[test]
    fn test_ollama_error_line() {
        let (mut sink, _rx) = sink();
        let err = handle_ollama_line(r#"{"error":"model 'x' not found"}"#, &mut sink).unwrap_err();
        assert!(matches!(err, RemoteError::Api(_)));
    }

    #[test]
    fn test_non_streaming_completion() {
        let (mut sink, _rx) = sink();
        let text = r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\":true}"},"finish_reason":"stop"}],"usage":{"prompt_tokens":4,"completion_tokens":3,"total_tokens":7}}"#;
        LLMClient::read_completion(text, &mut sink).unwrap();

        let result = sink.into_result();
        assert_eq!(result.content, "{\"ok\":true}");
        assert_eq!(result.usage.total_tokens, Some(7));
    }

    #[test]
    fn test_openai_body() {
        let client = LLMClient::new("http://localhost:1234", None, EndpointType::OpenAiCompatible);
        let request = RequestDescriptor::chat("gpt-4o", "describe")
            .with_system("be brief")
            .with_history(vec![Turn::new(Role::User, "hi"), Turn::new(Role::Assistant, "hello")])
            .with_sampling(SamplingParams {
                max_tokens: Some(100),
                ..SamplingParams::default()
            })
            .with_stream(true)
            .with_images(vec![ImageAttachment {
                mime: "image/png".into(),
                bytes: vec![1, 2, 3],
            }]);

        let body = client.request_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"].as_array().unwrap().len(), 4);
        assert_eq!(body["messages"][3]["content"][1]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_ollama_body_with_json() {
        let client = LLMClient::new("http://localhost:11434", None, EndpointType::Ollama);
        let request = RequestDescriptor::chat("llama3.2", "fill")
            .with_json_body(Some(r#"{"a": 1}"#.into()));

        let body = client.request_body(&request);
        assert_eq!(body["format"], "json");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["content"], r#"fill JSON {"a": 1}"#);
        assert!(body["options"].get("num_predict").is_none());
    }
}
