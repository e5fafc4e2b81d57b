use serde::{Deserialize, Serialize};

/// Which chat API dialect a server speaks.
#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    OpenAiCompatible,
    Ollama,
}

impl EndpointType {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            EndpointType::OpenAiCompatible => "https://api.openai.com",
            EndpointType::Ollama => "http://localhost:11434",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EndpointType::OpenAiCompatible => "OpenAI-Compatible",
            EndpointType::Ollama => "Ollama",
        }
    }

    pub fn models_endpoint(&self) -> &'static str {
        match self {
            EndpointType::OpenAiCompatible => "v1/models",
            EndpointType::Ollama => "api/tags",
        }
    }

    pub fn chat_endpoint(&self) -> &'static str {
        match self {
            EndpointType::OpenAiCompatible => "v1/chat/completions",
            EndpointType::Ollama => "api/chat",
        }
    }

    /// Join a base URL and an endpoint path, tolerating stray slashes and a
    /// base that already carries the path.
    pub fn join(base_url: &str, endpoint: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let base = base.strip_suffix(endpoint).unwrap_or(base).trim_end_matches('/');
        format!("{}/{}", base, endpoint.trim_start_matches('/'))
    }

    pub fn chat_url(&self, base_url: &str) -> String {
        Self::join(base_url, self.chat_endpoint())
    }

    pub fn models_url(&self, base_url: &str) -> String {
        // Strip the chat part if the user pasted a full chat URL
        let base = base_url.trim_end_matches('/');
        let base = base.strip_suffix(self.chat_endpoint()).unwrap_or(base);
        Self::join(base, self.models_endpoint())
    }
}
