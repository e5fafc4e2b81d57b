use thiserror::Error;

/// Problems with a request that are caught before any worker is started.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("no model selected")]
    EmptyModel,
    #[error("JSON content is empty. Please fill in the JSON content field.")]
    MissingJsonBody,
    #[error("JSON content is not valid: {0}")]
    InvalidJsonBody(#[source] serde_json::Error),
    #[error("could not read image {path:?}: {source}")]
    UnreadableImage {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a supported image (PNG, JPEG, GIF or WebP)")]
    UnsupportedImage,
}

/// Failures reported by a running worker as its terminal `failed` event.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("API error: {0}")]
    Api(String),
    #[error("failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to decode base64 image: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{0}")]
    EmptyResponse(&'static str),
    #[error("failed to start worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("a request is already running on the {0} surface")]
    Busy(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
