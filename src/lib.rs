//! Chat and image generation requests run off the UI thread, one per surface.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod endpoint_type;
pub mod error;
pub mod export;
pub mod imageclient;
pub mod llmclient;
pub mod request;
pub mod result;
pub mod store;
pub mod worker;

pub use backend::{Backend, StreamSink};
pub use config::AppConfig;
pub use dispatcher::{Dispatcher, UiAdapter};
pub use error::{RemoteError, StoreError, SubmitError, ValidationError};
pub use request::{RequestDescriptor, Role, Target, Turn};
pub use result::{Chunk, FinishReason, ResultContainer, Usage};
pub use worker::{Outcome, TaskId, WorkerTask};
