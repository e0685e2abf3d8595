//! Embedding generation adapters.
//!
//! The store only ever sees vectors; everything that turns text into a
//! vector sits behind [`Embedder`]:
//! - [`gemini::GeminiEmbedder`]: remote `embedContent` REST calls
//! - `local::LocalEmbedder`: offline fastembed model (feature `local-embed`)
//! - [`retry::RetryingEmbedder`]: backoff decorator for any embedder

pub mod gemini;
#[cfg(feature = "local-embed")]
pub mod local;
pub mod retry;

use std::time::Duration;

use crate::store::TaskType;

/// Ellipsis suffix when input is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// A generated vector and how long the provider took to produce it.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub latency: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Environment variable {0} with the provider API key is not set")]
    MissingApiKey(String),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Provider responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[cfg(feature = "local-embed")]
    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[cfg(feature = "local-embed")]
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
}

impl EmbeddingError {
    /// Failures worth another attempt: transport hiccups, throttling and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Transport(_) => true,
            EmbeddingError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Opaque `text -> vector` function.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str, task: TaskType) -> Result<Embedding, EmbeddingError>;

    /// Identifies the vector space; partition files are stamped with it.
    fn model_name(&self) -> &str;
}

impl<E: Embedder + ?Sized> Embedder for std::sync::Arc<E> {
    fn embed(&self, text: &str, task: TaskType) -> Result<Embedding, EmbeddingError> {
        (**self).embed(text, task)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn embed(&self, text: &str, task: TaskType) -> Result<Embedding, EmbeddingError> {
        (**self).embed(text, task)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Stand-in for commands that never embed (stats, cluster, delete).
pub struct Unavailable {
    model_name: String,
}

impl Unavailable {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }
}

impl Embedder for Unavailable {
    fn embed(&self, _text: &str, _task: TaskType) -> Result<Embedding, EmbeddingError> {
        Err(EmbeddingError::InitFailed(format!(
            "embedding provider for {} is not loaded",
            self.model_name
        )))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Trim and cut `text` to at most `max_chars` characters, adding an ellipsis if cut.
pub fn prepare_input(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let keep = max_chars.saturating_sub(TRUNCATION_SUFFIX.len());
    let truncated: String = text.chars().take(keep).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}
