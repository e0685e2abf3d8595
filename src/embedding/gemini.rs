//! Gemini `embedContent` client.

use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{prepare_input, Embedder, Embedding, EmbeddingError};
use crate::config::EmbeddingConfig;
use crate::store::TaskType;

/// Blocking client for `POST {base_url}/models/{model}:embedContent`.
pub struct GeminiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    max_input_chars: usize,
}

impl GeminiEmbedder {
    /// Build a client from config, reading the API key from the environment.
    pub fn from_config(config: &EmbeddingConfig, dimensions: usize) -> Result<Self, EmbeddingError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EmbeddingError::MissingApiKey(config.api_key_env.clone()))?;

        Self::new(
            &api_key,
            &config.base_url,
            &config.model,
            dimensions,
            Duration::from_secs(config.timeout_secs),
            config.max_input_chars,
        )
    }

    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: usize,
        timeout: Duration,
        max_input_chars: usize,
    ) -> Result<Self, EmbeddingError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|_| EmbeddingError::InitFailed("invalid API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| EmbeddingError::InitFailed(format!("failed to build HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/models/{}:embedContent",
            base_url.trim_end_matches('/'),
            model
        );

        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            dimensions,
            max_input_chars,
        })
    }
}

impl Embedder for GeminiEmbedder {
    fn embed(&self, text: &str, task: TaskType) -> Result<Embedding, EmbeddingError> {
        let input = prepare_input(text, self.max_input_chars);
        let model = format!("models/{}", self.model);
        let request = EmbedRequest {
            model: &model,
            content: Content {
                parts: vec![Part { text: &input }],
            },
            task_type: task,
            output_dimensionality: self.dimensions,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| EmbeddingError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        let latency = started.elapsed();

        if parsed.embedding.values.is_empty() {
            return Err(EmbeddingError::InvalidResponse("empty embedding".to_string()));
        }

        log::debug!(
            "gemini embedded {} chars into {} dims in {}ms",
            input.len(),
            parsed.embedding.values.len(),
            latency.as_millis()
        );

        Ok(Embedding {
            vector: parsed.embedding.values,
            latency,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: &'a str,
    content: Content<'a>,
    task_type: TaskType,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Values,
}

#[derive(Deserialize)]
struct Values {
    values: Vec<f32>,
}
