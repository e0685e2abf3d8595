use std::time::Duration;

use rand::random;

use super::{Embedder, Embedding, EmbeddingError};
use crate::config::RetryConfig;
use crate::store::TaskType;

/// Retries retryable failures of the wrapped embedder with exponential backoff.
pub struct RetryingEmbedder<E> {
    inner: E,
    policy: RetryConfig,
}

impl<E: Embedder> RetryingEmbedder<E> {
    pub fn new(inner: E, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// `base * 2^(attempt-1)` plus up to `base` of jitter, capped at `max_delay_ms`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay_ms;
        let exp = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(16)));
        let jitter = random::<u64>() % (base + 1);
        Duration::from_millis(exp.saturating_add(jitter).min(self.policy.max_delay_ms))
    }
}

impl<E: Embedder> Embedder for RetryingEmbedder<E> {
    fn embed(&self, text: &str, task: TaskType) -> Result<Embedding, EmbeddingError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.embed(text, task) {
                Ok(embedding) => return Ok(embedding),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "embedding attempt {}/{} failed: {}, retrying in {}ms",
                        attempt,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        log::error!("embedding failed after {} attempts: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
