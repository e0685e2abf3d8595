//! Request-level operations composed from the store, the source catalog
//! and the embedder.
//!
//! Every method takes the caller's [`OwnerId`] explicitly. Inputs are
//! validated before any I/O, and embedding happens before any store lock is
//! taken, so a provider failure never leaves a partial write behind.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    batch::{BatchOutcome, BatchRunner, CancelToken},
    config::{Config, SearchConfig},
    eid::{OwnerId, RecordId},
    embedding::Embedder,
    errors::ServiceError,
    sources::{NewSource, SourceCatalog, SourceItem},
    store::{
        ClusterAssignment, ContentHash, DuplicateCandidate, EmbeddingStore, NewEmbedding,
        OwnerStats, TaskType,
    },
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub source_ref_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub check_duplicates: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub embedding_id: RecordId,
    pub source_ref_id: String,
    pub dimensions: usize,
    pub processing_time_ms: u64,
    pub content_hash: ContentHash,
    /// `None` unless duplicates were requested
    pub duplicates: Option<Vec<DuplicateCandidate>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    pub similarity_threshold: Option<f32>,
    pub max_results: Option<usize>,
    #[serde(default)]
    pub include_content: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub source_ref_id: String,
    pub score: f32,
    pub title: String,
    pub url: Option<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub embedding_ms: u64,
    pub search_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    pub total_results: usize,
    pub threshold: f32,
    pub max_results: usize,
    pub dimensions: usize,
    pub timings: Timings,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub metadata: SearchMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuplicatesRequest {
    #[serde(default)]
    pub content: String,
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub source_ref_id: String,
    pub status: BatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<GenerateResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSourceResponse {
    pub source_ref_id: String,
    pub embeddings_removed: usize,
}

pub struct EmbeddingService {
    store: EmbeddingStore,
    sources: SourceCatalog,
    embedder: Arc<dyn Embedder>,
    batch: BatchRunner,
    search: SearchConfig,
    duplicate_threshold: f32,
}

impl EmbeddingService {
    pub fn new(
        store: EmbeddingStore,
        sources: SourceCatalog,
        embedder: Arc<dyn Embedder>,
        config: &Config,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        Ok(Self {
            store,
            sources,
            embedder,
            batch: BatchRunner::new(&config.batch)?,
            search: config.search.clone(),
            duplicate_threshold: config.store.duplicate_threshold,
        })
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn sources(&self) -> &SourceCatalog {
        &self.sources
    }

    /// Embed `content` for a registered source and store it.
    pub fn generate(
        &self,
        owner: &OwnerId,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ServiceError> {
        let started = Instant::now();

        let source_ref_id = request.source_ref_id.trim();
        if source_ref_id.is_empty() {
            return Err(ServiceError::Validation("sourceRefId is required".to_string()));
        }
        if request.content.trim().is_empty() {
            return Err(ServiceError::Validation("content is required".to_string()));
        }
        if self.sources.get(owner, source_ref_id)?.is_none() {
            return Err(ServiceError::NotFound(format!("source {source_ref_id} not found")));
        }

        let task_type = request.task_type.unwrap_or_default();
        let content_hash = ContentHash::of(&request.content);
        let embedding = self.embedder.embed(&request.content, task_type)?;
        let provider_ms = embedding.latency.as_millis();
        let vector = embedding.vector;

        let embedding_id = self.store.put(
            owner,
            NewEmbedding {
                source_ref_id: source_ref_id.to_string(),
                task_type,
                vector: vector.clone(),
                content_hash: content_hash.clone(),
                source_text: request.content.clone(),
            },
        )?;

        let duplicates = if request.check_duplicates {
            let candidates = self
                .store
                .find_duplicates(owner, &content_hash, &vector, self.duplicate_threshold)?
                .into_iter()
                .filter(|c| c.source_ref_id != source_ref_id)
                .collect();
            Some(candidates)
        } else {
            None
        };

        log::info!(
            "embedded {source_ref_id} for {owner} ({task_type}) in {}ms, provider {provider_ms}ms",
            started.elapsed().as_millis()
        );

        Ok(GenerateResponse {
            embedding_id,
            source_ref_id: source_ref_id.to_string(),
            dimensions: vector.len(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            content_hash,
            duplicates,
        })
    }

    /// Run [`generate`](Self::generate) over `requests` with bounded parallelism.
    pub fn generate_batch(
        &self,
        owner: &OwnerId,
        requests: &[GenerateRequest],
        cancel: &CancelToken,
    ) -> Vec<BatchItemResult> {
        self.generate_batch_with(owner, requests, cancel, |_| {})
    }

    /// Like [`generate_batch`](Self::generate_batch), calling `on_item` as each item finishes.
    pub fn generate_batch_with<P>(
        &self,
        owner: &OwnerId,
        requests: &[GenerateRequest],
        cancel: &CancelToken,
        on_item: P,
    ) -> Vec<BatchItemResult>
    where
        P: Fn(&GenerateRequest) + Sync + Send,
    {
        let outcomes = self.batch.run(requests, cancel, |request| {
            let result = self.generate(owner, request);
            on_item(request);
            result
        });

        let results: Vec<BatchItemResult> = requests
            .iter()
            .zip(outcomes)
            .map(|(request, outcome)| {
                let source_ref_id = request.source_ref_id.clone();
                match outcome {
                    BatchOutcome::Done(Ok(embedding)) => BatchItemResult {
                        source_ref_id,
                        status: BatchStatus::Ok,
                        embedding: Some(embedding),
                        error: None,
                    },
                    BatchOutcome::Done(Err(e)) => BatchItemResult {
                        source_ref_id,
                        status: BatchStatus::Error,
                        embedding: None,
                        error: Some(e.to_string()),
                    },
                    BatchOutcome::Cancelled => BatchItemResult {
                        source_ref_id,
                        status: BatchStatus::Cancelled,
                        embedding: None,
                        error: None,
                    },
                }
            })
            .collect();

        let failed = results
            .iter()
            .filter(|r| r.status == BatchStatus::Error)
            .count();
        log::info!(
            "batch of {} for {owner} finished, {} failed",
            results.len(),
            failed
        );

        results
    }

    /// Rank the caller's stored content against a free-text query.
    pub fn search(&self, owner: &OwnerId, request: &SearchRequest) -> Result<SearchResponse, ServiceError> {
        let started = Instant::now();

        let query = request.query.trim();
        if query.is_empty() {
            return Err(ServiceError::Validation("query is required".to_string()));
        }
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.search.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ServiceError::Validation(format!(
                "similarityThreshold must be between 0 and 1, got {threshold}"
            )));
        }
        let max_results = request.max_results.unwrap_or(self.search.default_max_results);
        if max_results == 0 || max_results > self.search.max_results_limit {
            return Err(ServiceError::Validation(format!(
                "maxResults must be between 1 and {}, got {max_results}",
                self.search.max_results_limit
            )));
        }

        let embed_started = Instant::now();
        let embedding = self.embedder.embed(query, TaskType::RetrievalQuery)?;
        let embedding_ms = embed_started.elapsed().as_millis() as u64;

        let search_started = Instant::now();
        // one source can hold a record per task type
        let matches = self.store.find_similar(
            owner,
            &embedding.vector,
            threshold,
            max_results * TaskType::ALL.len(),
        )?;
        let search_ms = search_started.elapsed().as_millis() as u64;

        let mut seen = std::collections::HashSet::new();
        let matches: Vec<_> = matches
            .into_iter()
            .filter(|m| seen.insert(m.source_ref_id.clone()))
            .take(max_results)
            .collect();

        let items = self
            .sources
            .get_many(owner, matches.iter().map(|m| m.source_ref_id.as_str()))?;

        let results: Vec<SearchHit> = matches
            .into_iter()
            .filter_map(|m| {
                let Some(item) = items.get(&m.source_ref_id) else {
                    log::warn!("embedding {} references unknown source {}", m.record_id, m.source_ref_id);
                    return None;
                };
                Some(SearchHit {
                    source_ref_id: m.source_ref_id,
                    score: m.score,
                    title: item.title.clone(),
                    url: item.url.clone(),
                    summary: item.summary.clone(),
                    created_at: m.created_at,
                    content: request.include_content.then_some(m.source_text),
                })
            })
            .collect();

        Ok(SearchResponse {
            query: query.to_string(),
            metadata: SearchMetadata {
                total_results: results.len(),
                threshold,
                max_results,
                dimensions: embedding.vector.len(),
                timings: Timings {
                    embedding_ms,
                    search_ms,
                    total_ms: started.elapsed().as_millis() as u64,
                },
            },
            results,
        })
    }

    /// Check free text against the caller's stored content.
    pub fn duplicates(
        &self,
        owner: &OwnerId,
        request: &DuplicatesRequest,
    ) -> Result<Vec<DuplicateCandidate>, ServiceError> {
        if request.content.trim().is_empty() {
            return Err(ServiceError::Validation("content is required".to_string()));
        }
        let threshold = request.threshold.unwrap_or(self.duplicate_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ServiceError::Validation(format!(
                "threshold must be between 0 and 1, got {threshold}"
            )));
        }

        let content_hash = ContentHash::of(&request.content);
        let embedding = self
            .embedder
            .embed(&request.content, TaskType::RetrievalDocument)?;

        Ok(self
            .store
            .find_duplicates(owner, &content_hash, &embedding.vector, threshold)?)
    }

    pub fn stats(&self, owner: &OwnerId) -> Result<OwnerStats, ServiceError> {
        Ok(self.store.stats(owner)?)
    }

    pub fn cluster(&self, owner: &OwnerId, k: usize) -> Result<Vec<ClusterAssignment>, ServiceError> {
        Ok(self.store.cluster(owner, k)?)
    }

    pub fn register_source(&self, owner: &OwnerId, new: NewSource) -> Result<SourceItem, ServiceError> {
        let item = self.sources.register(owner, new)?;
        log::info!("registered source {} for {owner}", item.id);
        Ok(item)
    }

    /// Remove a source and every embedding generated from it.
    pub fn delete_source(&self, owner: &OwnerId, source_ref_id: &str) -> Result<DeleteSourceResponse, ServiceError> {
        if self.sources.get(owner, source_ref_id)?.is_none() {
            return Err(ServiceError::NotFound(format!("source {source_ref_id} not found")));
        }

        let embeddings_removed = self.store.delete(owner, source_ref_id)?;
        self.sources.remove(owner, source_ref_id)?;

        log::info!(
            "deleted source {source_ref_id} for {owner} with {embeddings_removed} embeddings"
        );

        Ok(DeleteSourceResponse {
            source_ref_id: source_ref_id.to_string(),
            embeddings_removed,
        })
    }

    /// Remove the embeddings of a source, keeping the source itself.
    pub fn delete_embeddings(&self, owner: &OwnerId, source_ref_id: &str) -> Result<usize, ServiceError> {
        Ok(self.store.delete(owner, source_ref_id)?)
    }
}
