//! Shared fixtures: a deterministic embedder and isolated services.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::eid::OwnerId;
use crate::embedding::{Embedder, Embedding, EmbeddingError};
use crate::service::EmbeddingService;
use crate::sources::{NewSource, SourceCatalog, SourceMetadata};
use crate::store::{EmbeddingStore, PartitionFiles, TaskType};

pub const DIMS: usize = 32;

/// Bag-of-words embedder: every lowercase word adds 1.0 to one dimension
/// chosen by its crc32, so texts sharing words are similar.
pub struct WordsEmbedder {
    dims: usize,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl WordsEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0; self.dims];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            v[crc32fast::hash(word.as_bytes()) as usize % self.dims] += 1.0;
        }
        v
    }
}

impl Embedder for WordsEmbedder {
    fn embed(&self, text: &str, _task: TaskType) -> Result<Embedding, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(Embedding {
            vector: self.vector(text),
            latency: Duration::from_millis(1),
        })
    }

    fn model_name(&self) -> &str {
        "words"
    }
}

pub fn test_config(base: &std::path::Path) -> Config {
    let mut config = Config::load_with(base).expect("failed to load config");
    config.store.dimensions = DIMS;
    config.batch.cooldown_ms = 0;
    config
}

/// Creates a durable service in a fresh temp directory.
pub fn create_service() -> (EmbeddingService, Arc<WordsEmbedder>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let (service, embedder) = open_service(tmp.path());
    (service, embedder, tmp)
}

pub fn open_service(base: &std::path::Path) -> (EmbeddingService, Arc<WordsEmbedder>) {
    let config = test_config(base);
    let embedder = Arc::new(WordsEmbedder::new(DIMS));

    let files = PartitionFiles::new(config.embeddings_dir(), embedder.model_name(), DIMS)
        .expect("failed to open partition dir");
    let store = EmbeddingStore::open(files, DIMS, config.store.index.clone())
        .expect("failed to open store");
    let sources = SourceCatalog::open(base).expect("failed to open sources");

    let service = EmbeddingService::new(store, sources, embedder.clone(), &config)
        .expect("failed to build service");
    (service, embedder)
}

pub fn web_page(id: &str, title: &str) -> NewSource {
    NewSource {
        id: Some(id.to_string()),
        title: title.to_string(),
        url: Some(format!("https://example.com/{id}")),
        summary: format!("summary of {title}"),
        metadata: SourceMetadata::WebPage { site_name: None },
        ..Default::default()
    }
}

pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name)
}
