//! Embedding store and similarity engine.
//!
//! Durable `(content, vector)` records, partitioned per owner, with
//! nearest-neighbour search, duplicate detection, statistics and coarse
//! clustering.
//!
//! # Architecture
//!
//! - `record`: record, key and result types
//! - `similarity`: cosine similarity helpers
//! - `hnsw`: per-partition approximate nearest-neighbour graph
//! - `partition`: one owner's records, lookup maps and graph
//! - `persist`: binary partition files
//! - `cluster`: single-pass random-centroid clustering

mod cluster;
pub mod hnsw;
mod partition;
pub mod persist;
pub mod record;
pub mod similarity;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rand::Rng;

use crate::config::IndexConfig;
use crate::eid::{OwnerId, RecordId};
use partition::{Partition, Upsert};
pub use persist::{PartitionFiles, PersistError};
pub use record::{
    ClusterAssignment, ContentHash, DuplicateCandidate, EmbeddingRecord, NewEmbedding,
    OwnerStats, RecordKey, SimilarMatch, TaskType,
};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Insufficient data: {requested} clusters requested, {available} records stored")]
    InsufficientData { requested: usize, available: usize },

    #[error("Storage error: {0}")]
    Persist(#[from] PersistError),

    #[error("Internal error: {0}")]
    Internal(String),
}

type SharedPartition = Arc<RwLock<Partition>>;

pub struct EmbeddingStore {
    dimensions: usize,
    config: IndexConfig,
    /// `None` keeps everything in memory.
    files: Option<PartitionFiles>,
    partitions: RwLock<HashMap<OwnerId, SharedPartition>>,
}

impl EmbeddingStore {
    /// Create a store that never touches disk.
    pub fn in_memory(dimensions: usize, config: IndexConfig) -> Self {
        Self {
            dimensions,
            config,
            files: None,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a durable store, loading every partition file found.
    pub fn open(files: PartitionFiles, dimensions: usize, config: IndexConfig) -> Result<Self, StoreError> {
        let mut partitions = HashMap::new();
        let mut total = 0;
        for (owner, records) in files.load_all()? {
            total += records.len();
            let partition = Partition::from_records(owner.clone(), config.clone(), records);
            partitions.insert(owner, Arc::new(RwLock::new(partition)));
        }
        log::info!(
            "Loaded {} embeddings for {} owners from {}",
            total,
            partitions.len(),
            files.dir().display()
        );

        Ok(Self {
            dimensions,
            config,
            files: Some(files),
            partitions: RwLock::new(partitions),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn owner_count(&self) -> usize {
        self.partitions.read().map(|p| p.len()).unwrap_or(0)
    }

    fn partition(&self, owner: &OwnerId) -> Result<Option<SharedPartition>, StoreError> {
        let partitions = self
            .partitions
            .read()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(partitions.get(owner).cloned())
    }

    fn partition_or_create(&self, owner: &OwnerId) -> Result<SharedPartition, StoreError> {
        if let Some(partition) = self.partition(owner)? {
            return Ok(partition);
        }
        let mut partitions = self
            .partitions
            .write()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(partitions
            .entry(owner.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(Partition::new(owner.clone(), self.config.clone())))
            })
            .clone())
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidArgument(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    fn check_threshold(threshold: f32) -> Result<(), StoreError> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(StoreError::InvalidArgument(format!(
                "threshold must be within [-1, 1], got {threshold}"
            )));
        }
        Ok(())
    }

    /// Write the partition file if memory has changed since the last successful write.
    fn persist(&self, partition: &mut Partition) -> Result<(), StoreError> {
        if !partition.is_dirty() {
            return Ok(());
        }
        if let Some(files) = &self.files {
            if partition.is_empty() {
                files.delete(partition.owner())?;
            } else {
                files.save(partition.owner(), &partition.records())?;
            }
        }
        partition.mark_clean();
        Ok(())
    }

    /// Insert a record, or update the existing one for (`source_ref_id`, `task_type`).
    ///
    /// Writes to one owner are serialized by the partition lock, which is held
    /// until the partition file is written.
    pub fn put(&self, owner: &OwnerId, new: NewEmbedding) -> Result<RecordId, StoreError> {
        self.check_vector(&new.vector)?;
        if new.source_ref_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("source_ref_id is empty".to_string()));
        }

        let partition = self.partition_or_create(owner)?;
        let mut partition = partition
            .write()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;

        let source_ref_id = new.source_ref_id.clone();
        let outcome = partition.upsert(new, Utc::now());
        match &outcome {
            Upsert::Inserted(id) => log::debug!("inserted {id} for {owner}/{source_ref_id}"),
            Upsert::Updated(id) => log::debug!("updated {id} for {owner}/{source_ref_id}"),
            Upsert::Unchanged(id) => log::debug!("touched {id} for {owner}/{source_ref_id}"),
        }

        self.persist(&mut partition)?;
        Ok(outcome.record_id().clone())
    }

    /// Owner's records with cosine similarity >= `threshold`, best first.
    pub fn find_similar(
        &self,
        owner: &OwnerId,
        query: &[f32],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<SimilarMatch>, StoreError> {
        self.check_vector(query)?;
        Self::check_threshold(threshold)?;

        let Some(partition) = self.partition(owner)? else {
            return Ok(Vec::new());
        };
        let partition = partition
            .read()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(partition.similar(query, threshold, max_results))
    }

    /// Exact duplicates by content hash, then near duplicates by similarity.
    pub fn find_duplicates(
        &self,
        owner: &OwnerId,
        content_hash: &ContentHash,
        query: &[f32],
        threshold: f32,
    ) -> Result<Vec<DuplicateCandidate>, StoreError> {
        self.check_vector(query)?;
        Self::check_threshold(threshold)?;

        let Some(partition) = self.partition(owner)? else {
            return Ok(Vec::new());
        };
        let partition = partition
            .read()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(partition.duplicates(content_hash, query, threshold))
    }

    pub fn stats(&self, owner: &OwnerId) -> Result<OwnerStats, StoreError> {
        let Some(partition) = self.partition(owner)? else {
            return Ok(OwnerStats::default());
        };
        let partition = partition
            .read()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(partition.stats())
    }

    pub fn get(
        &self,
        owner: &OwnerId,
        source_ref_id: &str,
        task_type: TaskType,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let Some(partition) = self.partition(owner)? else {
            return Ok(None);
        };
        let partition = partition
            .read()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        let key = RecordKey {
            source_ref_id: source_ref_id.to_string(),
            task_type,
        };
        Ok(partition.get(&key).cloned())
    }

    /// Group the owner's records around `k` random centroids.
    pub fn cluster(&self, owner: &OwnerId, k: usize) -> Result<Vec<ClusterAssignment>, StoreError> {
        self.cluster_with_rng(owner, k, &mut rand::rng())
    }

    pub fn cluster_with_rng<R: Rng + ?Sized>(
        &self,
        owner: &OwnerId,
        k: usize,
        rng: &mut R,
    ) -> Result<Vec<ClusterAssignment>, StoreError> {
        if k == 0 {
            return Err(StoreError::InvalidArgument("k must be at least 1".to_string()));
        }

        let partition = self.partition(owner)?;
        let partition = match &partition {
            Some(p) => Some(
                p.read()
                    .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?,
            ),
            None => None,
        };
        let records = partition.as_ref().map(|p| p.records()).unwrap_or_default();

        if records.len() < k {
            return Err(StoreError::InsufficientData {
                requested: k,
                available: records.len(),
            });
        }

        Ok(cluster::single_pass(&records, k, rng))
    }

    /// Remove every embedding of `source_ref_id`. Returns how many were removed.
    pub fn delete(&self, owner: &OwnerId, source_ref_id: &str) -> Result<usize, StoreError> {
        let Some(partition) = self.partition(owner)? else {
            return Ok(0);
        };
        let mut partition = partition
            .write()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;

        let removed = partition.remove_source(source_ref_id);
        if !removed.is_empty() {
            log::debug!("removed {} embeddings of {owner}/{source_ref_id}", removed.len());
        }

        // an earlier failed write may still be pending even when nothing was removed now
        self.persist(&mut partition)?;
        Ok(removed.len())
    }
}
