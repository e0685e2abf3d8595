//! All records of one owner together with their ANN graph and lookup maps.
//!
//! A partition never sees another owner's data; the store hands out one
//! partition per owner and every query runs against exactly one of them.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::IndexConfig;
use crate::eid::{OwnerId, RecordId};
use crate::store::hnsw::HnswGraph;
use crate::store::record::{
    ContentHash, DuplicateCandidate, EmbeddingRecord, NewEmbedding, OwnerStats, RecordKey,
    SimilarMatch,
};
use crate::store::similarity::{cosine_with_norms, l2_norm};

/// Graphs below this size are never compacted, a rebuild would not pay off.
const MIN_COMPACT_NODES: usize = 64;

/// Outcome of [`Partition::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Upsert {
    Inserted(RecordId),
    Updated(RecordId),
    /// Same hash and vector as stored; only `updated_at` moved.
    Unchanged(RecordId),
}

impl Upsert {
    pub fn record_id(&self) -> &RecordId {
        match self {
            Upsert::Inserted(id) | Upsert::Updated(id) | Upsert::Unchanged(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ranked {
    handle: u64,
    score: f32,
}

pub(crate) struct Partition {
    owner: OwnerId,
    config: IndexConfig,
    /// Record handle (its insertion seq) -> record
    records: HashMap<u64, EmbeddingRecord>,
    keys: HashMap<RecordKey, u64>,
    by_hash: HashMap<ContentHash, BTreeSet<u64>>,
    graph: HnswGraph,
    /// Record handle -> live graph node
    nodes: HashMap<u64, usize>,
    next_seq: u64,
    /// Set by every mutation, cleared once the partition file matches memory.
    dirty: bool,
}

impl Partition {
    pub fn new(owner: OwnerId, config: IndexConfig) -> Self {
        let graph = HnswGraph::new(config.hnsw.clone(), Self::graph_seed(&owner));
        Self {
            owner,
            config,
            records: HashMap::new(),
            keys: HashMap::new(),
            by_hash: HashMap::new(),
            graph,
            nodes: HashMap::new(),
            next_seq: 0,
            dirty: false,
        }
    }

    /// Rebuild a partition from persisted records, keeping their order.
    pub fn from_records(
        owner: OwnerId,
        config: IndexConfig,
        mut records: Vec<EmbeddingRecord>,
    ) -> Self {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));

        let mut partition = Self::new(owner, config);
        for (seq, mut record) in records.into_iter().enumerate() {
            let seq = seq as u64;
            record.seq = seq;
            partition.attach(seq, record);
        }
        partition.next_seq = partition.records.len() as u64;
        partition
    }

    fn graph_seed(owner: &OwnerId) -> u64 {
        crc32fast::hash(owner.as_str().as_bytes()) as u64
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn graph_tombstones(&self) -> usize {
        self.graph.tombstones()
    }

    /// Records in insertion order.
    pub fn records(&self) -> Vec<&EmbeddingRecord> {
        let mut records: Vec<&EmbeddingRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn get(&self, key: &RecordKey) -> Option<&EmbeddingRecord> {
        self.keys.get(key).and_then(|h| self.records.get(h))
    }

    fn attach(&mut self, handle: u64, record: EmbeddingRecord) {
        let node = self.graph.insert(handle, record.vector.clone());
        self.nodes.insert(handle, node);
        self.keys.insert(record.key(), handle);
        self.by_hash
            .entry(record.content_hash.clone())
            .or_default()
            .insert(handle);
        self.records.insert(handle, record);
    }

    fn unlink_hash(&mut self, hash: &ContentHash, handle: u64) {
        if let Some(handles) = self.by_hash.get_mut(hash) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.by_hash.remove(hash);
            }
        }
    }

    /// Insert or update-in-place the record for (`source_ref_id`, `task_type`).
    ///
    /// The vector must already be validated against the store dimensions.
    pub fn upsert(&mut self, new: NewEmbedding, now: DateTime<Utc>) -> Upsert {
        self.dirty = true;
        let key = RecordKey {
            source_ref_id: new.source_ref_id.clone(),
            task_type: new.task_type,
        };

        let Some(&handle) = self.keys.get(&key) else {
            let handle = self.next_seq;
            self.next_seq += 1;

            let id = RecordId::new();
            let record = EmbeddingRecord {
                id: id.clone(),
                owner_id: self.owner.clone(),
                source_ref_id: new.source_ref_id,
                task_type: new.task_type,
                vector: new.vector,
                content_hash: new.content_hash,
                source_text: new.source_text,
                created_at: now,
                updated_at: now,
                seq: handle,
            };
            self.attach(handle, record);
            return Upsert::Inserted(id);
        };

        let (id, old_hash, vector_changed) = {
            let Some(record) = self.records.get_mut(&handle) else {
                log::warn!("dangling key {key:?} in partition of {}", self.owner);
                self.keys.remove(&key);
                return self.upsert(new, now);
            };
            record.updated_at = now;
            if record.content_hash == new.content_hash && record.vector == new.vector {
                return Upsert::Unchanged(record.id.clone());
            }
            let old_hash = std::mem::replace(&mut record.content_hash, new.content_hash.clone());
            let vector_changed = record.vector != new.vector;
            record.vector = new.vector;
            record.source_text = new.source_text;
            (record.id.clone(), old_hash, vector_changed)
        };

        if old_hash != new.content_hash {
            self.unlink_hash(&old_hash, handle);
            self.by_hash.entry(new.content_hash).or_default().insert(handle);
        }

        if vector_changed {
            if let Some(old_node) = self.nodes.remove(&handle) {
                self.graph.mark_deleted(old_node);
            }
            let vector = self.records[&handle].vector.clone();
            let node = self.graph.insert(handle, vector);
            self.nodes.insert(handle, node);
            self.maybe_compact();
        }

        Upsert::Updated(id)
    }

    /// Drop every task type stored for `source_ref_id`.
    pub fn remove_source(&mut self, source_ref_id: &str) -> Vec<EmbeddingRecord> {
        let keys: Vec<RecordKey> = self
            .keys
            .keys()
            .filter(|k| k.source_ref_id == source_ref_id)
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(handle) = self.keys.remove(&key) else {
                continue;
            };
            if let Some(node) = self.nodes.remove(&handle) {
                self.graph.mark_deleted(node);
            }
            if let Some(record) = self.records.remove(&handle) {
                self.unlink_hash(&record.content_hash, handle);
                removed.push(record);
            }
        }

        if !removed.is_empty() {
            self.dirty = true;
            self.maybe_compact();
        }
        removed
    }

    fn maybe_compact(&mut self) {
        let total = self.graph.len();
        if total < MIN_COMPACT_NODES {
            return;
        }
        let ratio = self.graph.tombstones() as f32 / total as f32;
        if ratio > self.config.compact_tombstone_ratio {
            log::debug!(
                "compacting graph of owner {} ({} tombstones of {})",
                self.owner,
                self.graph.tombstones(),
                total
            );
            self.rebuild_graph();
        }
    }

    fn rebuild_graph(&mut self) {
        let mut graph = HnswGraph::new(self.config.hnsw.clone(), Self::graph_seed(&self.owner));
        let mut nodes = HashMap::with_capacity(self.records.len());
        for record in self.records() {
            let node = graph.insert(record.seq, record.vector.clone());
            nodes.insert(record.seq, node);
        }
        self.graph = graph;
        self.nodes = nodes;
    }

    /// Records scoring at least `threshold`, best first, at most `limit`.
    ///
    /// Small partitions are scanned exactly. Larger ones ask the graph for
    /// candidates and rescore them against the stored vectors.
    fn ranked(&self, query: &[f32], threshold: f32, limit: usize) -> Vec<Ranked> {
        if limit == 0 || self.records.is_empty() {
            return Vec::new();
        }
        let query_norm = l2_norm(query);
        let score_of = |record: &EmbeddingRecord| {
            cosine_with_norms(query, query_norm, &record.vector, l2_norm(&record.vector))
        };

        let mut ranked: Vec<Ranked> = if self.records.len() < self.config.exact_search_below {
            self.records
                .iter()
                .map(|(&handle, record)| Ranked {
                    handle,
                    score: score_of(record),
                })
                .filter(|r| r.score >= threshold)
                .collect()
        } else {
            let ef = self.config.hnsw.ef_search.max(limit);
            self.graph
                .search(query, ef, ef)
                .into_iter()
                .filter_map(|n| {
                    self.records.get(&n.handle).map(|record| Ranked {
                        handle: n.handle,
                        score: score_of(record),
                    })
                })
                .filter(|r| r.score >= threshold)
                .collect()
        };

        ranked.sort_by(|a, b| self.rank_order(a, b));
        ranked.truncate(limit);
        ranked
    }

    /// Descending score, then ascending `created_at`, then insertion order.
    fn rank_order(&self, a: &Ranked, b: &Ranked) -> Ordering {
        b.score.total_cmp(&a.score).then_with(|| {
            let ra = &self.records[&a.handle];
            let rb = &self.records[&b.handle];
            ra.created_at.cmp(&rb.created_at).then(ra.seq.cmp(&rb.seq))
        })
    }

    pub fn similar(&self, query: &[f32], threshold: f32, max_results: usize) -> Vec<SimilarMatch> {
        self.ranked(query, threshold, max_results)
            .into_iter()
            .map(|r| {
                let record = &self.records[&r.handle];
                SimilarMatch {
                    record_id: record.id.clone(),
                    source_ref_id: record.source_ref_id.clone(),
                    score: r.score,
                    task_type: record.task_type,
                    created_at: record.created_at,
                    source_text: record.source_text.clone(),
                }
            })
            .collect()
    }

    /// Exact hash matches first, then near duplicates by ascending distance.
    pub fn duplicates(
        &self,
        hash: &ContentHash,
        query: &[f32],
        threshold: f32,
    ) -> Vec<DuplicateCandidate> {
        let query_norm = l2_norm(query);
        let exact: Vec<u64> = self
            .by_hash
            .get(hash)
            .map(|handles| handles.iter().copied().collect())
            .unwrap_or_default();
        let exact_set: HashSet<u64> = exact.iter().copied().collect();

        let mut exact_matches: Vec<Ranked> = exact
            .into_iter()
            .map(|handle| {
                let record = &self.records[&handle];
                Ranked {
                    handle,
                    score: cosine_with_norms(
                        query,
                        query_norm,
                        &record.vector,
                        l2_norm(&record.vector),
                    ),
                }
            })
            .collect();
        exact_matches.sort_by(|a, b| self.rank_order(a, b));

        // near duplicates are capped on both search paths; exact ones never are
        let limit = self.config.max_duplicate_candidates;
        let near = self
            .ranked(query, threshold, limit.saturating_add(exact_set.len()))
            .into_iter()
            .filter(|r| !exact_set.contains(&r.handle))
            .take(limit);

        let to_candidate = |r: Ranked, is_exact_duplicate: bool| {
            let record = &self.records[&r.handle];
            DuplicateCandidate {
                record_id: record.id.clone(),
                source_ref_id: record.source_ref_id.clone(),
                similarity: r.score,
                is_exact_duplicate,
                created_at: record.created_at,
            }
        };

        exact_matches
            .into_iter()
            .map(|r| to_candidate(r, true))
            .chain(near.map(|r| to_candidate(r, false)))
            .collect()
    }

    pub fn stats(&self) -> OwnerStats {
        if self.records.is_empty() {
            return OwnerStats::default();
        }

        let task_types: BTreeSet<_> = self.records.values().map(|r| r.task_type).collect();
        let total_chars: usize = self
            .records
            .values()
            .map(|r| r.source_text.chars().count())
            .sum();

        OwnerStats {
            count: self.records.len(),
            distinct_task_types: task_types.len(),
            avg_text_length: total_chars as f64 / self.records.len() as f64,
            oldest_created_at: self.records.values().map(|r| r.created_at).min(),
            newest_created_at: self.records.values().map(|r| r.created_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskType;

    fn config(exact_search_below: usize) -> IndexConfig {
        IndexConfig {
            exact_search_below,
            ..Default::default()
        }
    }

    fn new(source: &str, vector: Vec<f32>, text: &str) -> NewEmbedding {
        NewEmbedding {
            source_ref_id: source.to_string(),
            task_type: TaskType::RetrievalDocument,
            vector,
            content_hash: ContentHash::of(text),
            source_text: text.to_string(),
        }
    }

    fn unit(dims: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[i % dims] = 1.0;
        v[(i * 7 + 3) % dims] += 0.5;
        v
    }

    #[test]
    fn test_upsert_outcomes() {
        let mut partition = Partition::new(OwnerId::new("u1"), config(1000));
        let now = Utc::now();

        let first = partition.upsert(new("r1", vec![1.0, 0.0], "a"), now);
        assert!(matches!(first, Upsert::Inserted(_)));

        let same = partition.upsert(new("r1", vec![1.0, 0.0], "a"), now);
        assert_eq!(same, Upsert::Unchanged(first.record_id().clone()));
        assert_eq!(partition.graph_tombstones(), 0);

        let changed = partition.upsert(new("r1", vec![0.0, 1.0], "a"), now);
        assert_eq!(changed, Upsert::Updated(first.record_id().clone()));
        assert_eq!(partition.graph_tombstones(), 1);
        assert_eq!(partition.len(), 1);
    }

    #[test]
    fn test_text_change_moves_hash_index() {
        let mut partition = Partition::new(OwnerId::new("u1"), config(1000));
        partition.upsert(new("r1", vec![1.0, 0.0], "old"), Utc::now());
        partition.upsert(new("r1", vec![1.0, 0.0], "new"), Utc::now());

        assert!(partition
            .duplicates(&ContentHash::of("old"), &[0.0, 1.0], 0.99)
            .is_empty());
        let dups = partition.duplicates(&ContentHash::of("new"), &[0.0, 1.0], 0.99);
        assert_eq!(dups.len(), 1);
        assert!(dups[0].is_exact_duplicate);
        // vector untouched, so no tombstone
        assert_eq!(partition.graph_tombstones(), 0);
    }

    #[test]
    fn test_graph_and_exact_paths_agree() {
        let dims = 16;
        let mut exact = Partition::new(OwnerId::new("u1"), config(usize::MAX));
        let mut graph = Partition::new(OwnerId::new("u1"), config(0));
        let now = Utc::now();
        for i in 0..40 {
            exact.upsert(new(&format!("r{i}"), unit(dims, i), &format!("t{i}")), now);
            graph.upsert(new(&format!("r{i}"), unit(dims, i), &format!("t{i}")), now);
        }

        let query = unit(dims, 5);
        let a: Vec<String> = exact
            .similar(&query, 0.5, 3)
            .into_iter()
            .map(|m| m.source_ref_id)
            .collect();
        let b: Vec<String> = graph
            .similar(&query, 0.5, 3)
            .into_iter()
            .map(|m| m.source_ref_id)
            .collect();
        assert_eq!(a, b);
        assert_eq!(a[0], "r5");
    }

    #[test]
    fn test_compaction_clears_tombstones() {
        let dims = 8;
        let mut partition = Partition::new(OwnerId::new("u1"), config(0));
        let now = Utc::now();
        for i in 0..100 {
            partition.upsert(new(&format!("r{i}"), unit(dims, i), &format!("t{i}")), now);
        }

        // 43 updates push the tombstone share past 0.3 and trigger a rebuild
        for i in 0..50 {
            let mut v = unit(dims, i);
            v[0] += 2.0;
            partition.upsert(new(&format!("r{i}"), v, &format!("t{i}")), now);
        }

        assert_eq!(partition.len(), 100);
        assert!(partition.graph_tombstones() < 43);
        assert_eq!(partition.graph.live_len(), 100);
    }

    #[test]
    fn test_remove_source_drops_all_task_types() {
        let mut partition = Partition::new(OwnerId::new("u1"), config(1000));
        let now = Utc::now();
        let mut query = new("r1", vec![1.0, 0.0], "a");
        query.task_type = TaskType::RetrievalQuery;
        partition.upsert(query, now);
        partition.upsert(new("r1", vec![1.0, 0.0], "a"), now);
        partition.upsert(new("r2", vec![0.0, 1.0], "b"), now);

        let removed = partition.remove_source("r1");
        assert_eq!(removed.len(), 2);
        assert_eq!(partition.len(), 1);
        assert!(partition.duplicates(&ContentHash::of("a"), &[1.0, 0.0], 0.99).is_empty());
        assert!(partition.remove_source("r1").is_empty());
    }

    #[test]
    fn test_from_records_keeps_order() {
        let mut partition = Partition::new(OwnerId::new("u1"), config(1000));
        let now = Utc::now();
        partition.upsert(new("r1", vec![1.0, 0.0], "a"), now);
        partition.upsert(new("r2", vec![1.0, 0.0], "b"), now);

        let records: Vec<EmbeddingRecord> = partition.records().into_iter().cloned().collect();
        let restored = Partition::from_records(OwnerId::new("u1"), config(1000), records);

        let order: Vec<String> = restored
            .similar(&[1.0, 0.0], 0.0, 10)
            .into_iter()
            .map(|m| m.source_ref_id)
            .collect();
        assert_eq!(order, vec!["r1", "r2"]);
    }
}
