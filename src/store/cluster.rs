//! Coarse single-pass clustering for exploratory grouping.
//!
//! `k` distinct records are drawn uniformly at random as centroids and every
//! record is assigned to the closest one by cosine distance. There is no
//! refinement step, so cluster quality depends on the draw.
//
// TODO: add optional Lloyd refinement (recompute centroids as cluster means,
// reassign until assignments stop changing) behind a `refine_iterations` knob.

use rand::Rng;

use crate::store::record::{ClusterAssignment, EmbeddingRecord};
use crate::store::similarity::{cosine_with_norms, l2_norm};

/// Assign `records` to `k` randomly chosen centroids.
///
/// Callers guarantee `1 <= k <= records.len()`. Cluster ids follow the order
/// in which the centroids were drawn.
pub fn single_pass<R: Rng + ?Sized>(
    records: &[&EmbeddingRecord],
    k: usize,
    rng: &mut R,
) -> Vec<ClusterAssignment> {
    debug_assert!(k >= 1 && k <= records.len());

    let centroids: Vec<usize> = rand::seq::index::sample(rng, records.len(), k).into_vec();
    let centroid_norms: Vec<f32> = centroids
        .iter()
        .map(|&c| l2_norm(&records[c].vector))
        .collect();

    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let norm = l2_norm(&record.vector);
            let (cluster_id, distance) = match centroids.iter().position(|&c| c == i) {
                Some(own) => (own, 0.0),
                None => centroids
                    .iter()
                    .zip(centroid_norms.iter())
                    .enumerate()
                    .map(|(cluster, (&c, &c_norm))| {
                        let similarity =
                            cosine_with_norms(&record.vector, norm, &records[c].vector, c_norm);
                        (cluster, 1.0 - similarity)
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
                    .unwrap_or((0, 1.0)),
            };

            ClusterAssignment {
                record_id: record.id.clone(),
                source_ref_id: record.source_ref_id.clone(),
                cluster_id,
                distance,
            }
        })
        .collect()
}
