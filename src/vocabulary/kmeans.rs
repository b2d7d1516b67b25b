//! k-means clustering over byte descriptors.
//!
//! Used by the vocabulary tree to split a node's members into child
//! clusters. Centroids are kept as `f32` during refinement; the tree
//! quantizes them back to `u8` when a node is finalized.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::descriptor::Descriptors;
use crate::{IndexError, Result};

/// k-means with k-means++ initialization and a fixed refinement budget.
///
/// All randomness comes from the configured seed, so repeated `fit` calls
/// on the same inputs produce identical centroids.
pub struct KMeans {
    /// Centroids (k x dim).
    centroids: Vec<Vec<f32>>,
    dim: usize,
    k: usize,
    seed: u64,
}

impl KMeans {
    /// Create new k-means with `k` clusters.
    pub fn new(dim: usize, k: usize, seed: u64) -> Result<Self> {
        if dim == 0 || k == 0 {
            return Err(IndexError::Configuration(
                "k-means dimension and k must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            centroids: Vec::new(),
            dim,
            k,
            seed,
        })
    }

    /// Train on the subset of `descriptors` named by `members`.
    ///
    /// Runs k-means++ initialization followed by at most `iterations`
    /// assignment/update rounds, stopping early once assignments no longer
    /// change.
    pub fn fit(
        &mut self,
        descriptors: &Descriptors,
        members: &[u32],
        iterations: usize,
    ) -> Result<()> {
        if members.is_empty() {
            return Err(IndexError::Configuration(
                "cannot run k-means on an empty member set".to_string(),
            ));
        }
        if descriptors.dim() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: descriptors.dim(),
            });
        }

        self.centroids = self.init_plus_plus(descriptors, members);

        let mut assignments = self.assign(descriptors, members);
        for _ in 0..iterations {
            self.update_centroids(descriptors, members, &assignments);
            let next = self.assign(descriptors, members);
            if next == assignments {
                break;
            }
            assignments = next;
        }
        Ok(())
    }

    /// k-means++ initialization: first center uniform, the rest weighted
    /// by distance to the nearest already-chosen center.
    fn init_plus_plus(&self, descriptors: &Descriptors, members: &[u32]) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(self.k);

        let first = members[rng.random_range(0..members.len())];
        centroids.push(to_f32(descriptors.row(first as usize)));

        for _ in 1..self.k {
            let mut distances = Vec::with_capacity(members.len());
            let mut total = 0.0f64;
            for &m in members {
                let row = descriptors.row(m as usize);
                let min_dist = centroids
                    .iter()
                    .map(|c| dist_to_centroid(row, c))
                    .fold(f32::INFINITY, f32::min);
                distances.push(min_dist);
                total += min_dist as f64;
            }

            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = members[members.len() - 1];
            for (i, &d) in distances.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = members[i];
                    break;
                }
            }
            centroids.push(to_f32(descriptors.row(chosen as usize)));
        }

        centroids
    }

    /// Assign each member to its nearest centroid.
    ///
    /// Per-member work is independent, so this is the data-parallel section
    /// of a build; ties go to the lowest centroid index.
    pub fn assign(&self, descriptors: &Descriptors, members: &[u32]) -> Vec<usize> {
        members
            .par_iter()
            .map(|&m| {
                let row = descriptors.row(m as usize);
                let mut best = 0;
                let mut best_dist = f32::INFINITY;
                for (idx, centroid) in self.centroids.iter().enumerate() {
                    let d = dist_to_centroid(row, centroid);
                    if d < best_dist {
                        best_dist = d;
                        best = idx;
                    }
                }
                best
            })
            .collect()
    }

    /// Recompute centroids as cluster means. Empty clusters keep their
    /// previous centroid.
    fn update_centroids(
        &mut self,
        descriptors: &Descriptors,
        members: &[u32],
        assignments: &[usize],
    ) {
        let mut sums = vec![vec![0.0f64; self.dim]; self.k];
        let mut counts = vec![0usize; self.k];

        for (&m, &cluster) in members.iter().zip(assignments.iter()) {
            counts[cluster] += 1;
            for (acc, &v) in sums[cluster].iter_mut().zip(descriptors.row(m as usize)) {
                *acc += v as f64;
            }
        }

        for (cluster, (sum, &count)) in sums.iter().zip(counts.iter()).enumerate() {
            if count > 0 {
                for (c, s) in self.centroids[cluster].iter_mut().zip(sum.iter()) {
                    *c = (*s / count as f64) as f32;
                }
            }
        }
    }

    /// Trained centroids.
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }
}

#[inline]
fn to_f32(row: &[u8]) -> Vec<f32> {
    row.iter().map(|&v| v as f32).collect()
}

/// Squared L2 distance between a byte descriptor and a float centroid.
#[inline]
pub(crate) fn dist_to_centroid(row: &[u8], centroid: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (&v, &c) in row.iter().zip(centroid.iter()) {
        let d = v as f32 - c;
        sum += d * d;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor_set(rows: &[[u8; 4]]) -> Descriptors {
        let flat: Vec<u8> = rows.iter().flatten().copied().collect();
        Descriptors::from_flat(flat, 4).unwrap()
    }

    #[test]
    fn separates_obvious_clusters() {
        let descs = descriptor_set(&[
            [0, 0, 0, 0],
            [1, 0, 1, 0],
            [0, 1, 0, 1],
            [250, 250, 250, 250],
            [255, 250, 255, 250],
            [250, 255, 250, 255],
        ]);
        let members: Vec<u32> = (0..6).collect();
        let mut km = KMeans::new(4, 2, 7).unwrap();
        km.fit(&descs, &members, 10).unwrap();

        let assignments = km.assign(&descs, &members);
        assert_eq!(assignments[0], assignments[1]);
        assert_eq!(assignments[1], assignments[2]);
        assert_eq!(assignments[3], assignments[4]);
        assert_eq!(assignments[4], assignments[5]);
        assert_ne!(assignments[0], assignments[3]);
    }

    #[test]
    fn empty_members_rejected() {
        let descs = descriptor_set(&[[0, 0, 0, 0]]);
        let mut km = KMeans::new(4, 1, 0).unwrap();
        assert!(km.fit(&descs, &[], 5).is_err());
    }

    proptest! {
        #[test]
        fn fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            raw in proptest::collection::vec(any::<u8>(), 32..256),
            k in 1usize..5,
        ) {
            let dim = 4;
            let n = raw.len() / dim;
            prop_assume!(n >= k);
            let descs = Descriptors::from_flat(raw[..n * dim].to_vec(), dim).unwrap();
            let members: Vec<u32> = (0..n as u32).collect();

            let mut km1 = KMeans::new(dim, k, seed).unwrap();
            let mut km2 = KMeans::new(dim, k, seed).unwrap();
            km1.fit(&descs, &members, 8).unwrap();
            km2.fit(&descs, &members, 8).unwrap();

            prop_assert_eq!(km1.centroids(), km2.centroids());
            prop_assert_eq!(
                km1.assign(&descs, &members),
                km2.assign(&descs, &members)
            );
        }
    }
}
