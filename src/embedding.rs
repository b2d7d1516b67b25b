//! Hamming embedding of descriptors within visual words.
//!
//! A single seeded projection maps descriptors into 64 real dimensions.
//! Each visual word then learns one threshold per dimension (the median of
//! its training descriptors' projected values), so the resulting bit codes
//! are calibrated to the word's own local distribution: bits concentrate
//! their distinguishing power where that word's descriptors actually vary.
//!
//! Two codes under the same word are compared by Hamming distance
//! (XOR + popcount). Scoring applies a hard distance cutoff and a Gaussian
//! falloff, both monotone in the distance.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::descriptor::Descriptors;

/// Width of the binary embedding. Codes are `u64`, so the hot scoring loop
/// compares fixed-size machine words.
pub const EMBEDDING_BITS: usize = 64;

/// Default hard cutoff on the Hamming distance between voting entries.
pub const DEFAULT_MAX_HAMMING_DISTANCE: u32 = 24;

/// Falloff bandwidth: `exp(-d^2 / SIGMA^2)`.
const SIGMA: f32 = 16.0;

/// Distance-decreasing vote weight for a Hamming distance.
///
/// Monotonically non-increasing in `d`; 1.0 at distance zero.
#[inline]
pub fn hamming_falloff(d: u32) -> f32 {
    let d = d as f32;
    (-(d * d) / (SIGMA * SIGMA)).exp()
}

/// Per-word binary embedding model.
#[derive(Debug, Clone)]
pub struct HammingEmbedding {
    /// Projection matrix, `EMBEDDING_BITS` rows of length `dim`.
    projection: Vec<f32>,
    /// Per-word thresholds, `num_words * EMBEDDING_BITS`.
    thresholds: Vec<f32>,
    dim: usize,
    num_words: usize,
}

impl HammingEmbedding {
    /// Fit the embedding from training descriptors and their top-1 word
    /// assignments.
    ///
    /// Words with fewer than two training samples keep all-zero thresholds
    /// (a fixed neutral value); sparse vocabulary leaves are expected and
    /// not an error.
    pub fn fit(
        descriptors: &Descriptors,
        word_assignments: &[u32],
        num_words: usize,
        seed: u64,
    ) -> Self {
        debug_assert_eq!(descriptors.len(), word_assignments.len());
        let dim = descriptors.dim();
        let projection = generate_projection(dim, seed);

        let projected: Vec<[f32; EMBEDDING_BITS]> = (0..descriptors.len())
            .into_par_iter()
            .map(|i| project(&projection, dim, descriptors.row(i)))
            .collect();

        let mut per_word: Vec<Vec<usize>> = vec![Vec::new(); num_words];
        for (i, &word) in word_assignments.iter().enumerate() {
            per_word[word as usize].push(i);
        }

        let mut thresholds = vec![0.0f32; num_words * EMBEDDING_BITS];
        for (word, samples) in per_word.iter().enumerate() {
            if samples.len() < 2 {
                continue;
            }
            let mut values = Vec::with_capacity(samples.len());
            for bit in 0..EMBEDDING_BITS {
                values.clear();
                values.extend(samples.iter().map(|&i| projected[i][bit]));
                thresholds[word * EMBEDDING_BITS + bit] = median(&mut values);
            }
        }

        Self {
            projection,
            thresholds,
            dim,
            num_words,
        }
    }

    /// Embed a descriptor under a visual word: bit `i` is set iff the
    /// projected value on dimension `i` exceeds the word's learned median.
    pub fn embed(&self, descriptor: &[u8], word_id: u32) -> u64 {
        debug_assert_eq!(descriptor.len(), self.dim);
        let proj = project(&self.projection, self.dim, descriptor);
        let thresholds =
            &self.thresholds[word_id as usize * EMBEDDING_BITS..(word_id as usize + 1) * EMBEDDING_BITS];
        let mut code = 0u64;
        for (bit, (&p, &t)) in proj.iter().zip(thresholds.iter()).enumerate() {
            if p > t {
                code |= 1u64 << bit;
            }
        }
        code
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub(crate) fn projection(&self) -> &[f32] {
        &self.projection
    }

    pub(crate) fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    pub(crate) fn from_parts(
        projection: Vec<f32>,
        thresholds: Vec<f32>,
        dim: usize,
        num_words: usize,
    ) -> Self {
        Self {
            projection,
            thresholds,
            dim,
            num_words,
        }
    }
}

/// Seeded projection: uniform rows, Gram-Schmidt orthonormalized against
/// the preceding rows (as far as the descriptor dimension allows).
fn generate_projection(dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows: Vec<Vec<f32>> = Vec::with_capacity(EMBEDDING_BITS);

    for i in 0..EMBEDDING_BITS {
        let mut row: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect();

        if i < dim {
            for prev in &rows[..i.min(rows.len())] {
                let dot: f32 = row.iter().zip(prev.iter()).map(|(a, b)| a * b).sum();
                for (r, p) in row.iter_mut().zip(prev.iter()) {
                    *r -= dot * p;
                }
            }
        }

        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-6 {
            for v in row.iter_mut() {
                *v /= norm;
            }
        } else {
            // Degenerate row after orthogonalization; fall back to a basis
            // vector so the projection keeps full bit width.
            row.iter_mut().for_each(|v| *v = 0.0);
            row[i % dim] = 1.0;
        }
        rows.push(row);
    }

    rows.into_iter().flatten().collect()
}

#[inline]
fn project(projection: &[f32], dim: usize, descriptor: &[u8]) -> [f32; EMBEDDING_BITS] {
    let mut out = [0.0f32; EMBEDDING_BITS];
    for (bit, row) in projection.chunks_exact(dim).enumerate() {
        let mut dot = 0.0f32;
        for (&r, &v) in row.iter().zip(descriptor.iter()) {
            dot += r * v as f32;
        }
        out[bit] = dot;
    }
    out
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_descriptors(n: usize, dim: usize, seed: u64) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(seed);
        let flat: Vec<u8> = (0..n * dim).map(|_| rng.random()).collect();
        Descriptors::from_flat(flat, dim).unwrap()
    }

    #[test]
    fn falloff_is_monotone() {
        for d in 0..EMBEDDING_BITS as u32 {
            assert!(hamming_falloff(d) >= hamming_falloff(d + 1));
        }
        assert!((hamming_falloff(0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fit_is_deterministic() {
        let descs = random_descriptors(100, 16, 11);
        let words: Vec<u32> = (0..100).map(|i| i % 4).collect();
        let e1 = HammingEmbedding::fit(&descs, &words, 4, 99);
        let e2 = HammingEmbedding::fit(&descs, &words, 4, 99);
        assert_eq!(e1.projection(), e2.projection());
        assert_eq!(e1.thresholds(), e2.thresholds());
        for i in 0..descs.len() {
            assert_eq!(e1.embed(descs.row(i), words[i]), e2.embed(descs.row(i), words[i]));
        }
    }

    #[test]
    fn identical_descriptors_embed_identically() {
        let descs = random_descriptors(50, 16, 12);
        let words = vec![0u32; 50];
        let embedding = HammingEmbedding::fit(&descs, &words, 1, 0);
        let a = embedding.embed(descs.row(3), 0);
        let b = embedding.embed(descs.row(3), 0);
        assert_eq!(a ^ b, 0);
    }

    #[test]
    fn sparse_word_gets_neutral_thresholds() {
        let descs = random_descriptors(10, 16, 13);
        // Word 1 receives a single sample; word 0 the rest.
        let mut words = vec![0u32; 10];
        words[9] = 1;
        let embedding = HammingEmbedding::fit(&descs, &words, 2, 0);
        let sparse = &embedding.thresholds()[EMBEDDING_BITS..2 * EMBEDDING_BITS];
        assert!(sparse.iter().all(|&t| t == 0.0));
    }

    #[test]
    fn medians_split_the_word_population() {
        let descs = random_descriptors(64, 16, 14);
        let words = vec![0u32; 64];
        let embedding = HammingEmbedding::fit(&descs, &words, 1, 5);

        // Each bit should cut the word's own population roughly in half.
        for bit in 0..EMBEDDING_BITS {
            let set = (0..64)
                .filter(|&i| embedding.embed(descs.row(i), 0) >> bit & 1 == 1)
                .count();
            assert!((8..=56).contains(&set), "bit {bit} set in {set}/64 samples");
        }
    }
}
