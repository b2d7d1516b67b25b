//! Hierarchical k-means vocabulary tree.
//!
//! The tree partitions descriptor space into visual words by repeatedly
//! splitting the most populated leaf into `branching` k-means clusters
//! until the leaf budget is reached. Leaves are the visual words; interior
//! nodes are kept so nearest-word lookup can run as a bounded best-bin-
//! first traversal instead of a linear scan over all words.
//!
//! `target_precision` does not change which words exist. It is resolved at
//! build time into a default search effort: the smallest check budget
//! whose recall@1 on a training sample matches the target, measured
//! against an exact scan over the leaf centroids.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::debug;

use super::kmeans::KMeans;
use crate::descriptor::{l2_squared, Descriptors};
use crate::index::BuildOptions;
use crate::{IndexError, Result};

/// Odd constant mixed into per-node k-means seeds.
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Maximum number of training descriptors used to calibrate the default
/// search effort against `target_precision`.
const CALIBRATION_SAMPLE: usize = 256;

/// A visual word matched to a query descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordMatch {
    pub word_id: u32,
    /// Squared L2 distance to the word centroid.
    pub distance: f32,
}

/// Per-descriptor assigned word list. Small inline capacity covers the
/// common `num_neighbors` range without heap traffic.
pub type WordMatches = SmallVec<[WordMatch; 8]>;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) centroid: Vec<u8>,
    /// Child node indices; empty for leaves.
    pub(crate) children: Vec<u32>,
    /// Visual word id; only meaningful for leaves.
    pub(crate) word_id: u32,
}

impl Node {
    #[inline]
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// The built vocabulary: tree nodes plus the calibrated search effort.
#[derive(Debug, Clone)]
pub struct VocabularyTree {
    nodes: Vec<Node>,
    dim: usize,
    num_words: usize,
    calibrated_checks: usize,
}

/// Node under construction: float centroid plus its member descriptors.
struct BuildNode {
    centroid: Vec<f32>,
    members: Vec<u32>,
    children: Vec<usize>,
    /// Set when a split failed to separate the members; the node stays a
    /// leaf even though it is large enough to split.
    terminal: bool,
}

impl VocabularyTree {
    /// Build the vocabulary from a training descriptor set.
    pub fn build(descriptors: &Descriptors, options: &BuildOptions) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(IndexError::Configuration(
                "cannot build a vocabulary from an empty training set".to_string(),
            ));
        }
        if options.branching < 2 {
            return Err(IndexError::Configuration(format!(
                "branching must be at least 2, got {}",
                options.branching
            )));
        }
        if options.num_visual_words < options.branching {
            return Err(IndexError::Configuration(format!(
                "num_visual_words ({}) must be at least the branching factor ({})",
                options.num_visual_words, options.branching
            )));
        }
        if descriptors.len() < options.num_visual_words {
            return Err(IndexError::Configuration(format!(
                "need at least num_visual_words ({}) training descriptors, got {}",
                options.num_visual_words,
                descriptors.len()
            )));
        }
        if !(options.target_precision > 0.0 && options.target_precision <= 1.0) {
            return Err(IndexError::Configuration(format!(
                "target_precision must be in (0, 1], got {}",
                options.target_precision
            )));
        }

        let dim = descriptors.dim();
        let all_members: Vec<u32> = (0..descriptors.len() as u32).collect();
        let mut build_nodes = vec![BuildNode {
            centroid: mean_centroid(descriptors, &all_members),
            members: all_members,
            children: Vec::new(),
            terminal: false,
        }];
        let mut num_leaves = 1usize;

        loop {
            if num_leaves + options.branching - 1 > options.num_visual_words {
                break;
            }
            // Largest splittable leaf; ties broken by lowest node id.
            let mut target: Option<usize> = None;
            for (id, node) in build_nodes.iter().enumerate() {
                if !node.children.is_empty() || node.terminal {
                    continue;
                }
                if node.members.len() < options.branching {
                    continue;
                }
                if target.is_none_or(|t| node.members.len() > build_nodes[t].members.len()) {
                    target = Some(id);
                }
            }
            let Some(target) = target else { break };

            let seed = options
                .seed
                .wrapping_add(SEED_MIX.wrapping_mul(target as u64 + 1));
            let mut km = KMeans::new(dim, options.branching, seed)?;
            km.fit(descriptors, &build_nodes[target].members, options.num_iterations)?;
            let assignments = km.assign(descriptors, &build_nodes[target].members);

            let mut groups: Vec<Vec<u32>> = vec![Vec::new(); options.branching];
            for (&m, &cluster) in build_nodes[target].members.iter().zip(&assignments) {
                groups[cluster].push(m);
            }

            let non_empty = groups.iter().filter(|g| !g.is_empty()).count();
            if non_empty < 2 {
                // Members are indistinguishable to k-means; stop this branch.
                build_nodes[target].terminal = true;
                continue;
            }

            let mut child_ids = Vec::with_capacity(non_empty);
            for (cluster, group) in groups.into_iter().enumerate() {
                if group.is_empty() {
                    continue;
                }
                let id = build_nodes.len();
                build_nodes.push(BuildNode {
                    centroid: km.centroids()[cluster].clone(),
                    members: group,
                    children: Vec::new(),
                    terminal: false,
                });
                child_ids.push(id);
            }
            num_leaves += child_ids.len() - 1;
            build_nodes[target].children = child_ids;
        }

        // Finalize: quantize centroids, assign word ids to leaves in
        // depth-first order so ids are stable for a fixed build.
        let mut nodes: Vec<Node> = build_nodes
            .iter()
            .map(|n| Node {
                centroid: quantize_centroid(&n.centroid),
                children: n.children.iter().map(|&c| c as u32).collect(),
                word_id: u32::MAX,
            })
            .collect();

        let mut num_words = 0u32;
        let mut stack = vec![0usize];
        while let Some(id) = stack.pop() {
            if nodes[id].is_leaf() {
                nodes[id].word_id = num_words;
                num_words += 1;
            } else {
                // Reverse so the lowest child index is visited first.
                for &child in nodes[id].children.iter().rev() {
                    stack.push(child as usize);
                }
            }
        }

        let mut tree = Self {
            nodes,
            dim,
            num_words: num_words as usize,
            calibrated_checks: 0,
        };
        tree.calibrated_checks = tree.calibrate(descriptors, options.target_precision);
        debug!(
            num_words = tree.num_words,
            nodes = tree.nodes.len(),
            calibrated_checks = tree.calibrated_checks,
            "vocabulary tree built"
        );
        Ok(tree)
    }

    /// Number of visual words (leaves).
    #[inline]
    pub fn num_words(&self) -> usize {
        self.num_words
    }

    /// Descriptor dimension the tree was built for.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Find the `num_neighbors` nearest visual words for a descriptor.
    ///
    /// `num_checks` caps the number of leaf evaluations; the effective
    /// effort never drops below the budget calibrated at build time.
    pub fn find_words(&self, descriptor: &[u8], num_neighbors: usize, num_checks: usize) -> WordMatches {
        let effective = num_checks.max(self.calibrated_checks).max(num_neighbors);
        self.search_with_checks(descriptor, num_neighbors, effective)
    }

    /// Best-bin-first traversal with an explicit leaf-evaluation budget.
    fn search_with_checks(&self, descriptor: &[u8], num_neighbors: usize, checks: usize) -> WordMatches {
        // Min-heap on (distance, node id); the id component makes the pop
        // order a total order, so results are deterministic.
        let mut frontier: BinaryHeap<Reverse<(u64, u32)>> = BinaryHeap::new();
        frontier.push(Reverse((l2_squared(descriptor, &self.nodes[0].centroid), 0)));

        let mut leaves: Vec<(u64, u32)> = Vec::with_capacity(checks.min(self.num_words));
        let mut evaluated = 0usize;

        while let Some(Reverse((dist, id))) = frontier.pop() {
            let node = &self.nodes[id as usize];
            if node.is_leaf() {
                leaves.push((dist, node.word_id));
                evaluated += 1;
                if evaluated >= checks {
                    break;
                }
            } else {
                for &child in &node.children {
                    let d = l2_squared(descriptor, &self.nodes[child as usize].centroid);
                    frontier.push(Reverse((d, child)));
                }
            }
        }

        leaves.sort_unstable();
        leaves
            .into_iter()
            .take(num_neighbors)
            .map(|(dist, word_id)| WordMatch {
                word_id,
                distance: dist as f32,
            })
            .collect()
    }

    /// Exact nearest word by linear scan over leaf centroids; ties go to
    /// the lowest word id. Used only for calibration and tests.
    fn exact_nearest_word(&self, descriptor: &[u8]) -> u32 {
        let mut best = (u64::MAX, u32::MAX);
        for node in &self.nodes {
            if node.is_leaf() {
                let d = l2_squared(descriptor, &node.centroid);
                if (d, node.word_id) < best {
                    best = (d, node.word_id);
                }
            }
        }
        best.1
    }

    /// Resolve `target_precision` into a default check budget: the
    /// smallest power of two whose recall@1 on a training sample reaches
    /// the target.
    fn calibrate(&self, descriptors: &Descriptors, target_precision: f64) -> usize {
        let n = descriptors.len();
        let sample_size = n.min(CALIBRATION_SAMPLE);
        let sample: Vec<usize> = (0..sample_size).map(|i| i * n / sample_size).collect();

        let exact: Vec<u32> = sample
            .par_iter()
            .map(|&i| self.exact_nearest_word(descriptors.row(i)))
            .collect();

        let mut checks = 1usize;
        while checks < self.num_words {
            let hits: usize = sample
                .par_iter()
                .zip(&exact)
                .filter(|&(&i, &word)| {
                    self.search_with_checks(descriptors.row(i), 1, checks)
                        .first()
                        .is_some_and(|m| m.word_id == word)
                })
                .count();
            if hits as f64 >= target_precision * sample.len() as f64 {
                return checks;
            }
            checks *= 2;
        }
        self.num_words
    }

    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        dim: usize,
        num_words: usize,
        calibrated_checks: usize,
    ) -> Self {
        Self {
            nodes,
            dim,
            num_words,
            calibrated_checks,
        }
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn calibrated_checks(&self) -> usize {
        self.calibrated_checks
    }
}

fn mean_centroid(descriptors: &Descriptors, members: &[u32]) -> Vec<f32> {
    let mut sums = vec![0.0f64; descriptors.dim()];
    for &m in members {
        for (acc, &v) in sums.iter_mut().zip(descriptors.row(m as usize)) {
            *acc += v as f64;
        }
    }
    sums.iter().map(|&s| (s / members.len() as f64) as f32).collect()
}

/// Round and clip a float centroid back to descriptor bytes.
fn quantize_centroid(centroid: &[f32]) -> Vec<u8> {
    centroid.iter().map(|&v| v.round().clamp(0.0, 255.0) as u8).collect()
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

    fn build_options(num_visual_words: usize, branching: usize) -> BuildOptions {
        BuildOptions {
            num_visual_words,
            branching,
            ..BuildOptions::default()
        }
    }

    #[test]
    fn leaf_count_never_exceeds_target() {
        let descs = random_descriptors(500, 8, 1);
        for &target in &[10, 16, 33, 100] {
            let tree = VocabularyTree::build(&descs, &build_options(target, 5)).unwrap();
            assert!(tree.num_words() <= target, "{} > {}", tree.num_words(), target);
            assert!(tree.num_words() >= 2);
        }
    }

    #[test]
    fn single_split_hits_target_exactly() {
        // One split of the root into `branching` children lands exactly on
        // the target when branching == num_visual_words.
        let descs = random_descriptors(1000, 8, 2);
        let tree = VocabularyTree::build(&descs, &build_options(10, 10)).unwrap();
        assert_eq!(tree.num_words(), 10);
    }

    #[test]
    fn rejects_bad_configuration() {
        let descs = random_descriptors(100, 8, 3);
        assert!(VocabularyTree::build(&descs, &build_options(10, 1)).is_err());
        assert!(VocabularyTree::build(&descs, &build_options(4, 8)).is_err());
        assert!(VocabularyTree::build(&descs, &build_options(200, 4)).is_err());
        let empty = Descriptors::new(8).unwrap();
        assert!(VocabularyTree::build(&empty, &build_options(10, 4)).is_err());
    }

    #[test]
    fn build_is_deterministic() {
        let descs = random_descriptors(300, 8, 4);
        let t1 = VocabularyTree::build(&descs, &build_options(20, 4)).unwrap();
        let t2 = VocabularyTree::build(&descs, &build_options(20, 4)).unwrap();
        assert_eq!(t1.num_words(), t2.num_words());
        for i in 0..descs.len() {
            assert_eq!(
                t1.find_words(descs.row(i), 3, 32),
                t2.find_words(descs.row(i), 3, 32)
            );
        }
    }

    #[test]
    fn exhaustive_search_matches_linear_scan() {
        let descs = random_descriptors(300, 8, 5);
        let tree = VocabularyTree::build(&descs, &build_options(20, 4)).unwrap();
        for i in (0..descs.len()).step_by(7) {
            let row = descs.row(i);
            let approx = tree.search_with_checks(row, 1, tree.num_words());
            assert_eq!(approx[0].word_id, tree.exact_nearest_word(row));
        }
    }

    #[test]
    fn results_sorted_by_distance() {
        let descs = random_descriptors(300, 8, 6);
        let tree = VocabularyTree::build(&descs, &build_options(25, 5)).unwrap();
        let matches = tree.find_words(descs.row(0), 5, 64);
        for pair in matches.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn full_precision_calibration_is_exact() {
        // 200 descriptors, so the calibration sample covers the whole set.
        let descs = random_descriptors(200, 8, 7);
        let options = BuildOptions {
            num_visual_words: 30,
            branching: 5,
            target_precision: 1.0,
            ..BuildOptions::default()
        };
        let tree = VocabularyTree::build(&descs, &options).unwrap();
        // With target precision 1.0 the calibrated budget must reproduce
        // the exact nearest word on every training sample.
        for i in (0..descs.len()).step_by(11) {
            let row = descs.row(i);
            let matches = tree.find_words(row, 1, 1);
            assert_eq!(matches[0].word_id, tree.exact_nearest_word(row));
        }
    }
}
