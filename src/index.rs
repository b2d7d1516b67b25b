//! Visual index orchestrator.
//!
//! Composes the vocabulary tree, the Hamming embedding, and the inverted
//! index into the build / add / prepare / query lifecycle:
//!
//! ```text
//! Unbuilt -> Built -> (Adding)* -> Prepared -> (Querying)*
//! ```
//!
//! Rebuilding discards all previously added images. Adding clears the
//! prepared flag, so `prepare` must run again before the next query.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::descriptor::{Descriptors, Geometry, ImageScore};
use crate::embedding::{HammingEmbedding, DEFAULT_MAX_HAMMING_DISTANCE, EMBEDDING_BITS};
use crate::inverted::{EmbeddedEntry, InvertedIndex};
use crate::vocabulary::{VocabularyTree, WordMatches};
use crate::{io, IndexError, Result};

/// Options for adding images to the index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// The number of nearest visual words each descriptor is assigned to.
    pub num_neighbors: usize,
    /// Leaf-evaluation budget of the nearest-word search.
    pub num_checks: usize,
    /// Worker threads; 0 uses all available cores.
    pub num_threads: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            num_neighbors: 1,
            num_checks: 256,
            num_threads: 0,
        }
    }
}

/// Options for querying the index.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Maximum number of images to retrieve; negative means unbounded.
    pub max_num_images: i32,
    /// Number of top candidates passed to the spatial verifier; negative
    /// means all.
    pub max_num_verifications: i32,
    /// The number of nearest visual words each descriptor is assigned to.
    pub num_neighbors: usize,
    /// Leaf-evaluation budget of the nearest-word search.
    pub num_checks: usize,
    /// Hard cutoff on the Hamming distance between voting entries; at most
    /// [`EMBEDDING_BITS`].
    pub max_hamming_distance: u32,
    /// Worker threads; 0 uses all available cores.
    pub num_threads: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_num_images: -1,
            max_num_verifications: -1,
            num_neighbors: 5,
            num_checks: 256,
            max_hamming_distance: DEFAULT_MAX_HAMMING_DISTANCE,
            num_threads: 0,
        }
    }
}

/// Options for building the vocabulary.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Target number of visual words (leaf clusters). The actual number
    /// may be smaller.
    pub num_visual_words: usize,
    /// Branching factor of the hierarchical k-means tree.
    pub branching: usize,
    /// k-means refinement rounds per split.
    pub num_iterations: usize,
    /// Recall target of the nearest-word search structure, in (0, 1].
    pub target_precision: f64,
    /// Leaf-evaluation budget when assigning training descriptors during
    /// the embedding fit.
    pub num_checks: usize,
    /// Worker threads; 0 uses all available cores.
    pub num_threads: usize,
    /// Seed for clustering and the embedding projection.
    pub seed: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            num_visual_words: 256 * 256,
            branching: 256,
            num_iterations: 11,
            target_precision: 0.9,
            num_checks: 256,
            num_threads: 0,
            seed: 42,
        }
    }
}

/// Word-level geometry matches for one query descriptor: the query
/// keypoint and the candidate image's keypoints stored under the same
/// visual word.
#[derive(Debug, Clone)]
pub struct FeatureMatches {
    pub query: Geometry,
    pub matches: Vec<Geometry>,
}

/// External spatial verification collaborator.
///
/// Receives the word-level geometry matches between the query and one
/// candidate image and returns a verified similarity score. The index
/// treats the implementation as opaque.
pub trait SpatialVerifier: Send + Sync {
    fn verify(&self, matches: &[FeatureMatches]) -> f32;
}

/// Per-descriptor assignments with their embedded codes.
type AssignedCodes = SmallVec<[(u32, u64); 8]>;

/// Content-based image retrieval index: vocabulary tree with Hamming
/// embedding over an inverted file.
#[derive(Default)]
pub struct VisualIndex {
    pub(crate) vocabulary: Option<VocabularyTree>,
    pub(crate) embedding: Option<HammingEmbedding>,
    pub(crate) inverted: InvertedIndex,
    pub(crate) image_ids: HashSet<u32>,
    pub(crate) prepared: bool,
    verifier: Option<Box<dyn SpatialVerifier>>,
}

impl VisualIndex {
    /// Create an empty, unbuilt index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the spatial verification collaborator used by
    /// [`VisualIndex::query_with_verification`].
    pub fn set_verifier(&mut self, verifier: Box<dyn SpatialVerifier>) {
        self.verifier = Some(verifier);
    }

    /// Number of visual words; 0 before the vocabulary is built.
    pub fn num_visual_words(&self) -> usize {
        self.vocabulary.as_ref().map_or(0, |v| v.num_words())
    }

    /// Number of indexed images.
    pub fn num_images(&self) -> usize {
        self.image_ids.len()
    }

    /// Whether `prepare` has run since the last add.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Build the vocabulary and the Hamming embedding from a training
    /// descriptor set, resetting any previously indexed images.
    ///
    /// On error the index keeps its prior state.
    pub fn build(&mut self, options: &BuildOptions, descriptors: &Descriptors) -> Result<()> {
        let pool = thread_pool(options.num_threads)?;
        let (vocabulary, embedding) = pool.install(|| -> Result<_> {
            let vocabulary = VocabularyTree::build(descriptors, options)?;

            // Top-1 assignments of the training set drive the per-word
            // threshold fit.
            let assignments: Vec<u32> = (0..descriptors.len())
                .into_par_iter()
                .map(|i| {
                    vocabulary
                        .find_words(descriptors.row(i), 1, options.num_checks)[0]
                        .word_id
                })
                .collect();

            let embedding = HammingEmbedding::fit(
                descriptors,
                &assignments,
                vocabulary.num_words(),
                options.seed,
            );
            Ok((vocabulary, embedding))
        })?;

        info!(
            num_words = vocabulary.num_words(),
            dim = vocabulary.dim(),
            training_descriptors = descriptors.len(),
            "visual index built"
        );

        self.inverted = InvertedIndex::new(vocabulary.num_words());
        self.vocabulary = Some(vocabulary);
        self.embedding = Some(embedding);
        self.image_ids.clear();
        self.prepared = false;
        Ok(())
    }

    /// Add an image to the index.
    ///
    /// Each descriptor is assigned to its `num_neighbors` nearest words,
    /// embedded under each, and appended to the matching inverted lists.
    /// When `geometries` is supplied it must be parallel to `descriptors`
    /// and is stored alongside the entries for later verification.
    ///
    /// All-or-nothing: nothing is appended if validation fails. A
    /// previously seen `image_id` is rejected.
    pub fn add(
        &mut self,
        options: &IndexOptions,
        image_id: u32,
        geometries: Option<&[Geometry]>,
        descriptors: &Descriptors,
    ) -> Result<()> {
        let vocabulary = self.vocabulary.as_ref().ok_or(IndexError::NotBuilt)?;
        let embedding = self.embedding.as_ref().ok_or(IndexError::NotBuilt)?;
        if self.image_ids.contains(&image_id) {
            return Err(IndexError::DuplicateImage(image_id));
        }
        if descriptors.dim() != vocabulary.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: vocabulary.dim(),
                actual: descriptors.dim(),
            });
        }
        if let Some(geometries) = geometries {
            if geometries.len() != descriptors.len() {
                return Err(IndexError::Configuration(format!(
                    "geometry count ({}) does not match descriptor count ({})",
                    geometries.len(),
                    descriptors.len()
                )));
            }
        }

        if !descriptors.is_empty() {
            let pool = thread_pool(options.num_threads)?;
            let assigned = pool.install(|| {
                assign_and_embed(
                    vocabulary,
                    embedding,
                    descriptors,
                    options.num_neighbors,
                    options.num_checks,
                )
            });

            for (i, codes) in assigned.iter().enumerate() {
                let geometry = geometries.map(|g| g[i]);
                for &(word_id, code) in codes {
                    self.inverted.add_entry(
                        word_id,
                        EmbeddedEntry {
                            image_id,
                            code,
                            geometry,
                        },
                    );
                }
            }
        }

        self.image_ids.insert(image_id);
        self.prepared = false;
        debug!(image_id, descriptors = descriptors.len(), "image added");
        Ok(())
    }

    /// Recompute the per-word IDF weights and mark the index queryable.
    ///
    /// Must run after all intended adds and before any query; idempotent.
    pub fn prepare(&mut self) -> Result<()> {
        if self.vocabulary.is_none() {
            return Err(IndexError::NotBuilt);
        }
        self.inverted.prepare(self.image_ids.len());
        self.prepared = true;
        info!(num_images = self.image_ids.len(), "index prepared");
        Ok(())
    }

    /// Query for the most similar indexed images, ranked by descending
    /// score; ties break by ascending image id.
    pub fn query(&self, options: &QueryOptions, descriptors: &Descriptors) -> Result<Vec<ImageScore>> {
        let (scores, _) = self.query_and_find_words(options, options.max_num_images, descriptors)?;
        Ok(scores)
    }

    /// Query, then rerank the top candidates through the spatial verifier.
    ///
    /// The top `max_num_verifications` candidates have their scores
    /// replaced by the verifier's result and stay ahead of the unverified
    /// tail, which keeps its original scores and order. Falls back to a
    /// plain query when no verifier is installed or the cutoff is zero.
    pub fn query_with_verification(
        &self,
        options: &QueryOptions,
        geometries: &[Geometry],
        descriptors: &Descriptors,
    ) -> Result<Vec<ImageScore>> {
        if geometries.len() != descriptors.len() {
            return Err(IndexError::Configuration(format!(
                "geometry count ({}) does not match descriptor count ({})",
                geometries.len(),
                descriptors.len()
            )));
        }
        let Some(verifier) = self.verifier.as_ref() else {
            return self.query(options, descriptors);
        };
        if options.max_num_verifications == 0 {
            return self.query(options, descriptors);
        }

        // Rank all candidates first; the verification cutoff bounds how
        // many of them are reranked, while the tail keeps its original
        // scores and order. The max_num_images cut happens after reranking.
        let (mut scores, assignments) = self.query_and_find_words(options, -1, descriptors)?;

        let num_verifications = if options.max_num_verifications < 0 {
            scores.len()
        } else {
            scores.len().min(options.max_num_verifications as usize)
        };
        if num_verifications > 0 {
            let candidates: HashSet<u32> = scores[..num_verifications]
                .iter()
                .map(|s| s.image_id)
                .collect();
            let image_matches = self.collect_matches(&candidates, geometries, &assignments);

            for score in scores[..num_verifications].iter_mut() {
                if let Some(matches) = image_matches.get(&score.image_id) {
                    if !matches.is_empty() {
                        score.score = verifier.verify(matches);
                    }
                }
            }
            // Rerank the verified head; the tail keeps its original order.
            rank(&mut scores[..num_verifications]);
        }

        if options.max_num_images >= 0 {
            scores.truncate(options.max_num_images as usize);
        }
        Ok(scores)
    }

    /// Write the full index state to a file.
    pub fn write(&self, path: &Path) -> Result<()> {
        io::write(self, path)
    }

    /// Replace this index's state with the one persisted at `path`.
    pub fn read(&mut self, path: &Path) -> Result<()> {
        let loaded = io::read(path)?;
        self.vocabulary = loaded.vocabulary;
        self.embedding = loaded.embedding;
        self.inverted = loaded.inverted;
        self.image_ids = loaded.image_ids;
        self.prepared = loaded.prepared;
        Ok(())
    }

    /// Assign query descriptors to words, accumulate inverted-list votes,
    /// and return the truncated ranking together with the per-descriptor
    /// word assignments (reused by the verification path).
    fn query_and_find_words(
        &self,
        options: &QueryOptions,
        max_num_images: i32,
        descriptors: &Descriptors,
    ) -> Result<(Vec<ImageScore>, Vec<AssignedCodes>)> {
        let vocabulary = self.vocabulary.as_ref().ok_or(IndexError::NotBuilt)?;
        let embedding = self.embedding.as_ref().ok_or(IndexError::NotBuilt)?;
        if !self.prepared {
            return Err(IndexError::NotPrepared);
        }
        if descriptors.dim() != vocabulary.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: vocabulary.dim(),
                actual: descriptors.dim(),
            });
        }
        if options.max_hamming_distance as usize > EMBEDDING_BITS {
            return Err(IndexError::Configuration(format!(
                "max_hamming_distance ({}) exceeds the embedding width ({})",
                options.max_hamming_distance, EMBEDDING_BITS
            )));
        }
        if descriptors.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let pool = thread_pool(options.num_threads)?;
        let assigned = pool.install(|| {
            assign_and_embed(
                vocabulary,
                embedding,
                descriptors,
                options.num_neighbors,
                options.num_checks,
            )
        });

        // Sequential accumulation keeps float summation order, and with it
        // the final ranking, deterministic.
        let mut accumulator: HashMap<u32, f32> = HashMap::new();
        for codes in &assigned {
            for &(word_id, code) in codes {
                self.inverted
                    .score(word_id, code, options.max_hamming_distance, &mut accumulator);
            }
        }

        let mut scores: Vec<ImageScore> = accumulator
            .into_iter()
            .filter(|&(_, score)| score > 0.0)
            .map(|(image_id, score)| ImageScore { image_id, score })
            .collect();
        rank(&mut scores);
        if max_num_images >= 0 {
            scores.truncate(max_num_images as usize);
        }
        Ok((scores, assigned))
    }

    /// Gather per-candidate geometry matches for verification, keyed by
    /// each query descriptor's top-1 word.
    fn collect_matches(
        &self,
        candidates: &HashSet<u32>,
        geometries: &[Geometry],
        assignments: &[AssignedCodes],
    ) -> HashMap<u32, Vec<FeatureMatches>> {
        let mut per_image: HashMap<u32, HashMap<usize, Vec<Geometry>>> = HashMap::new();
        let mut buffer = Vec::new();
        for (i, codes) in assignments.iter().enumerate() {
            let Some(&(word_id, _)) = codes.first() else {
                continue;
            };
            buffer.clear();
            self.inverted.find_matches(word_id, candidates, &mut buffer);
            for &(image_id, geometry) in &buffer {
                per_image
                    .entry(image_id)
                    .or_default()
                    .entry(i)
                    .or_default()
                    .push(geometry);
            }
        }

        per_image
            .into_iter()
            .map(|(image_id, by_descriptor)| {
                let mut indices: Vec<usize> = by_descriptor.keys().copied().collect();
                indices.sort_unstable();
                let matches = indices
                    .into_iter()
                    .map(|i| FeatureMatches {
                        query: geometries[i],
                        matches: by_descriptor[&i].clone(),
                    })
                    .collect();
                (image_id, matches)
            })
            .collect()
    }
}

/// Assign descriptors to their nearest words and embed them, in parallel
/// across descriptors.
fn assign_and_embed(
    vocabulary: &VocabularyTree,
    embedding: &HammingEmbedding,
    descriptors: &Descriptors,
    num_neighbors: usize,
    num_checks: usize,
) -> Vec<AssignedCodes> {
    (0..descriptors.len())
        .into_par_iter()
        .map(|i| {
            let row = descriptors.row(i);
            let matches: WordMatches = vocabulary.find_words(row, num_neighbors, num_checks);
            matches
                .into_iter()
                .map(|m| (m.word_id, embedding.embed(row, m.word_id)))
                .collect()
        })
        .collect()
}

/// Sort by descending score, ties by ascending image id.
fn rank(scores: &mut [ImageScore]) {
    scores.sort_unstable_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.image_id.cmp(&b.image_id))
    });
}

fn thread_pool(num_threads: usize) -> Result<rayon::ThreadPool> {
    // rayon treats 0 as "use all available cores".
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| IndexError::Configuration(format!("failed to build thread pool: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_by_score_then_id() {
        let mut scores = vec![
            ImageScore { image_id: 3, score: 1.0 },
            ImageScore { image_id: 1, score: 2.0 },
            ImageScore { image_id: 2, score: 1.0 },
        ];
        rank(&mut scores);
        let ids: Vec<u32> = scores.iter().map(|s| s.image_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn empty_index_reports_zero_words() {
        let index = VisualIndex::new();
        assert_eq!(index.num_visual_words(), 0);
        assert!(!index.is_prepared());
    }
}
