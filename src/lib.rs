//! retina: content-based image retrieval index.
//!
//! Given a database of images represented by sets of local feature
//! descriptors, `retina` builds a compact searchable structure and, for a
//! query image's descriptors, returns a ranked list of the most visually
//! similar database images. It replaces exhaustive pairwise descriptor
//! comparison with sub-linear inverted-index lookup.
//!
//! The design follows the vocabulary-tree / Hamming-embedding retrieval
//! model:
//!
//! - `vocabulary/`: hierarchical k-means tree whose leaves are visual
//!   words, with bounded-effort approximate nearest-word search
//! - `embedding`: per-word 64-bit binary codes with median thresholds,
//!   compared by Hamming distance
//! - `inverted`: per-word posting lists with IDF weights; the scoring
//!   hot loop
//! - `index`: the [`VisualIndex`] orchestrator and its options
//! - `io`: single-file binary persistence with CRC validation
//!
//! Approximation is intentional: both word assignment (bounded search
//! effort) and within-word similarity (64-bit codes) trade exactness for
//! speed. Exact nearest-neighbor retrieval is a non-goal.
//!
//! # Usage
//!
//! ```rust,ignore
//! use retina::{BuildOptions, Descriptors, IndexOptions, QueryOptions, VisualIndex};
//!
//! let mut index = VisualIndex::new();
//! index.build(&BuildOptions::default(), &training)?;
//! index.add(&IndexOptions::default(), 1, Some(&keypoints), &descriptors)?;
//! index.prepare()?;
//! let ranking = index.query(&QueryOptions::default(), &query)?;
//! ```

pub mod descriptor;
pub mod embedding;
pub mod error;
pub mod index;
pub mod inverted;
pub mod io;
pub mod vocabulary;

pub use descriptor::{Descriptors, Geometry, ImageScore};
pub use embedding::{HammingEmbedding, EMBEDDING_BITS};
pub use error::{IndexError, Result};
pub use index::{
    BuildOptions, FeatureMatches, IndexOptions, QueryOptions, SpatialVerifier, VisualIndex,
};
pub use inverted::{EmbeddedEntry, InvertedIndex};
pub use vocabulary::{VocabularyTree, WordMatch};
