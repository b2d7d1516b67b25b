//! Visual vocabulary: hierarchical k-means tree over descriptor space.
//!
//! The tree's leaves are the visual words. Build once from a training
//! descriptor sample; afterwards the tree only answers bounded-effort
//! nearest-word queries.

pub mod kmeans;
pub mod tree;

pub use tree::{VocabularyTree, WordMatch, WordMatches};
