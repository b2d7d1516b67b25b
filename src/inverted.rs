//! Inverted index: per-word posting lists of embedded entries.
//!
//! Each visual word owns an append-only list of `(image, code, geometry)`
//! entries plus an IDF-style weight computed once all images are indexed.
//! `score` is the single hot loop of the whole system: it scans one list
//! and votes for every stored entry within the Hamming cutoff of the
//! query code.

use std::collections::{HashMap, HashSet};

use crate::descriptor::Geometry;
use crate::embedding::hamming_falloff;

/// One indexed descriptor: owning image, 64-bit embedded code, and the
/// keypoint geometry when the caller supplied it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbeddedEntry {
    pub image_id: u32,
    pub code: u64,
    pub geometry: Option<Geometry>,
}

/// Per-word posting lists with cached IDF weights.
#[derive(Debug, Clone, Default)]
pub struct InvertedIndex {
    lists: Vec<Vec<EmbeddedEntry>>,
    weights: Vec<f32>,
}

impl InvertedIndex {
    /// Create an index with one empty list per visual word.
    pub fn new(num_words: usize) -> Self {
        Self {
            lists: vec![Vec::new(); num_words],
            weights: vec![0.0; num_words],
        }
    }

    #[inline]
    pub fn num_words(&self) -> usize {
        self.lists.len()
    }

    /// Append an entry to a word's list. A single image may legitimately
    /// contribute several entries to the same word.
    #[inline]
    pub fn add_entry(&mut self, word_id: u32, entry: EmbeddedEntry) {
        self.lists[word_id as usize].push(entry);
    }

    /// Recompute per-word IDF weights from the current lists.
    ///
    /// A word present in few of the `num_total_images` indexed images is
    /// discriminative and weighted high; a word present in every image
    /// gets weight zero. Idempotent and re-runnable after further adds.
    pub fn prepare(&mut self, num_total_images: usize) {
        let mut distinct = HashSet::new();
        for (list, weight) in self.lists.iter().zip(self.weights.iter_mut()) {
            distinct.clear();
            distinct.extend(list.iter().map(|e| e.image_id));
            *weight = if distinct.is_empty() || num_total_images == 0 {
                0.0
            } else {
                (num_total_images as f32 / distinct.len() as f32).ln()
            };
        }
    }

    /// Vote for all entries of `word_id` within `max_distance` of `code`.
    ///
    /// Adds `weight * falloff(d)` to the accumulator slot of each matching
    /// entry's image. An empty list is a no-op; a zero-weight word is
    /// scanned but contributes nothing.
    #[inline]
    pub fn score(
        &self,
        word_id: u32,
        code: u64,
        max_distance: u32,
        accumulator: &mut HashMap<u32, f32>,
    ) {
        let weight = self.weights[word_id as usize];
        for entry in &self.lists[word_id as usize] {
            let d = (code ^ entry.code).count_ones();
            if d <= max_distance {
                *accumulator.entry(entry.image_id).or_insert(0.0) += weight * hamming_falloff(d);
            }
        }
    }

    /// Collect the geometries stored under `word_id` for a candidate image
    /// set; used to feed the spatial verifier. Entries added without
    /// geometry are skipped.
    pub fn find_matches(
        &self,
        word_id: u32,
        candidates: &HashSet<u32>,
        out: &mut Vec<(u32, Geometry)>,
    ) {
        for entry in &self.lists[word_id as usize] {
            if let Some(geometry) = entry.geometry {
                if candidates.contains(&entry.image_id) {
                    out.push((entry.image_id, geometry));
                }
            }
        }
    }

    pub(crate) fn lists(&self) -> &[Vec<EmbeddedEntry>] {
        &self.lists
    }

    pub(crate) fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub(crate) fn from_parts(lists: Vec<Vec<EmbeddedEntry>>, weights: Vec<f32>) -> Self {
        Self { lists, weights }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(image_id: u32, code: u64) -> EmbeddedEntry {
        EmbeddedEntry {
            image_id,
            code,
            geometry: None,
        }
    }

    #[test]
    fn idf_rewards_rare_words() {
        let mut index = InvertedIndex::new(2);
        // Word 0 occurs in one of four images, word 1 in all four.
        index.add_entry(0, entry(1, 0));
        for image_id in 1..=4 {
            index.add_entry(1, entry(image_id, 0));
        }
        index.prepare(4);

        assert!(index.weights()[0] > index.weights()[1]);
        assert!((index.weights()[0] - 4.0f32.ln()).abs() < 1e-6);
        assert_eq!(index.weights()[1], 0.0);
    }

    #[test]
    fn prepare_is_rerunnable() {
        let mut index = InvertedIndex::new(1);
        index.add_entry(0, entry(1, 0));
        index.prepare(2);
        let first = index.weights()[0];

        index.add_entry(0, entry(2, 0));
        index.prepare(2);
        assert!(index.weights()[0] < first);
        index.prepare(2);
        assert_eq!(index.weights()[0], 0.0);
    }

    #[test]
    fn score_respects_hamming_cutoff() {
        let mut index = InvertedIndex::new(1);
        index.add_entry(0, entry(1, 0));
        index.add_entry(0, entry(2, u64::MAX));
        index.prepare(3);

        let mut acc = HashMap::new();
        index.score(0, 0, 8, &mut acc);
        assert!(acc.contains_key(&1));
        assert!(!acc.contains_key(&2));

        // Widening the cutoff to the full width admits the far entry too.
        let mut acc = HashMap::new();
        index.score(0, 0, 64, &mut acc);
        assert!(acc.contains_key(&2));
        assert!(acc[&1] > acc[&2]);
    }

    #[test]
    fn scoring_empty_word_is_noop() {
        let mut index = InvertedIndex::new(2);
        index.add_entry(0, entry(1, 0));
        index.prepare(1);

        let mut acc = HashMap::new();
        index.score(1, 0, 64, &mut acc);
        assert!(acc.is_empty());
    }

    #[test]
    fn multiple_entries_accumulate() {
        let mut index = InvertedIndex::new(1);
        index.add_entry(0, entry(1, 0));
        index.add_entry(0, entry(1, 0));
        index.add_entry(0, entry(2, 0));
        index.prepare(3);

        let mut acc = HashMap::new();
        index.score(0, 0, 64, &mut acc);
        assert!((acc[&1] - 2.0 * acc[&2]).abs() < 1e-6);
    }

    #[test]
    fn find_matches_filters_candidates_and_geometry() {
        let mut index = InvertedIndex::new(1);
        let geom = Geometry {
            x: 1.0,
            y: 2.0,
            scale: 3.0,
            orientation: 0.5,
        };
        index.add_entry(
            0,
            EmbeddedEntry {
                image_id: 1,
                code: 0,
                geometry: Some(geom),
            },
        );
        index.add_entry(0, entry(1, 0));
        index.add_entry(
            0,
            EmbeddedEntry {
                image_id: 2,
                code: 0,
                geometry: Some(geom),
            },
        );

        let candidates: HashSet<u32> = [1].into_iter().collect();
        let mut out = Vec::new();
        index.find_matches(0, &candidates, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 1);
    }
}
