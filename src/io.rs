//! Binary persistence of the full index state.
//!
//! # File layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Magic bytes (4B): "RVI1"                │
//! │ Format version (4B)                     │
//! │ Payload length (8B)                     │
//! ├─────────────────────────────────────────┤
//! │ Payload:                                │
//! │   embedding bit width, descriptor dim,  │
//! │   vocabulary size                       │
//! │   vocabulary tree nodes                 │
//! │   projection + per-word thresholds      │
//! │   inverted lists (weights + entries)    │
//! │   image id set, prepared flag           │
//! ├─────────────────────────────────────────┤
//! │ CRC32 of the payload (4B)               │
//! └─────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Reading validates the magic bytes,
//! version, embedding width, and checksum, and reconstructs a state with
//! identical query behavior — including an unprepared index if the write
//! happened before `prepare`.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::descriptor::Geometry;
use crate::embedding::{HammingEmbedding, EMBEDDING_BITS};
use crate::index::VisualIndex;
use crate::inverted::{EmbeddedEntry, InvertedIndex};
use crate::vocabulary::tree::Node;
use crate::vocabulary::VocabularyTree;
use crate::{IndexError, Result};

/// Magic bytes for persisted index files.
const MAGIC: [u8; 4] = *b"RVI1";

/// Current format version.
const FORMAT_VERSION: u32 = 1;

/// Write the full index state to `path`.
pub(crate) fn write(index: &VisualIndex, path: &Path) -> Result<()> {
    let vocabulary = index.vocabulary.as_ref().ok_or(IndexError::NotBuilt)?;
    let embedding = index.embedding.as_ref().ok_or(IndexError::NotBuilt)?;

    let payload = encode_payload(index, vocabulary, embedding);
    let checksum = crc32fast::hash(&payload);

    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(&MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&(payload.len() as u64).to_le_bytes())?;
    file.write_all(&payload)?;
    file.write_all(&checksum.to_le_bytes())?;
    file.flush()?;

    debug!(path = %path.display(), bytes = payload.len() + 20, "index written");
    Ok(())
}

/// Read a persisted index from `path`.
pub(crate) fn read(path: &Path) -> Result<VisualIndex> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < 20 {
        return Err(IndexError::Format("file too short for header".to_string()));
    }
    if bytes[..4] != MAGIC {
        return Err(IndexError::Format("bad magic bytes".to_string()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(IndexError::Format(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }
    let payload_len = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default()) as usize;
    if bytes.len() != 16 + payload_len + 4 {
        return Err(IndexError::Format(format!(
            "payload length {} disagrees with file size {}",
            payload_len,
            bytes.len()
        )));
    }
    let payload = &bytes[16..16 + payload_len];
    let expected = u32::from_le_bytes(bytes[16 + payload_len..].try_into().unwrap_or_default());
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(IndexError::ChecksumMismatch { expected, actual });
    }

    decode_payload(payload)
}

fn encode_payload(index: &VisualIndex, vocabulary: &VocabularyTree, embedding: &HammingEmbedding) -> Vec<u8> {
    let mut buf = Vec::new();

    // Header fields.
    put_u32(&mut buf, EMBEDDING_BITS as u32);
    put_u32(&mut buf, vocabulary.dim() as u32);
    put_u64(&mut buf, vocabulary.num_words() as u64);

    // Vocabulary tree.
    put_u64(&mut buf, vocabulary.calibrated_checks() as u64);
    put_u64(&mut buf, vocabulary.nodes().len() as u64);
    for node in vocabulary.nodes() {
        buf.extend_from_slice(&node.centroid);
        put_u32(&mut buf, node.word_id);
        put_u32(&mut buf, node.children.len() as u32);
        for &child in &node.children {
            put_u32(&mut buf, child);
        }
    }

    // Embedding model.
    for &v in embedding.projection() {
        put_f32(&mut buf, v);
    }
    for &t in embedding.thresholds() {
        put_f32(&mut buf, t);
    }

    // Inverted lists.
    for (list, &weight) in index.inverted.lists().iter().zip(index.inverted.weights()) {
        put_f32(&mut buf, weight);
        put_u64(&mut buf, list.len() as u64);
        for entry in list {
            put_u32(&mut buf, entry.image_id);
            put_u64(&mut buf, entry.code);
            match entry.geometry {
                Some(g) => {
                    buf.push(1);
                    put_f32(&mut buf, g.x);
                    put_f32(&mut buf, g.y);
                    put_f32(&mut buf, g.scale);
                    put_f32(&mut buf, g.orientation);
                }
                None => buf.push(0),
            }
        }
    }

    // Metadata. Ids are written sorted so identical states produce
    // identical files.
    let mut image_ids: Vec<u32> = index.image_ids.iter().copied().collect();
    image_ids.sort_unstable();
    put_u64(&mut buf, image_ids.len() as u64);
    for id in image_ids {
        put_u32(&mut buf, id);
    }
    buf.push(index.prepared as u8);

    buf
}

fn decode_payload(payload: &[u8]) -> Result<VisualIndex> {
    let mut cursor = Cursor::new(payload);

    let bits = cursor.u32()? as usize;
    if bits != EMBEDDING_BITS {
        return Err(IndexError::Format(format!(
            "embedding width {bits} unsupported (expected {EMBEDDING_BITS})"
        )));
    }
    let dim = cursor.u32()? as usize;
    if dim == 0 {
        return Err(IndexError::Format("descriptor dimension is zero".to_string()));
    }
    let num_words = cursor.u64()? as usize;

    // Vocabulary tree.
    let calibrated_checks = cursor.u64()? as usize;
    let num_nodes = cursor.u64()? as usize;
    if num_nodes == 0 {
        return Err(IndexError::Format("vocabulary tree has no nodes".to_string()));
    }
    // Capacities are capped by the remaining byte count so a crafted
    // header cannot force a huge allocation before the bounds checks hit.
    let mut nodes = Vec::with_capacity(num_nodes.min(cursor.remaining() / (dim + 8)));
    for _ in 0..num_nodes {
        let centroid = cursor.bytes(dim)?.to_vec();
        let word_id = cursor.u32()?;
        let num_children = cursor.u32()? as usize;
        let mut children = Vec::with_capacity(num_children);
        for _ in 0..num_children {
            let child = cursor.u32()?;
            if child as usize >= num_nodes {
                return Err(IndexError::Format(format!(
                    "child index {child} out of bounds ({num_nodes} nodes)"
                )));
            }
            children.push(child);
        }
        if children.is_empty() && word_id as usize >= num_words {
            return Err(IndexError::Format(format!(
                "leaf word id {word_id} out of bounds ({num_words} words)"
            )));
        }
        nodes.push(Node {
            centroid,
            children,
            word_id,
        });
    }
    validate_tree(&nodes, num_words)?;
    let vocabulary = VocabularyTree::from_parts(nodes, dim, num_words, calibrated_checks);

    // Embedding model.
    let projection_floats = EMBEDDING_BITS * dim;
    let threshold_floats = num_words * EMBEDDING_BITS;
    if (projection_floats + threshold_floats) * 4 > cursor.remaining() {
        return Err(IndexError::Format("truncated payload".to_string()));
    }
    let mut projection = Vec::with_capacity(projection_floats);
    for _ in 0..projection_floats {
        projection.push(cursor.f32()?);
    }
    let mut thresholds = Vec::with_capacity(threshold_floats);
    for _ in 0..threshold_floats {
        thresholds.push(cursor.f32()?);
    }
    let embedding = HammingEmbedding::from_parts(projection, thresholds, dim, num_words);

    // Inverted lists.
    let mut lists = Vec::with_capacity(num_words);
    let mut weights = Vec::with_capacity(num_words);
    for _ in 0..num_words {
        weights.push(cursor.f32()?);
        let num_entries = cursor.u64()? as usize;
        let mut list = Vec::with_capacity(num_entries.min(cursor.remaining() / 13));
        for _ in 0..num_entries {
            let image_id = cursor.u32()?;
            let code = cursor.u64()?;
            let geometry = match cursor.u8()? {
                0 => None,
                1 => Some(Geometry {
                    x: cursor.f32()?,
                    y: cursor.f32()?,
                    scale: cursor.f32()?,
                    orientation: cursor.f32()?,
                }),
                flag => {
                    return Err(IndexError::Format(format!(
                        "invalid geometry flag {flag}"
                    )))
                }
            };
            list.push(EmbeddedEntry {
                image_id,
                code,
                geometry,
            });
        }
        lists.push(list);
    }
    let inverted = InvertedIndex::from_parts(lists, weights);

    // Metadata.
    let num_images = cursor.u64()? as usize;
    let mut image_ids = HashSet::with_capacity(num_images.min(cursor.remaining() / 4));
    for _ in 0..num_images {
        image_ids.insert(cursor.u32()?);
    }
    let prepared = cursor.u8()? != 0;
    cursor.finish()?;

    let mut index = VisualIndex::new();
    index.vocabulary = Some(vocabulary);
    index.embedding = Some(embedding);
    index.inverted = inverted;
    index.image_ids = image_ids;
    index.prepared = prepared;
    Ok(index)
}

/// Require that the child arrays form a tree rooted at node 0: every
/// node reached exactly once, with exactly `num_words` leaves. Search
/// would cycle or skip words on anything else, so such a payload is
/// rejected up front even when its checksum is valid.
fn validate_tree(nodes: &[Node], num_words: usize) -> Result<()> {
    let mut visited = vec![false; nodes.len()];
    let mut num_leaves = 0usize;
    let mut stack = vec![0usize];
    visited[0] = true;
    while let Some(id) = stack.pop() {
        let node = &nodes[id];
        if node.children.is_empty() {
            num_leaves += 1;
        }
        for &child in &node.children {
            if std::mem::replace(&mut visited[child as usize], true) {
                return Err(IndexError::Format(format!(
                    "node {child} referenced by more than one parent"
                )));
            }
            stack.push(child as usize);
        }
    }
    if let Some(orphan) = visited.iter().position(|&v| !v) {
        return Err(IndexError::Format(format!(
            "node {orphan} unreachable from the root"
        )));
    }
    if num_leaves != num_words {
        return Err(IndexError::Format(format!(
            "tree has {num_leaves} leaves but declares {num_words} words"
        )));
    }
    Ok(())
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Bounds-checked little-endian reader over the payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(IndexError::Format("truncated payload".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    /// Require that the whole payload has been consumed.
    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(IndexError::Format(format!(
                "{} trailing bytes after payload",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}
