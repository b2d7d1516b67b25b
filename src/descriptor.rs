//! Descriptor storage and per-feature metadata.
//!
//! Descriptors are fixed-width unsigned byte vectors (e.g. 128-dim SIFT).
//! They are stored row-major in a single flat buffer so the hot loops
//! iterate over contiguous memory.

use crate::{IndexError, Result};

/// A set of local feature descriptors with a fixed dimension.
///
/// Row-major SoA storage: descriptor `i` occupies
/// `data[i * dim .. (i + 1) * dim]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptors {
    data: Vec<u8>,
    dim: usize,
    len: usize,
}

impl Descriptors {
    /// Create an empty descriptor set with the given dimension.
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(IndexError::Configuration(
                "descriptor dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            data: Vec::new(),
            dim,
            len: 0,
        })
    }

    /// Create a descriptor set from a flat row-major buffer.
    pub fn from_flat(data: Vec<u8>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(IndexError::Configuration(
                "descriptor dimension must be greater than 0".to_string(),
            ));
        }
        if data.len() % dim != 0 {
            return Err(IndexError::Configuration(format!(
                "flat buffer length {} is not a multiple of dimension {}",
                data.len(),
                dim
            )));
        }
        let len = data.len() / dim;
        Ok(Self { data, dim, len })
    }

    /// Append one descriptor row.
    pub fn push(&mut self, row: &[u8]) -> Result<()> {
        if row.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        self.len += 1;
        Ok(())
    }

    /// Descriptor `i` as a slice.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    #[inline]
    pub fn row(&self, i: usize) -> &[u8] {
        let start = i * self.dim;
        &self.data[start..start + self.dim]
    }

    /// Iterate over descriptor rows in order.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[u8]> {
        self.data.chunks_exact(self.dim)
    }

    /// Number of descriptors.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set holds no descriptors.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Descriptor dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The flat row-major buffer.
    #[inline]
    pub fn as_flat(&self) -> &[u8] {
        &self.data
    }
}

/// Keypoint geometry attached to a descriptor.
///
/// Stored and forwarded to the spatial verifier; the index itself never
/// interprets these fields.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Geometry {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub orientation: f32,
}

/// A ranked retrieval result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageScore {
    pub image_id: u32,
    pub score: f32,
}

/// Exact squared Euclidean distance between two byte descriptors.
///
/// Integer arithmetic, so ordering is fully deterministic.
#[inline]
pub(crate) fn l2_squared(a: &[u8], b: &[u8]) -> u64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0u64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let d = x as i64 - y as i64;
        sum += (d * d) as u64;
    }
    sum
}
