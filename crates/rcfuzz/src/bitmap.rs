use bitvec::boxed::BitBox;
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

use crate::error::{Error, Result};

/// Number of instrumentation edges in the coverage map. Must match the size
/// of the maps the evaluator produces; a mismatch is fatal.
pub const EDGE_MAP_SIZE: usize = 1 << 16;

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-size edge bitmap.
///
/// Every operator is pure and returns a fresh value; snapshots holding
/// bitmaps stay immutable once taken. All bitmaps are `EDGE_MAP_SIZE` bits,
/// enforced at the only construction site that takes external data
/// ([`Bitmap::from_raw`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: BitBox<u64, Lsb0>,
}

impl Bitmap {
    pub fn empty() -> Self {
        Self {
            bits: BitVec::repeat(false, EDGE_MAP_SIZE).into_boxed_bitslice(),
        }
    }

    pub fn full() -> Self {
        Self {
            bits: BitVec::repeat(true, EDGE_MAP_SIZE).into_boxed_bitslice(),
        }
    }

    /// Build a bitmap from an AFL-style raw edge map: one byte per edge,
    /// non-zero meaning the edge was hit.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        if raw.len() != EDGE_MAP_SIZE {
            return Err(Error::InvalidBitmap {
                expected: EDGE_MAP_SIZE,
                actual: raw.len(),
            });
        }
        let mut bits = BitVec::<u64, Lsb0>::repeat(false, EDGE_MAP_SIZE);
        for (edge, hits) in raw.iter().enumerate() {
            if *hits != 0 {
                bits.set(edge, true);
            }
        }
        Ok(Self {
            bits: bits.into_boxed_bitslice(),
        })
    }

    /// Mark a single edge as covered.
    pub fn set(&mut self, edge: usize) {
        self.bits.set(edge, true);
    }

    pub fn union(&self, other: &Self) -> Self {
        self.zip_words(other, |a, b| a | b)
    }

    pub fn intersect(&self, other: &Self) -> Self {
        self.zip_words(other, |a, b| a & b)
    }

    /// Edges in `self` that are not in `other`.
    pub fn diff(&self, other: &Self) -> Self {
        self.zip_words(other, |a, b| a & !b)
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn is_superset(&self, other: &Self) -> bool {
        self.words()
            .iter()
            .zip(other.words())
            .all(|(a, b)| a & b == *b)
    }

    fn words(&self) -> &[u64] {
        self.bits.as_raw_slice()
    }

    // EDGE_MAP_SIZE is a multiple of 64, so word-wise combination never
    // touches padding bits.
    fn zip_words(&self, other: &Self, combine: impl Fn(u64, u64) -> u64) -> Self {
        let words: Vec<u64> = self
            .words()
            .iter()
            .zip(other.words())
            .map(|(a, b)| combine(*a, *b))
            .collect();
        Self {
            bits: BitVec::from_vec(words).into_boxed_bitslice(),
        }
    }
}

const _: () = assert!(EDGE_MAP_SIZE % WORD_BITS == 0);

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_with(edges: &[usize]) -> Bitmap {
        let mut bitmap = Bitmap::empty();
        for edge in edges {
            bitmap.set(*edge);
        }
        bitmap
    }

    #[test]
    fn from_raw_rejects_wrong_size() {
        let err = Bitmap::from_raw(&[0u8; 1024]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidBitmap {
                expected: EDGE_MAP_SIZE,
                actual: 1024
            }
        ));
    }

    #[test]
    fn from_raw_sets_nonzero_bytes() {
        let mut raw = vec![0u8; EDGE_MAP_SIZE];
        raw[0] = 1;
        raw[77] = 200;
        raw[EDGE_MAP_SIZE - 1] = 3;
        let bitmap = Bitmap::from_raw(&raw).unwrap();
        assert_eq!(bitmap.count(), 3);
        assert_eq!(bitmap, bitmap_with(&[0, 77, EDGE_MAP_SIZE - 1]));
    }

    #[test]
    fn union_popcount_dominates_operands() {
        let a = bitmap_with(&[1, 2, 3, 100]);
        let b = bitmap_with(&[3, 4, 5]);
        let union = a.union(&b);
        assert!(union.count() >= a.count().max(b.count()));
        assert_eq!(union.count(), 6);
    }

    #[test]
    fn diff_and_intersect_partition() {
        let a = bitmap_with(&[1, 2, 3, 50, 60]);
        let b = bitmap_with(&[2, 3, 70]);
        let recombined = a.diff(&b).union(&a.intersect(&b));
        assert_eq!(recombined, a);
    }

    #[test]
    fn identity_elements() {
        let a = bitmap_with(&[9, 10, 4096]);
        assert_eq!(a.union(&Bitmap::empty()), a);
        assert_eq!(a.intersect(&Bitmap::full()), a);
    }

    #[test]
    fn superset_relation() {
        let a = bitmap_with(&[1, 2, 3]);
        let b = bitmap_with(&[2, 3]);
        assert!(a.is_superset(&b));
        assert!(!b.is_superset(&a));
        assert!(Bitmap::full().is_superset(&a));
        assert!(a.is_superset(&Bitmap::empty()));
    }

    #[test]
    fn empty_and_full_counts() {
        assert_eq!(Bitmap::empty().count(), 0);
        assert!(Bitmap::empty().is_empty());
        assert_eq!(Bitmap::full().count(), EDGE_MAP_SIZE);
    }
}
