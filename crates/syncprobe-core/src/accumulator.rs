//! Commutative, invertible set digests.
//!
//! An [`Accumulator`] folds elements in and out of a running value such that
//! the result depends only on the multiset of elements folded in, never on
//! the order. [`LtHash`] is the shipped construction: a lattice hash over
//! 1024 lanes of `u16`, each element expanded from a Blake3 XOF.

use std::fmt;

/// Number of `u16` lanes in an [`LtHash`].
pub const LTHASH_LANES: usize = 1024;

const LTHASH_CONTEXT: &str = "syncprobe 2024-06-01 lthash element v1";

/// An order-independent accumulator with an inverse.
///
/// Implementations must satisfy, for any elements `x` and `y`:
/// - `fold_in(x); fold_in(y)` equals `fold_in(y); fold_in(x)`
/// - `fold_in(x); fold_out(x)` returns to the previous value
pub trait Accumulator: Clone + Send + Sync + 'static {
    /// The contribution of a single record.
    type Element: Send + 'static;

    /// The empty accumulator.
    fn identity() -> Self;

    /// Map an encoded record to its contribution.
    fn element(preimage: &[u8]) -> Self::Element;

    /// Add a contribution.
    fn fold_in(&mut self, element: &Self::Element);

    /// Remove a contribution previously added.
    fn fold_out(&mut self, element: &Self::Element);

    /// Merge another accumulator into this one.
    fn combine(&mut self, other: &Self);

    /// Deterministic serialization of the current value.
    fn to_bytes(&self) -> Vec<u8>;

    fn is_identity(&self) -> bool;
}

/// Lattice hash over `LTHASH_LANES` wrapping `u16` lanes.
#[derive(Clone, PartialEq, Eq)]
pub struct LtHash(Box<[u16; LTHASH_LANES]>);

impl LtHash {
    /// Lane values, little-endian when serialized.
    pub fn lanes(&self) -> &[u16; LTHASH_LANES] {
        &self.0
    }

    /// Rebuild from a serialized value.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != LTHASH_LANES * 2 {
            return None;
        }
        let mut lanes = Box::new([0u16; LTHASH_LANES]);
        for (lane, pair) in lanes.iter_mut().zip(bytes.chunks_exact(2)) {
            *lane = u16::from_le_bytes([pair[0], pair[1]]);
        }
        Some(Self(lanes))
    }

    /// 32-byte Blake3 compression of the lane state.
    pub fn compress(&self) -> [u8; 32] {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }
}

impl Default for LtHash {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for LtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LtHash({})", &hex::encode(self.compress())[..16])
    }
}

impl Accumulator for LtHash {
    type Element = LtHash;

    fn identity() -> Self {
        Self(Box::new([0u16; LTHASH_LANES]))
    }

    fn element(preimage: &[u8]) -> Self::Element {
        let mut hasher = blake3::Hasher::new_derive_key(LTHASH_CONTEXT);
        hasher.update(preimage);
        let mut buf = [0u8; LTHASH_LANES * 2];
        hasher.finalize_xof().fill(&mut buf);
        // buf has exactly LTHASH_LANES * 2 bytes
        Self::from_bytes(&buf).unwrap_or_default()
    }

    fn fold_in(&mut self, element: &Self::Element) {
        for (lane, add) in self.0.iter_mut().zip(element.0.iter()) {
            *lane = lane.wrapping_add(*add);
        }
    }

    fn fold_out(&mut self, element: &Self::Element) {
        for (lane, sub) in self.0.iter_mut().zip(element.0.iter()) {
            *lane = lane.wrapping_sub(*sub);
        }
    }

    fn combine(&mut self, other: &Self) {
        self.fold_in(other);
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LTHASH_LANES * 2);
        for lane in self.0.iter() {
            out.extend_from_slice(&lane.to_le_bytes());
        }
        out
    }

    fn is_identity(&self) -> bool {
        self.0.iter().all(|lane| *lane == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identity() {
        let acc = LtHash::identity();
        assert!(acc.is_identity());
        assert_eq!(acc.to_bytes().len(), LTHASH_LANES * 2);
    }

    #[test]
    fn test_fold_out_inverts_fold_in() {
        let mut acc = LtHash::identity();
        let x = LtHash::element(b"alpha");
        let y = LtHash::element(b"beta");
        acc.fold_in(&x);
        let after_x = acc.clone();
        acc.fold_in(&y);
        acc.fold_out(&y);
        assert_eq!(acc, after_x);
        acc.fold_out(&x);
        assert!(acc.is_identity());
    }

    #[test]
    fn test_elements_differ() {
        assert_ne!(LtHash::element(b"a"), LtHash::element(b"b"));
        assert_eq!(LtHash::element(b"a"), LtHash::element(b"a"));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let acc = LtHash::element(b"gamma");
        let restored = LtHash::from_bytes(&acc.to_bytes()).unwrap();
        assert_eq!(acc, restored);
        assert!(LtHash::from_bytes(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_combine_matches_sequential() {
        let mut left = LtHash::identity();
        left.fold_in(&LtHash::element(b"1"));
        let mut right = LtHash::identity();
        right.fold_in(&LtHash::element(b"2"));

        let mut sequential = LtHash::identity();
        sequential.fold_in(&LtHash::element(b"2"));
        sequential.fold_in(&LtHash::element(b"1"));

        left.combine(&right);
        assert_eq!(left, sequential);
    }

    proptest! {
        #[test]
        fn test_order_independent(
            items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..24)
        ) {
            let mut forward = LtHash::identity();
            for item in &items {
                forward.fold_in(&LtHash::element(item));
            }
            let mut backward = LtHash::identity();
            for item in items.iter().rev() {
                backward.fold_in(&LtHash::element(item));
            }
            prop_assert_eq!(forward.to_bytes(), backward.to_bytes());
        }
    }
}
