use std::fmt::Debug;

use num_traits::{PrimInt, Unsigned};

mod sealed {
    #[expect(
        unnameable_types,
        reason = "seals the public trait so only u32 and u64 can implement it"
    )]
    pub trait Sealed {}

    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// The word type used to track slot liveness in one block of a
/// [`StableArray`][crate::StableArray]. Its bit width is the number of slots per block.
///
/// * `u64` - 64 slots per block (the default).
/// * `u32` - 32 slots per block, for lighter-weight arrays.
pub trait SlotMask: PrimInt + Unsigned + Debug + sealed::Sealed + 'static {
    /// Number of slots per block.
    const SLOTS: usize;
}

impl SlotMask for u32 {
    const SLOTS: usize = u32::BITS as usize;
}

impl SlotMask for u64 {
    const SLOTS: usize = u64::BITS as usize;
}

/// Position of the lowest set bit in `word`, if any bit is set.
#[must_use]
pub(crate) fn first_set_bit<M: PrimInt>(word: M) -> Option<usize> {
    if word.is_zero() {
        None
    } else {
        // trailing_zeros() of a non-zero word is below the bit width, so this always fits.
        Some(word.trailing_zeros() as usize)
    }
}

/// Position of the lowest clear bit in `word`, if any bit is clear.
#[must_use]
pub(crate) fn first_clear_bit<M: PrimInt>(word: M) -> Option<usize> {
    first_set_bit(!word)
}

#[must_use]
pub(crate) fn bit<M: SlotMask>(position: usize) -> M {
    debug_assert!(position < M::SLOTS);

    M::one() << position
}

#[must_use]
pub(crate) fn is_set<M: SlotMask>(word: M, position: usize) -> bool {
    !(word & bit::<M>(position)).is_zero()
}

/// Iterates over the positions of the set bits in `word`, lowest first.
pub(crate) fn set_bits<M: PrimInt>(mut word: M) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        let position = first_set_bit(word)?;

        // Clears the lowest set bit.
        word = word & (word - M::one());

        Some(position)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_bit_finds_lowest() {
        assert_eq!(first_set_bit(0_u64), None);
        assert_eq!(first_set_bit(1_u64), Some(0));
        assert_eq!(first_set_bit(0b1011_0000_u64), Some(4));
        assert_eq!(first_set_bit(1_u64 << 63), Some(63));
        assert_eq!(first_set_bit(1_u32 << 31), Some(31));
    }

    #[test]
    fn first_clear_bit_finds_lowest_vacancy() {
        assert_eq!(first_clear_bit(0_u64), Some(0));
        assert_eq!(first_clear_bit(0b0111_u64), Some(3));
        assert_eq!(first_clear_bit(u64::MAX), None);
        assert_eq!(first_clear_bit(u32::MAX), None);
        assert_eq!(first_clear_bit(u32::MAX >> 1), Some(31));
    }

    #[test]
    fn set_bits_iterates_in_order() {
        let bits: Vec<_> = set_bits(0b1001_0110_u32).collect();
        assert_eq!(bits, vec![1, 2, 4, 7]);

        assert_eq!(set_bits(0_u64).count(), 0);
        assert_eq!(set_bits(u64::MAX).count(), 64);
    }

    #[test]
    fn is_set_matches_bit() {
        let word = bit::<u64>(5) | bit::<u64>(63);

        assert!(is_set(word, 5));
        assert!(is_set(word, 63));
        assert!(!is_set(word, 0));
        assert_eq!(u32::SLOTS, 32);
        assert_eq!(u64::SLOTS, 64);
    }
}
