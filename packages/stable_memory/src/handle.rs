use std::fmt;

/// A generation-checked reference to an item in a [`HandleTable`][crate::HandleTable].
///
/// A handle pairs a 1-based slot index with the generation the slot had when the item was
/// inserted. Once the item is released, the slot generation moves on and the handle no longer
/// resolves, even if the slot is later reused for another item.
///
/// The all-zero handle is [`Handle::NULL`], which never resolves. It is also the default value.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// A handle that refers to nothing.
    pub const NULL: Self = Self {
        index: 0,
        generation: 0,
    };

    /// Assembles a handle from an index and a generation.
    ///
    /// There is no guarantee that the result refers to a live item; lookups validate it.
    #[must_use]
    #[inline]
    pub const fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The 1-based slot index, or 0 for [`Handle::NULL`].
    #[must_use]
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// The generation of the slot when the handle was issued.
    #[must_use]
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether this is [`Handle::NULL`].
    #[must_use]
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.index == 0
    }

    /// Packs the handle into a single integer, with the generation in the high half.
    ///
    /// # Examples
    ///
    /// ```
    /// use stable_memory::Handle;
    ///
    /// let handle = Handle::from_raw_parts(3, 7);
    ///
    /// assert_eq!(Handle::from_bits(handle.to_bits()), handle);
    /// assert_eq!(Handle::NULL.to_bits(), 0);
    /// ```
    #[must_use]
    #[inline]
    pub const fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpacks a handle previously packed with [`to_bits()`](Self::to_bits).
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "truncation is how the two halves are separated"
    )]
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Handle(NULL)")
        } else {
            write!(f, "Handle({}v{})", self.index, self.generation)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Handle: Send, Sync, Copy, std::hash::Hash, Ord);

    #[test]
    fn null_is_default() {
        assert_eq!(Handle::default(), Handle::NULL);
        assert!(Handle::NULL.is_null());
        assert!(!Handle::from_raw_parts(1, 1).is_null());
    }

    #[test]
    fn bits_keep_both_halves() {
        let handle = Handle::from_raw_parts(u32::MAX, 1);
        let bits = handle.to_bits();

        assert_eq!(bits, (1_u64 << 32) | u64::from(u32::MAX));
        assert_eq!(Handle::from_bits(bits).index(), u32::MAX);
        assert_eq!(Handle::from_bits(bits).generation(), 1);
    }

    #[test]
    fn generations_distinguish_handles() {
        let a = Handle::from_raw_parts(5, 1);
        let b = Handle::from_raw_parts(5, 2);

        assert_ne!(a, b);

        let set: HashSet<_> = [a, b, a].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn debug_output_is_compact() {
        assert_eq!(format!("{:?}", Handle::NULL), "Handle(NULL)");
        assert_eq!(format!("{:?}", Handle::from_raw_parts(4, 9)), "Handle(4v9)");
    }
}
