use std::alloc::Layout;
use std::marker::PhantomData;

use crate::{Allocator, DropPolicy, SlotMask, StableArray, SystemAllocator};

/// Blocks added in addition to the multiplied count when a [`StableArray`] grows.
pub(crate) const DEFAULT_GROWTH_LINEAR: usize = 1;

/// Factor applied to the existing block count when a [`StableArray`] grows.
pub(crate) const DEFAULT_GROWTH_MULTIPLIER: usize = 2;

/// Builder for creating an instance of [`StableArray`].
///
/// [`StableArray`] requires the item memory layout to be specified at construction time.
/// Use either `.layout()` to provide a specific layout or `.layout_of::<T>()` to generate
/// a layout based on the provided type.
///
/// The layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use stable_memory::StableArray;
///
/// let array = StableArray::builder()
///     .layout(Layout::new::<u32>())
///     .growth(4, 2)
///     .build();
/// ```
#[derive(Debug)]
#[must_use]
pub struct StableArrayBuilder<A: Allocator = SystemAllocator, M: SlotMask = u64> {
    item_layout: Option<Layout>,
    allocator: A,
    growth_linear: usize,
    growth_multiplier: usize,
    drop_policy: DropPolicy,

    _mask: PhantomData<M>,
}

impl StableArrayBuilder {
    pub(crate) fn new() -> Self {
        Self {
            item_layout: None,
            allocator: SystemAllocator::system(),
            growth_linear: DEFAULT_GROWTH_LINEAR,
            growth_multiplier: DEFAULT_GROWTH_MULTIPLIER,
            drop_policy: DropPolicy::default(),
            _mask: PhantomData,
        }
    }
}

impl<A: Allocator, M: SlotMask> StableArrayBuilder<A, M> {
    /// Sets the memory layout for items stored in the array.
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(
            layout.size() > 0,
            "StableArray must have non-zero item size"
        );
        self.item_layout = Some(layout);
        self
    }

    /// Sets the memory layout for items stored in the array based on a type.
    #[inline]
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the allocator that provides the memory for the array blocks.
    ///
    /// # Examples
    ///
    /// ```
    /// use stable_memory::{DebugAllocator, StableArray, SystemAllocator};
    ///
    /// let allocator = DebugAllocator::new(SystemAllocator::system());
    ///
    /// let mut array = StableArray::builder()
    ///     .layout_of::<u64>()
    ///     .allocator(&allocator)
    ///     .build();
    ///
    /// _ = array.insert();
    /// assert!(allocator.live_count() > 0);
    /// ```
    #[inline]
    pub fn allocator<B: Allocator>(self, allocator: B) -> StableArrayBuilder<B, M> {
        StableArrayBuilder {
            item_layout: self.item_layout,
            allocator,
            growth_linear: self.growth_linear,
            growth_multiplier: self.growth_multiplier,
            drop_policy: self.drop_policy,
            _mask: PhantomData,
        }
    }

    /// Selects the liveness mask type, which decides the number of slots per block.
    ///
    /// `u64` (the default) gives 64 slots per block, `u32` gives 32.
    #[inline]
    pub fn slot_mask<N: SlotMask>(self) -> StableArrayBuilder<A, N> {
        StableArrayBuilder {
            item_layout: self.item_layout,
            allocator: self.allocator,
            growth_linear: self.growth_linear,
            growth_multiplier: self.growth_multiplier,
            drop_policy: self.drop_policy,
            _mask: PhantomData,
        }
    }

    /// Sets how many blocks the array grows to when it runs out of slots:
    /// `blocks * multiplier + linear`, or just enough for the request if that is more.
    #[inline]
    pub fn growth(mut self, linear: usize, multiplier: usize) -> Self {
        self.growth_linear = linear;
        self.growth_multiplier = multiplier;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the array. This governs how
    /// to treat remaining items in the array when the array is dropped.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the stable array with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using either [`layout`](Self::layout) or
    /// [`layout_of`](Self::layout_of).
    #[must_use]
    #[inline]
    pub fn build(self) -> StableArray<A, M> {
        let layout = self.item_layout.expect(
            "Layout must be set using .layout() or .layout_of::<T>() before calling .build()",
        );

        StableArray::new_inner(
            layout,
            self.allocator,
            self.growth_linear,
            self.growth_multiplier,
            self.drop_policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(StableArrayBuilder: Send, std::fmt::Debug);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = StableArrayBuilder::new();
        assert!(builder.item_layout.is_none());
        assert_eq!(builder.drop_policy, DropPolicy::default());
        assert_eq!(builder.growth_linear, DEFAULT_GROWTH_LINEAR);
        assert_eq!(builder.growth_multiplier, DEFAULT_GROWTH_MULTIPLIER);
    }

    #[test]
    fn layout_of_sets_layout_correctly() {
        let builder = StableArrayBuilder::new().layout_of::<[u16; 3]>();
        assert_eq!(builder.item_layout, Some(Layout::new::<[u16; 3]>()));
    }

    #[test]
    fn layout_can_be_overridden() {
        let builder = StableArrayBuilder::new()
            .layout_of::<u32>()
            .layout(Layout::new::<u64>());
        assert_eq!(builder.item_layout, Some(Layout::new::<u64>()));
    }

    #[test]
    #[should_panic]
    fn layout_with_zero_size_panics() {
        let _array = StableArrayBuilder::new().layout(Layout::new::<()>()).build();
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _array = StableArrayBuilder::new().build();
    }

    #[test]
    fn settings_survive_type_changes() {
        let builder = StableArrayBuilder::new()
            .layout_of::<u8>()
            .growth(3, 4)
            .drop_policy(DropPolicy::MustNotDropItems)
            .slot_mask::<u32>()
            .allocator(SystemAllocator::system());

        assert_eq!(builder.item_layout, Some(Layout::new::<u8>()));
        assert_eq!(builder.growth_linear, 3);
        assert_eq!(builder.growth_multiplier, 4);
        assert_eq!(builder.drop_policy, DropPolicy::MustNotDropItems);

        let array = builder.build();
        assert_eq!(array.capacity(), 0);
    }

    #[test]
    fn growth_settings_apply() {
        let mut array = StableArrayBuilder::new()
            .layout_of::<u64>()
            .growth(4, 1)
            .build();

        _ = array.insert();
        assert_eq!(array.capacity(), 4 * 64);
    }
}
