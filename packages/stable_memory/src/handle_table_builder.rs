use std::alloc::Layout;

use crate::{Allocator, DropPolicy, HandleTable, SystemAllocator};

/// Builder for creating an instance of [`HandleTable`].
///
/// [`HandleTable`] requires the item memory layout to be specified at construction time.
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
/// use stable_memory::{HandleTable, SystemAllocator};
///
/// let table = HandleTable::builder()
///     .layout(Layout::from_size_align(48, 16).unwrap())
///     .allocator(SystemAllocator::system())
///     .build();
///
/// assert_eq!(table.item_layout().align(), 16);
/// ```
#[derive(Debug)]
#[must_use]
pub struct HandleTableBuilder<A: Allocator = SystemAllocator> {
    item_layout: Option<Layout>,
    allocator: A,
    drop_policy: DropPolicy,
}

impl HandleTableBuilder {
    pub(crate) fn new() -> Self {
        Self {
            item_layout: None,
            allocator: SystemAllocator::system(),
            drop_policy: DropPolicy::default(),
        }
    }
}

impl<A: Allocator> HandleTableBuilder<A> {
    /// Sets the memory layout for items stored in the table.
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(
            layout.size() > 0,
            "HandleTable must have non-zero item size"
        );
        self.item_layout = Some(layout);
        self
    }

    /// Sets the memory layout for items stored in the table based on a type.
    #[inline]
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the allocator that provides the memory for the table.
    #[inline]
    pub fn allocator<B: Allocator>(self, allocator: B) -> HandleTableBuilder<B> {
        HandleTableBuilder {
            item_layout: self.item_layout,
            allocator,
            drop_policy: self.drop_policy,
        }
    }

    /// Sets the [drop policy][DropPolicy] for the table. This governs how
    /// to treat remaining items in the table when the table is dropped.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the handle table with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using either [`layout`](Self::layout) or
    /// [`layout_of`](Self::layout_of).
    #[must_use]
    #[inline]
    pub fn build(self) -> HandleTable<A> {
        let layout = self.item_layout.expect(
            "Layout must be set using .layout() or .layout_of::<T>() before calling .build()",
        );

        HandleTable::new_inner(layout, self.allocator, self.drop_policy)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HandleTableBuilder: Send, std::fmt::Debug);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = HandleTableBuilder::new();
        assert!(builder.item_layout.is_none());
        assert_eq!(builder.drop_policy, DropPolicy::default());
    }

    #[test]
    fn layout_of_sets_layout_correctly() {
        let builder = HandleTableBuilder::new().layout_of::<String>();
        assert_eq!(builder.item_layout, Some(Layout::new::<String>()));
    }

    #[test]
    fn drop_policy_can_be_overridden() {
        let builder = HandleTableBuilder::new()
            .drop_policy(DropPolicy::MustNotDropItems)
            .drop_policy(DropPolicy::MayDropItems);
        assert_eq!(builder.drop_policy, DropPolicy::MayDropItems);
    }

    #[test]
    fn allocator_keeps_other_settings() {
        let builder = HandleTableBuilder::new()
            .layout_of::<u16>()
            .drop_policy(DropPolicy::MustNotDropItems)
            .allocator(SystemAllocator::system());

        assert_eq!(builder.item_layout, Some(Layout::new::<u16>()));
        assert_eq!(builder.drop_policy, DropPolicy::MustNotDropItems);
    }

    #[test]
    #[should_panic]
    fn layout_of_zero_sized_type_panics() {
        let _table = HandleTableBuilder::new().layout_of::<()>().build();
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _table = HandleTableBuilder::new().build();
    }
}
