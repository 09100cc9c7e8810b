use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::Allocator;

/// Carries the allocators that a subsystem should use, passed by reference instead of living in
/// process-wide mutable state.
///
/// A context has a *default* allocator for long-lived data and a *scratch* allocator for
/// temporary data. Either can be overridden for a lexical scope with [`push_default()`][1] or
/// [`push_scratch()`][2], which return a guard that restores the previous allocator when dropped.
///
/// # Examples
///
/// ```
/// use stable_memory::{AllocatorContext, DebugAllocator, HandleTable, SystemAllocator};
///
/// let system = SystemAllocator::system();
/// let debug = DebugAllocator::new(SystemAllocator::system());
///
/// let mut context = AllocatorContext::new(&system);
///
/// {
///     let scoped = context.push_scratch(&debug);
///
///     let mut table = HandleTable::builder()
///         .layout_of::<u32>()
///         .allocator(scoped.scratch())
///         .build();
///     _ = table.insert();
/// }
///
/// // The debug allocator is no longer the scratch allocator and everything it handed out
/// // has been returned.
/// assert_eq!(debug.live_count(), 0);
/// ```
///
/// [1]: Self::push_default
/// [2]: Self::push_scratch
#[derive(Clone, Copy)]
pub struct AllocatorContext<'a> {
    default: &'a dyn Allocator,
    scratch: &'a dyn Allocator,
}

impl<'a> AllocatorContext<'a> {
    /// Creates a context that uses `allocator` both as the default and as the scratch allocator.
    #[must_use]
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self {
            default: allocator,
            scratch: allocator,
        }
    }

    /// Creates a context with distinct default and scratch allocators.
    #[must_use]
    pub fn with_scratch(default: &'a dyn Allocator, scratch: &'a dyn Allocator) -> Self {
        Self { default, scratch }
    }

    /// The allocator for data that outlives the current operation.
    #[must_use]
    #[inline]
    pub fn default_allocator(&self) -> &'a dyn Allocator {
        self.default
    }

    /// The allocator for data that is discarded before the current operation completes.
    #[must_use]
    #[inline]
    pub fn scratch(&self) -> &'a dyn Allocator {
        self.scratch
    }

    /// Replaces the default allocator until the returned guard is dropped.
    pub fn push_default<'s>(&'s mut self, allocator: &'a dyn Allocator) -> ScopedAllocator<'s, 'a> {
        let previous = std::mem::replace(&mut self.default, allocator);

        ScopedAllocator {
            context: self,
            slot: Slot::Default,
            previous,
        }
    }

    /// Replaces the scratch allocator until the returned guard is dropped.
    pub fn push_scratch<'s>(&'s mut self, allocator: &'a dyn Allocator) -> ScopedAllocator<'s, 'a> {
        let previous = std::mem::replace(&mut self.scratch, allocator);

        ScopedAllocator {
            context: self,
            slot: Slot::Scratch,
            previous,
        }
    }
}

impl fmt::Debug for AllocatorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("default", &std::ptr::from_ref(self.default).cast::<()>())
            .field("scratch", &std::ptr::from_ref(self.scratch).cast::<()>())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Default,
    Scratch,
}

/// Restores an [`AllocatorContext`] allocator when dropped.
///
/// Dereferences to the context so that further (nested) overrides can be pushed through it.
pub struct ScopedAllocator<'s, 'a> {
    context: &'s mut AllocatorContext<'a>,
    slot: Slot,
    previous: &'a dyn Allocator,
}

impl<'a> Deref for ScopedAllocator<'_, 'a> {
    type Target = AllocatorContext<'a>;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl DerefMut for ScopedAllocator<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl Drop for ScopedAllocator<'_, '_> {
    fn drop(&mut self) {
        match self.slot {
            Slot::Default => self.context.default = self.previous,
            Slot::Scratch => self.context.scratch = self.previous,
        }
    }
}

impl fmt::Debug for ScopedAllocator<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedAllocator")
            .field("context", &self.context)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;

    use super::*;
    use crate::{DebugAllocator, SystemAllocator};

    fn same(a: &dyn Allocator, b: &dyn Allocator) -> bool {
        std::ptr::addr_eq(std::ptr::from_ref(a), std::ptr::from_ref(b))
    }

    #[test]
    fn new_uses_one_allocator_for_both_roles() {
        let system = SystemAllocator::system();
        let context = AllocatorContext::new(&system);

        assert!(same(context.default_allocator(), &system));
        assert!(same(context.scratch(), &system));
    }

    #[test]
    fn nested_scratch_overrides_unwind_in_order() {
        let system = SystemAllocator::system();
        let first = DebugAllocator::new(SystemAllocator::system());
        let second = DebugAllocator::new(SystemAllocator::system());

        let mut context = AllocatorContext::new(&system);

        {
            let mut outer = context.push_scratch(&first);
            assert!(same(outer.scratch(), &first));

            {
                let inner = outer.push_scratch(&second);
                assert!(same(inner.scratch(), &second));
                assert!(same(inner.default_allocator(), &system));
            }

            assert!(same(outer.scratch(), &first));
        }

        assert!(same(context.scratch(), &system));
    }

    #[test]
    fn default_override_is_restored() {
        let system = SystemAllocator::system();
        let debug = DebugAllocator::new(SystemAllocator::system());

        let mut context = AllocatorContext::new(&system);

        {
            let scoped = context.push_default(&debug);
            let layout = Layout::new::<u64>();

            let ptr = scoped.default_allocator().allocate(layout);
            assert_eq!(debug.live_count(), 1);

            unsafe {
                scoped.default_allocator().deallocate(ptr, layout);
            }
        }

        assert!(same(context.default_allocator(), &system));
        assert_eq!(debug.live_count(), 0);
    }
}
