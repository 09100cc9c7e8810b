use crate::{Allocator, DebugAllocError, DebugAllocPanicHandler, DebugAllocator};

/// Number of released allocations remembered unless configured otherwise.
pub(crate) const DEFAULT_DEAD_HISTORY: usize = 32;

/// Builder for creating an instance of [`DebugAllocator`].
///
/// The parent allocator is mandatory and is passed to
/// [`DebugAllocator::builder()`], whereas all other settings are optional.
///
/// # Examples
///
/// ```
/// use stable_memory::{DebugAllocError, DebugAllocator, SystemAllocator};
///
/// fn log_only(violation: &DebugAllocError) {
///     eprintln!("ignoring allocator misuse: {violation}");
/// }
///
/// let allocator = DebugAllocator::builder(SystemAllocator::system())
///     .dead_history(128)
///     .poison_freed(true)
///     .panic_handler(log_only)
///     .build();
///
/// assert_eq!(allocator.live_count(), 0);
/// ```
#[derive(Debug)]
#[must_use]
pub struct DebugAllocatorBuilder<A: Allocator + Clone> {
    parent: A,
    dead_history: usize,
    poison_freed: bool,
    panic_handler: DebugAllocPanicHandler,
}

impl<A: Allocator + Clone> DebugAllocatorBuilder<A> {
    pub(crate) fn new(parent: A) -> Self {
        Self {
            parent,
            dead_history: DEFAULT_DEAD_HISTORY,
            poison_freed: false,
            panic_handler: panic_on_violation,
        }
    }

    /// Sets how many of the most recent releases are remembered for
    /// [`dead_allocations()`][DebugAllocator::dead_allocations]. Zero disables the history.
    #[inline]
    pub fn dead_history(mut self, count: usize) -> Self {
        self.dead_history = count;
        self
    }

    /// Sets whether released memory is overwritten with `0xDD` bytes before it is handed back to
    /// the parent allocator, to make use-after-free bugs easier to spot.
    #[inline]
    pub fn poison_freed(mut self, enabled: bool) -> Self {
        self.poison_freed = enabled;
        self
    }

    /// Sets the function invoked on contract violations. The default panics.
    ///
    /// If the handler returns, the offending call is ignored.
    #[inline]
    pub fn panic_handler(mut self, handler: DebugAllocPanicHandler) -> Self {
        self.panic_handler = handler;
        self
    }

    /// Builds the debug allocator with the specified configuration.
    #[must_use]
    #[inline]
    pub fn build(self) -> DebugAllocator<A> {
        DebugAllocator::new_inner(
            self.parent,
            self.dead_history,
            self.poison_freed,
            self.panic_handler,
        )
    }
}

fn panic_on_violation(violation: &DebugAllocError) {
    panic!("{violation}");
}
