use std::alloc::Layout;
use std::sync::RwLock;

use tracing::error;

/// A function that reacts to an unsatisfiable allocation request. It must not return.
pub type OutOfMemoryHandler = fn(Layout) -> !;

const ERR_POISONED_LOCK: &str = "poisoned lock - safe execution no longer possible";

static HANDLER: RwLock<Option<OutOfMemoryHandler>> = RwLock::new(None);

/// Replaces the handler invoked when an [`Allocator`][crate::Allocator] cannot satisfy a request
/// made through one of its infallible methods, returning the previously installed handler.
///
/// Passing `None` restores the default handler, which aborts the process via
/// [`std::alloc::handle_alloc_error()`].
///
/// Prefer [`OutOfMemoryHandlerGuard`] when the replacement is only meant to be temporary.
pub fn set_out_of_memory_handler(
    handler: Option<OutOfMemoryHandler>,
) -> Option<OutOfMemoryHandler> {
    let mut current = HANDLER.write().expect(ERR_POISONED_LOCK);
    std::mem::replace(&mut *current, handler)
}

/// Installs an out-of-memory handler for as long as the guard lives and restores the previous
/// handler when dropped.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use stable_memory::OutOfMemoryHandlerGuard;
///
/// fn panic_instead(layout: Layout) -> ! {
///     panic!("out of memory allocating {} bytes", layout.size());
/// }
///
/// let _guard = OutOfMemoryHandlerGuard::new(panic_instead);
/// // Allocation failures now panic instead of aborting the process.
/// ```
#[derive(Debug)]
pub struct OutOfMemoryHandlerGuard {
    previous: Option<OutOfMemoryHandler>,
}

impl OutOfMemoryHandlerGuard {
    /// Installs `handler` until the returned guard is dropped.
    #[must_use]
    pub fn new(handler: OutOfMemoryHandler) -> Self {
        Self {
            previous: set_out_of_memory_handler(Some(handler)),
        }
    }
}

impl Drop for OutOfMemoryHandlerGuard {
    fn drop(&mut self) {
        // Must not panic here (we might already be unwinding out of the handler), so a poisoned
        // lock is simply recovered.
        let mut current = HANDLER
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *current = self.previous;
    }
}

/// Reports an allocation failure for `layout` and invokes the installed handler.
pub(crate) fn handle_out_of_memory(layout: Layout) -> ! {
    error!(
        size = layout.size(),
        align = layout.align(),
        "allocator could not satisfy request"
    );

    let handler = *HANDLER.read().expect(ERR_POISONED_LOCK);

    match handler {
        Some(handler) => handler(layout),
        None => std::alloc::handle_alloc_error(layout),
    }
}

#[cfg(test)]
mod tests {
    use std::panic;
    use std::ptr::NonNull;

    use super::*;
    use crate::Allocator;

    struct ExhaustedAllocator;

    impl Allocator for ExhaustedAllocator {
        unsafe fn reallocate(
            &self,
            _ptr: Option<NonNull<u8>>,
            _old_size: usize,
            _new_size: usize,
            _align: usize,
        ) -> Option<NonNull<u8>> {
            None
        }
    }

    fn panicking_handler(layout: Layout) -> ! {
        panic!("out of memory: {} bytes", layout.size());
    }

    #[test]
    fn installed_handler_runs_and_guard_restores_previous() {
        {
            let _guard = OutOfMemoryHandlerGuard::new(panicking_handler);

            let result = panic::catch_unwind(|| {
                _ = ExhaustedAllocator.allocate(Layout::new::<u64>());
            });

            let message = result.unwrap_err();
            let message = message.downcast_ref::<String>().unwrap();
            assert_eq!(message, "out of memory: 8 bytes");
        }

        assert!(HANDLER.read().unwrap().is_none());
    }

    #[test]
    fn try_allocate_does_not_invoke_handler() {
        assert!(
            ExhaustedAllocator
                .try_allocate(Layout::new::<u64>())
                .is_none()
        );
    }
}
