use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::out_of_memory;

/// A source of raw memory.
///
/// An allocator exposes a single realloc-style entry point, [`reallocate()`][1], and every other
/// memory operation is expressed in terms of it:
///
/// * `ptr == None` means "allocate fresh memory of `new_size` bytes".
/// * `new_size == 0` means "release the memory at `ptr`".
/// * Anything else means "resize the memory at `ptr` from `old_size` to `new_size` bytes",
///   preserving the first `min(old_size, new_size)` bytes.
///
/// Memory obtained from an allocator must only ever be released through the same allocator, by
/// calling [`reallocate()`][1] (or one of the provided wrappers) with `new_size == 0`.
///
/// The provided methods [`allocate()`][2] and [`resize()`][3] treat allocation failure as fatal and
/// route it through the process-wide [out-of-memory handler][4]. Containers in this package use
/// those methods exclusively, so from their point of view allocation never fails.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use stable_memory::{Allocator, SystemAllocator};
///
/// let allocator = SystemAllocator::system();
/// let layout = Layout::new::<u64>();
///
/// let ptr = allocator.allocate(layout);
///
/// // SAFETY: The memory was allocated above with the same layout and is sized for a u64.
/// unsafe {
///     ptr.cast::<u64>().write(42);
///     allocator.deallocate(ptr, layout);
/// }
/// ```
///
/// [1]: Self::reallocate
/// [2]: Self::allocate
/// [3]: Self::resize
/// [4]: crate::set_out_of_memory_handler
pub trait Allocator {
    /// Allocates, resizes or releases memory, depending on the arguments.
    ///
    /// Returns `None` when releasing memory or when the request could not be satisfied. A failed
    /// resize leaves the original memory untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// * `align` is a power of two and `new_size` rounded up to `align` does not overflow `isize`.
    /// * If `ptr` is `Some`, it was returned by this allocator with exactly `old_size` bytes and
    ///   `align` alignment and has not been released since.
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>>;

    /// Allocates memory for `layout`, returning `None` on failure.
    ///
    /// # Panics
    ///
    /// Panics if `layout` is zero-sized.
    #[must_use]
    fn try_allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        assert!(
            layout.size() > 0,
            "zero-sized allocations are not supported by Allocator"
        );

        // SAFETY: A Layout always has a power-of-two alignment and a size that fits in isize
        // after rounding. There is no old pointer, so there are no ownership requirements.
        unsafe { self.reallocate(None, 0, layout.size(), layout.align()) }
    }

    /// Allocates memory for `layout`, invoking the out-of-memory handler on failure.
    ///
    /// # Panics
    ///
    /// Panics if `layout` is zero-sized.
    #[must_use]
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.try_allocate(layout)
            .unwrap_or_else(|| out_of_memory::handle_out_of_memory(layout))
    }

    /// Allocates memory for `layout` and fills it with zero bytes.
    ///
    /// # Panics
    ///
    /// Panics if `layout` is zero-sized.
    #[must_use]
    fn allocate_zeroed(&self, layout: Layout) -> NonNull<u8> {
        let ptr = self.allocate(layout);

        // SAFETY: We just allocated `layout.size()` bytes at `ptr`.
        unsafe {
            ptr.write_bytes(0, layout.size());
        }

        ptr
    }

    /// Releases memory previously obtained from this allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by this allocator for exactly `layout` and
    /// has not been released since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        let result = unsafe { self.reallocate(Some(ptr), layout.size(), 0, layout.align()) };

        debug_assert!(
            result.is_none(),
            "releasing memory must not hand out a new pointer"
        );
    }

    /// Resizes memory previously obtained from this allocator, invoking the out-of-memory handler
    /// on failure.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by this allocator for exactly `old_layout`
    /// and has not been released since. `new_size` must be non-zero and, rounded up to
    /// `old_layout.align()`, must not overflow `isize`.
    #[must_use]
    unsafe fn resize(&self, ptr: NonNull<u8>, old_layout: Layout, new_size: usize) -> NonNull<u8> {
        assert!(new_size > 0, "resize() cannot be used to release memory");

        // SAFETY: Forwarding safety requirements to the caller.
        let result = unsafe {
            self.reallocate(
                Some(ptr),
                old_layout.size(),
                new_size,
                old_layout.align(),
            )
        };

        result.unwrap_or_else(|| {
            let new_layout = Layout::from_size_align(new_size, old_layout.align())
                .expect("caller guarantees that the new size is valid for the alignment");

            out_of_memory::handle_out_of_memory(new_layout)
        })
    }
}

impl<A: Allocator + ?Sized> Allocator for &A {
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).reallocate(ptr, old_size, new_size, align) }
    }
}

impl<A: Allocator + ?Sized> Allocator for Rc<A> {
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).reallocate(ptr, old_size, new_size, align) }
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).reallocate(ptr, old_size, new_size, align) }
    }
}

/// Adapts any Rust [`GlobalAlloc`] to the [`Allocator`] interface.
///
/// # Examples
///
/// ```
/// use stable_memory::{HandleTable, SystemAllocator};
///
/// let table = HandleTable::builder()
///     .layout_of::<u64>()
///     .allocator(SystemAllocator::system())
///     .build();
///
/// assert!(table.is_empty());
/// ```
#[derive(Clone, Copy, Default)]
pub struct GlobalAllocator<G> {
    inner: G,
}

/// The allocator used by containers unless another one is configured.
pub type SystemAllocator = GlobalAllocator<System>;

impl GlobalAllocator<System> {
    /// Creates an allocator backed by the operating system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<G: GlobalAlloc> GlobalAllocator<G> {
    /// Creates an allocator backed by the given global allocator.
    #[must_use]
    pub const fn new(inner: G) -> Self {
        Self { inner }
    }
}

impl<G> fmt::Debug for GlobalAllocator<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalAllocator")
            .field("inner", &std::any::type_name::<G>())
            .finish()
    }
}

impl<G: GlobalAlloc> Allocator for GlobalAllocator<G> {
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        match (ptr, new_size) {
            (None, 0) => None,
            (None, _) => {
                // SAFETY: The caller guarantees that the size and alignment form a valid layout.
                let layout = unsafe { Layout::from_size_align_unchecked(new_size, align) };

                // SAFETY: The layout is non-zero-sized (matched above).
                NonNull::new(unsafe { self.inner.alloc(layout) })
            }
            (Some(ptr), 0) => {
                // SAFETY: The caller guarantees that this is the layout the memory was allocated with.
                let layout = unsafe { Layout::from_size_align_unchecked(old_size, align) };

                // SAFETY: The caller guarantees that `ptr` was allocated by us with this layout.
                unsafe {
                    self.inner.dealloc(ptr.as_ptr(), layout);
                }

                None
            }
            (Some(ptr), _) => {
                // SAFETY: The caller guarantees that this is the layout the memory was allocated with.
                let layout = unsafe { Layout::from_size_align_unchecked(old_size, align) };

                // SAFETY: The caller guarantees that `ptr` was allocated by us with this layout
                // and that the new size is valid for the alignment.
                NonNull::new(unsafe { self.inner.realloc(ptr.as_ptr(), layout, new_size) })
            }
        }
    }
}
