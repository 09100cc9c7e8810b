use std::alloc::Layout;
use std::ptr::NonNull;
use std::{fmt, slice};

use crate::Allocator;

/// A growable array of plain-data items whose storage comes from an [`Allocator`].
///
/// Items are `Copy`, so the buffer never needs to run destructors; releasing the storage is all
/// that happens on drop.
pub(crate) struct AllocBuf<T: Copy, A: Allocator> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    allocator: A,
}

const MIN_CAPACITY: usize = 8;

impl<T: Copy, A: Allocator> AllocBuf<T, A> {
    pub(crate) fn new(allocator: A) -> Self {
        assert!(
            size_of::<T>() > 0,
            "AllocBuf must have non-zero item size"
        );

        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
            allocator,
        }
    }

    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: The first `len` items are initialized and `ptr` is either dangling with len 0
        // or points to our allocation of `capacity >= len` items.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: See as_slice(); we hold an exclusive reference to the buffer.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn push(&mut self, item: T) {
        if self.len == self.capacity {
            self.grow();
        }

        // SAFETY: We ensured above that there is room for at least one more item.
        unsafe {
            self.ptr.add(self.len).write(item);
        }

        // Cannot overflow because the buffer would exceed virtual memory first.
        self.len = self.len.wrapping_add(1);
    }

    /// Removes the item at `index`, moving the last item into its place.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub(crate) fn swap_remove(&mut self, index: usize) -> T {
        let last = self
            .len
            .checked_sub(1)
            .expect("swap_remove() on an empty buffer");

        let slice = self.as_mut_slice();
        slice.swap(index, last);
        let item = *slice.get(last).expect("guarded by len check above");

        self.len = last;
        item
    }

    fn grow(&mut self) {
        let new_capacity = self
            .capacity
            .checked_mul(2)
            .expect("capacity overflow")
            .max(MIN_CAPACITY);
        let new_layout = Layout::array::<T>(new_capacity).expect("capacity overflow");

        let new_ptr = if self.capacity == 0 {
            self.allocator.allocate(new_layout)
        } else {
            // SAFETY: We allocated `ptr` with exactly this layout and still own it.
            unsafe {
                self.allocator
                    .resize(self.ptr.cast(), self.layout(), new_layout.size())
            }
        };

        self.ptr = new_ptr.cast();
        self.capacity = new_capacity;
    }

    fn layout(&self) -> Layout {
        Layout::array::<T>(self.capacity).expect("layout was valid when the buffer grew")
    }
}

impl<T: Copy, A: Allocator> Drop for AllocBuf<T, A> {
    fn drop(&mut self) {
        if self.capacity > 0 {
            // SAFETY: We allocated `ptr` with exactly this layout and still own it.
            unsafe {
                self.allocator.deallocate(self.ptr.cast(), self.layout());
            }
        }
    }
}

impl<T: Copy + fmt::Debug, A: Allocator> fmt::Debug for AllocBuf<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
