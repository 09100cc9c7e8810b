use std::alloc::Layout;
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;

use tracing::debug;

use crate::{Allocator, SystemAllocator};

/// Smallest number of block pointers the block table is allocated for.
const MIN_TABLE_CAPACITY: usize = 8;

const RUN_START_WORD_BITS: usize = u64::BITS as usize;

/// A growable sequence of separately allocated, equally sized memory blocks.
///
/// Blocks are addressed through a small table of block base pointers. Growing the array may move
/// that table but never moves a block: once a block has been handed out, its address stays valid
/// until the array is dropped. Blocks are never released individually.
///
/// Blocks added by one [`grow()`][1] call are carved from a single contiguous allocation (a
/// *run*). A bitmask stored right after the pointer table in the same allocation records which
/// blocks start a run, so that dropping the array releases each run with the size it was
/// allocated with.
///
/// Block memory is not initialized by the array.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use stable_memory::BlockArray;
///
/// let mut blocks = BlockArray::new(Layout::from_size_align(256, 64).unwrap());
///
/// let added = blocks.grow(2, 0, 1);
/// assert_eq!(added, 0..2);
///
/// let first = blocks.block(0);
/// blocks.grow(10, 0, 1);
///
/// // Growth never moves existing blocks.
/// assert_eq!(blocks.block(0), first);
/// assert_eq!(first.as_ptr() as usize % 64, 0);
/// ```
///
/// [1]: Self::grow
pub struct BlockArray<A: Allocator = SystemAllocator> {
    /// Layout of one block, padded so that consecutive blocks in a run stay aligned.
    block_layout: Layout,

    /// Start of the block table: `table_capacity` block pointers followed by the run-start
    /// bitmask words. Dangling while `table_capacity` is zero.
    table: NonNull<u8>,

    table_capacity: usize,

    len: usize,

    allocator: A,
}

/// Where the parts of a block table of a given capacity live within its allocation.
#[derive(Clone, Copy, Debug)]
struct TableLayout {
    layout: Layout,
    mask_offset: usize,
    mask_words: usize,
}

impl TableLayout {
    fn calculate(capacity: usize) -> Self {
        let pointers =
            Layout::array::<NonNull<u8>>(capacity).expect("block table capacity overflow");

        let mask_words = capacity.div_ceil(RUN_START_WORD_BITS);
        let mask = Layout::array::<u64>(mask_words).expect("block table capacity overflow");

        let (layout, mask_offset) = pointers
            .extend(mask)
            .expect("block table capacity overflow");

        Self {
            layout: layout.pad_to_align(),
            mask_offset,
            mask_words,
        }
    }
}

impl BlockArray {
    /// Creates an empty array of blocks with the given layout, backed by the system allocator.
    ///
    /// # Panics
    ///
    /// Panics if the layout is zero-sized.
    #[must_use]
    pub fn new(block_layout: Layout) -> Self {
        Self::with_allocator(block_layout, SystemAllocator::system())
    }
}

impl<A: Allocator> BlockArray<A> {
    /// Creates an empty array of blocks with the given layout that obtains memory from
    /// `allocator`. Does not allocate.
    ///
    /// # Panics
    ///
    /// Panics if the layout is zero-sized.
    #[must_use]
    pub fn with_allocator(block_layout: Layout, allocator: A) -> Self {
        assert!(
            block_layout.size() > 0,
            "BlockArray must have non-zero block size"
        );

        Self {
            block_layout: block_layout.pad_to_align(),
            table: NonNull::dangling(),
            table_capacity: 0,
            len: 0,
            allocator,
        }
    }

    /// Number of blocks.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array has no blocks.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The layout of each block (padded to its alignment).
    #[must_use]
    #[inline]
    pub fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// Returns the base address of block `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn block(&self, index: usize) -> NonNull<u8> {
        self.get(index).unwrap_or_else(|| {
            panic!(
                "block {index} out of bounds in block array of {} blocks",
                self.len
            )
        })
    }

    /// Returns the base address of block `index`, if it exists.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<NonNull<u8>> {
        self.pointers().get(index).copied()
    }

    /// Whether block `index` is the first block of a contiguous allocation run.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn is_run_start(&self, index: usize) -> bool {
        assert!(
            index < self.len,
            "block {index} out of bounds in block array of {} blocks",
            self.len
        );

        let (word_index, bit) = run_start_bit(index);

        let word = self
            .mask_words()
            .get(word_index)
            .expect("mask covers the whole table capacity");

        word & bit != 0
    }

    /// Grows the array to `max(to_len, len * growth_multiplier + growth_linear)` blocks, returning
    /// the indexes of the added blocks. Does nothing if the array already has at least `to_len`
    /// blocks.
    ///
    /// All added blocks come from one allocation. The addresses of existing blocks are unchanged.
    pub fn grow(
        &mut self,
        to_len: usize,
        growth_linear: usize,
        growth_multiplier: usize,
    ) -> Range<usize> {
        if to_len <= self.len {
            return self.len..self.len;
        }

        let new_len = self
            .len
            .saturating_mul(growth_multiplier)
            .saturating_add(growth_linear)
            .max(to_len);

        // Cannot underflow because new_len >= to_len > len.
        let added = new_len.wrapping_sub(self.len);

        let run_size = self
            .block_layout
            .size()
            .checked_mul(added)
            .expect("block array size overflow");
        let run_layout = Layout::from_size_align(run_size, self.block_layout.align())
            .expect("block array size overflow");

        let run = self.allocator.allocate(run_layout);

        self.reserve_table(new_len);

        let old_len = self.len;
        let block_size = self.block_layout.size();

        for (offset, index) in (old_len..new_len).enumerate() {
            // SAFETY: The run holds `added` blocks and offset < added, so this stays in bounds.
            // Cannot overflow because run_size did not overflow.
            let block = unsafe { run.add(offset.wrapping_mul(block_size)) };

            // SAFETY: reserve_table() made room for new_len pointers.
            unsafe {
                self.pointer_ptr(index).write(block);
            }
        }

        self.set_run_start(old_len);
        self.len = new_len;

        debug!(
            from = old_len,
            to = new_len,
            block_size,
            "block array grew"
        );

        old_len..new_len
    }

    fn pointers(&self) -> &[NonNull<u8>] {
        // The dangling table pointer is not aligned for block pointers.
        if self.table_capacity == 0 {
            return &[];
        }

        // SAFETY: The table holds `len` initialized block pointers at its start and is aligned
        // for them.
        unsafe { std::slice::from_raw_parts(self.table.cast::<NonNull<u8>>().as_ptr(), self.len) }
    }

    fn mask_words(&self) -> &[u64] {
        if self.table_capacity == 0 {
            return &[];
        }

        let table_layout = TableLayout::calculate(self.table_capacity);

        // SAFETY: The mask words were zero-initialized when the table was allocated and are
        // located at `mask_offset` with proper alignment.
        unsafe {
            std::slice::from_raw_parts(
                self.table
                    .byte_add(table_layout.mask_offset)
                    .cast::<u64>()
                    .as_ptr(),
                table_layout.mask_words,
            )
        }
    }

    fn set_run_start(&mut self, index: usize) {
        let table_layout = TableLayout::calculate(self.table_capacity);
        let (word_index, bit) = run_start_bit(index);

        assert!(word_index < table_layout.mask_words);

        // SAFETY: Bounds checked above; the mask words live in our table allocation.
        unsafe {
            let word = self
                .table
                .byte_add(table_layout.mask_offset)
                .cast::<u64>()
                .add(word_index);

            word.write(word.read() | bit);
        }
    }

    /// # Safety
    ///
    /// `index` must be less than the table capacity.
    unsafe fn pointer_ptr(&self, index: usize) -> NonNull<NonNull<u8>> {
        debug_assert!(index < self.table_capacity);

        // SAFETY: Forwarding the bounds requirement to the caller.
        unsafe { self.table.cast::<NonNull<u8>>().add(index) }
    }

    /// Ensures the block table can hold at least `capacity` pointers, doubling as needed.
    fn reserve_table(&mut self, capacity: usize) {
        if capacity <= self.table_capacity {
            return;
        }

        let new_capacity = self
            .table_capacity
            .saturating_mul(2)
            .max(capacity)
            .max(MIN_TABLE_CAPACITY);

        let new_layout = TableLayout::calculate(new_capacity);
        let new_table = self.allocator.allocate_zeroed(new_layout.layout);

        if self.table_capacity > 0 {
            let old_layout = TableLayout::calculate(self.table_capacity);

            // SAFETY: Both tables are valid for these sizes and do not overlap. The old table holds
            // `len` pointers and `mask_words` initialized mask words, all of which fit the new one.
            unsafe {
                new_table
                    .cast::<NonNull<u8>>()
                    .copy_from_nonoverlapping(self.table.cast::<NonNull<u8>>(), self.len);

                new_table
                    .byte_add(new_layout.mask_offset)
                    .cast::<u64>()
                    .copy_from_nonoverlapping(
                        self.table.byte_add(old_layout.mask_offset).cast::<u64>(),
                        old_layout.mask_words,
                    );

                self.allocator.deallocate(self.table, old_layout.layout);
            }
        }

        self.table = new_table;
        self.table_capacity = new_capacity;
    }
}

/// The mask word holding the run-start flag of block `index`, and the flag bit within that word.
#[expect(
    clippy::integer_division,
    clippy::modulo_arithmetic,
    reason = "the quotient and remainder are exactly the word and bit position"
)]
fn run_start_bit(index: usize) -> (usize, u64) {
    (
        index / RUN_START_WORD_BITS,
        1 << (index % RUN_START_WORD_BITS),
    )
}

impl<A: Allocator> Drop for BlockArray<A> {
    fn drop(&mut self) {
        let block_size = self.block_layout.size();
        let mut index = 0;

        while index < self.len {
            let run_start = index;
            index = index.wrapping_add(1);

            while index < self.len && !self.is_run_start(index) {
                index = index.wrapping_add(1);
            }

            // Cannot overflow because this run was allocated with exactly this size.
            let run_size = block_size.wrapping_mul(index.wrapping_sub(run_start));
            let run_layout = Layout::from_size_align(run_size, self.block_layout.align())
                .expect("run layout was valid when the run was allocated");

            // SAFETY: Every run starts at a marked block and extends to the next marked block or
            // the end of the array, which is exactly how it was allocated in grow().
            unsafe {
                self.allocator.deallocate(self.block(run_start), run_layout);
            }
        }

        if self.table_capacity > 0 {
            // SAFETY: We allocated the table with exactly this layout and still own it.
            unsafe {
                self.allocator.deallocate(
                    self.table,
                    TableLayout::calculate(self.table_capacity).layout,
                );
            }
        }
    }
}

impl<A: Allocator> fmt::Debug for BlockArray<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockArray")
            .field("block_layout", &self.block_layout)
            .field("len", &self.len)
            .field("table_capacity", &self.table_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::DebugAllocator;

    assert_not_impl_any!(BlockArray: Send, Sync);

    fn layout() -> Layout {
        Layout::from_size_align(48, 16).unwrap()
    }

    #[test]
    fn new_array_is_empty() {
        let blocks = BlockArray::new(layout());

        assert!(blocks.is_empty());
        assert_eq!(blocks.get(0), None);
    }

    #[test]
    fn empty_array_lookups_return_none() {
        let blocks = BlockArray::new(Layout::from_size_align(64, 8).unwrap());

        assert_eq!(blocks.get(0), None);
        assert_eq!(blocks.get(1), None);
        assert_eq!(blocks.get(usize::MAX), None);
    }

    #[test]
    #[should_panic]
    fn empty_array_block_panics() {
        let blocks = BlockArray::new(layout());

        _ = blocks.block(0);
    }

    #[test]
    fn grow_uses_growth_policy() {
        let mut blocks = BlockArray::new(layout());

        assert_eq!(blocks.grow(1, 1, 2), 0..1);
        // max(2, 1 * 2 + 1) = 3
        assert_eq!(blocks.grow(2, 1, 2), 1..3);
        // max(20, 3 * 2 + 1) = 20
        assert_eq!(blocks.grow(20, 1, 2), 3..20);
        assert_eq!(blocks.len(), 20);
    }

    #[test]
    fn grow_to_smaller_len_is_noop() {
        let mut blocks = BlockArray::new(layout());
        blocks.grow(4, 0, 1);

        assert_eq!(blocks.grow(3, 0, 1), 4..4);
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn run_starts_are_recorded() {
        let mut blocks = BlockArray::new(layout());
        blocks.grow(3, 0, 1);
        blocks.grow(5, 0, 1);
        blocks.grow(6, 0, 1);

        let starts: Vec<_> = (0..6).filter(|&i| blocks.is_run_start(i)).collect();
        assert_eq!(starts, vec![0, 3, 5]);
    }

    #[test]
    fn blocks_in_run_are_contiguous_and_aligned() {
        let mut blocks = BlockArray::new(layout());
        blocks.grow(4, 0, 1);

        let stride = blocks.block_layout().size();
        assert_eq!(stride, 48);

        for i in 0..4 {
            let addr = blocks.block(i).as_ptr() as usize;
            assert_eq!(addr % 16, 0);
            assert_eq!(addr, blocks.block(0).as_ptr() as usize + i * stride);
        }
    }

    #[test]
    fn unpadded_layout_is_padded() {
        let blocks = BlockArray::new(Layout::from_size_align(20, 8).unwrap());

        assert_eq!(blocks.block_layout().size(), 24);
    }

    #[test]
    fn growth_never_moves_existing_blocks() {
        let mut blocks = BlockArray::new(layout());
        blocks.grow(1, 0, 1);

        let first = blocks.block(0);

        // SAFETY: The block is 48 bytes and aligned to 16.
        unsafe {
            first.cast::<u64>().write(0xDEAD_BEEF);
        }

        // Enough single-block growth steps to force the block table to move several times.
        for len in 2..=200 {
            blocks.grow(len, 0, 1);
        }

        assert_eq!(blocks.len(), 200);
        assert_eq!(blocks.block(0), first);

        // SAFETY: Same block as above, still owned by the array.
        assert_eq!(unsafe { first.cast::<u64>().read() }, 0xDEAD_BEEF);
        assert!((0..blocks.len()).all(|i| blocks.is_run_start(i)));
    }

    #[test]
    fn drop_releases_every_run() {
        let allocator = DebugAllocator::new(SystemAllocator::system());

        {
            let mut blocks = BlockArray::with_allocator(layout(), &allocator);
            blocks.grow(3, 0, 1);
            blocks.grow(70, 0, 1);
            blocks.grow(71, 1, 2);

            assert!(allocator.live_count() > 0);
        }

        assert_eq!(allocator.live_count(), 0);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_block_panics() {
        let mut blocks = BlockArray::new(layout());
        blocks.grow(2, 0, 1);

        _ = blocks.block(2);
    }

    #[test]
    #[should_panic]
    fn zero_sized_block_panics() {
        drop(BlockArray::new(Layout::from_size_align(0, 8).unwrap()));
    }
}
