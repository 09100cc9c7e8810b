use std::alloc::Layout;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::{fmt, thread};

use tracing::trace;

use crate::slot_mask::{bit, first_clear_bit, is_set, set_bits};
use crate::{Allocator, BlockArray, DropPolicy, SlotMask, StableArrayBuilder, SystemAllocator};

/// Written at the start of every block header and checked on every access.
const BLOCK_MAGIC: u32 = 0x5AB1_E0B7;

/// A slot allocator that hands out zeroed, fixed-size memory slots whose addresses never change.
///
/// The array is built from blocks of `M::SLOTS` slots each (64 for the default `u64` mask, 32 for
/// `u32`). Every block starts with a header holding a liveness bitmask (bit `i` set means slot `i`
/// is occupied) and a link that threads the block into a singly linked list of blocks that still
/// have at least one vacant slot. Inserting pops a vacant slot from the block at the head of that
/// list using a single bit scan, so insertion, removal and lookup are all O(1) apart from the
/// occasional growth step.
///
/// Items are addressed by a `usize` index. The array makes no assumptions about what the slot
/// memory holds; it only guarantees size, alignment, zero-initialization on insert and address
/// stability until the item is removed or the array is dropped.
///
/// # Examples
///
/// ```
/// use stable_memory::StableArray;
///
/// let mut array = StableArray::builder().layout_of::<u64>().build();
///
/// let slot = array.insert();
///
/// // SAFETY: The slot is sized and aligned for a u64 and we have exclusive access to it.
/// unsafe {
///     slot.ptr().cast::<u64>().write(42);
///     assert_eq!(array.at(slot.index()).cast::<u64>().read(), 42);
/// }
///
/// assert!(array.remove(slot.index()));
/// assert!(array.at_safe(slot.index()).is_none());
/// ```
pub struct StableArray<A: Allocator = SystemAllocator, M: SlotMask = u64> {
    blocks: BlockArray<A>,

    item_layout: Layout,

    layout_info: BlockLayoutInfo,

    /// Head of the list of blocks with at least one vacant slot. The rest of the list is threaded
    /// through the `next_not_filled` field of the block headers.
    first_not_filled: Option<usize>,

    len: usize,

    growth_linear: usize,
    growth_multiplier: usize,

    drop_policy: DropPolicy,

    _mask: PhantomData<M>,
}

/// Stored at offset zero of every block.
#[derive(Debug)]
#[repr(C)]
struct BlockHeader<M> {
    magic: u32,

    /// Bit `i` is set if slot `i` of the block is occupied.
    live: M,

    /// Next block in the not-filled list. Only meaningful while the block is in the list.
    next_not_filled: Option<usize>,
}

/// Layout calculations for the blocks of a [`StableArray`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct BlockLayoutInfo {
    /// Layout of one whole block: header followed by the slots.
    block_layout: Layout,

    /// Byte offset from the block start to the first slot.
    slots_offset: usize,

    /// Distance in bytes between consecutive slots.
    slot_stride: usize,
}

impl BlockLayoutInfo {
    fn calculate<M: SlotMask>(item_layout: Layout) -> Self {
        assert!(
            item_layout.size() > 0,
            "StableArray must have non-zero item size"
        );

        let slot_stride = item_layout.pad_to_align().size();

        let slots_size = slot_stride
            .checked_mul(M::SLOTS)
            .expect("block size calculation overflow");
        let slots_layout = Layout::from_size_align(slots_size, item_layout.align())
            .expect("block size calculation overflow");

        let (block_layout, slots_offset) = Layout::new::<BlockHeader<M>>()
            .extend(slots_layout)
            .expect("block size calculation overflow");

        Self {
            block_layout: block_layout.pad_to_align(),
            slots_offset,
            slot_stride,
        }
    }
}

/// The result of inserting into a [`StableArray`]: the item index and its memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StableSlot {
    index: usize,
    ptr: NonNull<u8>,
}

impl StableSlot {
    /// The index used to access or remove the item later.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pointer to the item memory, valid until the item is removed or the array is dropped.
    #[must_use]
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl StableArray {
    /// Starts configuring a new stable array. The item layout is mandatory.
    ///
    /// # Examples
    ///
    /// ```
    /// use stable_memory::StableArray;
    ///
    /// let array = StableArray::builder()
    ///     .layout_of::<[u32; 4]>()
    ///     .slot_mask::<u32>()
    ///     .build();
    ///
    /// assert_eq!(array.capacity(), 0);
    /// ```
    #[inline]
    pub fn builder() -> StableArrayBuilder {
        StableArrayBuilder::new()
    }
}

impl<A: Allocator, M: SlotMask> StableArray<A, M> {
    pub(crate) fn new_inner(
        item_layout: Layout,
        allocator: A,
        growth_linear: usize,
        growth_multiplier: usize,
        drop_policy: DropPolicy,
    ) -> Self {
        let layout_info = BlockLayoutInfo::calculate::<M>(item_layout);

        Self {
            blocks: BlockArray::with_allocator(layout_info.block_layout, allocator),
            item_layout,
            layout_info,
            first_not_filled: None,
            len: 0,
            growth_linear,
            growth_multiplier,
            drop_policy,
            _mask: PhantomData,
        }
    }

    /// Number of live items.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no live items.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots available without growing.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        // Cannot overflow because the blocks already exist in memory.
        self.blocks.len().wrapping_mul(M::SLOTS)
    }

    /// The layout of each item slot.
    #[must_use]
    #[inline]
    pub fn item_layout(&self) -> Layout {
        self.item_layout
    }

    /// Occupies a vacant slot, growing the array if there is none, and returns its index together
    /// with a pointer to its zeroed memory.
    pub fn insert(&mut self) -> StableSlot {
        let block_index = match self.first_not_filled {
            Some(block_index) => block_index,
            None => {
                let required = self
                    .len
                    .checked_add(1)
                    .expect("stable array size overflow");
                self.grow_to(required);

                self.first_not_filled
                    .expect("growth always adds blocks with vacant slots")
            }
        };

        // SAFETY: The header is initialized and lives in block memory we own, not in `self`, and
        // we hold an exclusive reference to the array.
        let header = unsafe { self.header_ptr(block_index).as_mut() };

        let slot = first_clear_bit(header.live)
            .expect("blocks in the not-filled list always have a vacant slot");

        header.live = header.live | bit::<M>(slot);

        if header.live == M::max_value() {
            self.first_not_filled = header.next_not_filled.take();
        }

        let ptr = self.slot_ptr(block_index, slot);

        // SAFETY: The slot is in bounds of the block and sized for one item.
        unsafe {
            ptr.write_bytes(0, self.item_layout.size());
        }

        // Cannot overflow because every item occupies memory.
        self.len = self.len.wrapping_add(1);

        StableSlot {
            index: block_index.wrapping_mul(M::SLOTS).wrapping_add(slot),
            ptr,
        }
    }

    /// Vacates the slot at `index`. Returns `false` if there was no live item at `index`.
    pub fn remove(&mut self, index: usize) -> bool {
        let (block_index, slot) = coordinates::<M>(index);

        if block_index >= self.blocks.len() {
            return false;
        }

        // SAFETY: The header is initialized and lives in block memory we own, not in `self`, and
        // we hold an exclusive reference to the array.
        let header = unsafe { self.header_ptr(block_index).as_mut() };

        if !is_set(header.live, slot) {
            return false;
        }

        let was_full = header.live == M::max_value();
        header.live = header.live & !bit::<M>(slot);

        if was_full {
            header.next_not_filled = self.first_not_filled;
            self.first_not_filled = Some(block_index);
        }

        self.len = self
            .len
            .checked_sub(1)
            .expect("a live item was found so len must be non-zero");

        true
    }

    /// Returns the memory of the live item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if there is no live item at `index`.
    #[must_use]
    pub fn at(&self, index: usize) -> NonNull<u8> {
        self.at_safe(index).unwrap_or_else(|| {
            panic!(
                "no live item at index {index} in stable array of capacity {}",
                self.capacity()
            )
        })
    }

    /// Returns the memory of the live item at `index`, or `None` if there is none.
    #[must_use]
    pub fn at_safe(&self, index: usize) -> Option<NonNull<u8>> {
        let (block_index, slot) = coordinates::<M>(index);

        if block_index >= self.blocks.len() {
            return None;
        }

        // SAFETY: The header is initialized and lives in block memory we own.
        let header = unsafe { self.header_ptr(block_index).as_ref() };

        is_set(header.live, slot).then(|| self.slot_ptr(block_index, slot))
    }

    /// Whether there is a live item at `index`.
    #[must_use]
    #[inline]
    pub fn is_alive(&self, index: usize) -> bool {
        self.at_safe(index).is_some()
    }

    /// Ensures that at least `to_size` items fit without further growth.
    pub fn reserve(&mut self, to_size: usize) {
        self.grow_to(to_size);
    }

    /// Iterates over the live items in index order.
    pub fn iter(&self) -> impl Iterator<Item = StableSlot> + '_ {
        (0..self.blocks.len()).flat_map(move |block_index| {
            // SAFETY: The header is initialized and lives in block memory we own.
            let live = unsafe { self.header_ptr(block_index).as_ref() }.live;

            set_bits(live).map(move |slot| StableSlot {
                index: block_index.wrapping_mul(M::SLOTS).wrapping_add(slot),
                ptr: self.slot_ptr(block_index, slot),
            })
        })
    }

    fn grow_to(&mut self, required: usize) {
        if required <= self.capacity() {
            return;
        }

        let required_blocks = required.div_ceil(M::SLOTS);
        let added = self
            .blocks
            .grow(required_blocks, self.growth_linear, self.growth_multiplier);

        // Pushed in reverse so that the lowest new block ends up at the head of the list.
        for block_index in added.clone().rev() {
            let header = self.blocks.block(block_index).cast::<BlockHeader<M>>();

            // SAFETY: The block was just allocated with room and alignment for a header at its
            // start and nothing else refers to it yet.
            unsafe {
                header.write(BlockHeader {
                    magic: BLOCK_MAGIC,
                    live: M::zero(),
                    next_not_filled: self.first_not_filled,
                });
            }

            self.first_not_filled = Some(block_index);
        }

        trace!(
            blocks = ?added,
            slots_per_block = M::SLOTS,
            len = self.len,
            "stable array grew"
        );
    }

    /// # Panics
    ///
    /// Panics if the block does not exist or its header is corrupted.
    fn header_ptr(&self, block_index: usize) -> NonNull<BlockHeader<M>> {
        let header = self.blocks.block(block_index).cast::<BlockHeader<M>>();

        // SAFETY: Headers are written when blocks are added and block memory is never released
        // while the array exists.
        let magic = unsafe { header.as_ref() }.magic;

        assert_eq!(
            magic, BLOCK_MAGIC,
            "corrupted header in block {block_index} of stable array"
        );

        header
    }

    fn slot_ptr(&self, block_index: usize, slot: usize) -> NonNull<u8> {
        debug_assert!(slot < M::SLOTS);

        let offset = self
            .layout_info
            .slots_offset
            .wrapping_add(slot.wrapping_mul(self.layout_info.slot_stride));

        // SAFETY: The offset of any slot below M::SLOTS is within the block layout.
        unsafe { self.blocks.block(block_index).byte_add(offset) }
    }

    #[cfg(test)]
    #[expect(
        clippy::indexing_slicing,
        clippy::arithmetic_side_effects,
        reason = "test-only consistency walk"
    )]
    pub(crate) fn integrity_check(&self) {
        let mut linked = vec![false; self.blocks.len()];
        let mut cursor = self.first_not_filled;

        while let Some(block_index) = cursor {
            assert!(
                !linked[block_index],
                "block {block_index} is linked twice into the not-filled list"
            );
            linked[block_index] = true;

            // SAFETY: The header is initialized and lives in block memory we own.
            let header = unsafe { self.header_ptr(block_index).as_ref() };
            cursor = header.next_not_filled;
        }

        let mut live_count = 0_usize;

        for (block_index, is_linked) in linked.iter().enumerate() {
            // SAFETY: The header is initialized and lives in block memory we own.
            let header = unsafe { self.header_ptr(block_index).as_ref() };

            assert_eq!(
                *is_linked,
                header.live != M::max_value(),
                "block {block_index} is in the not-filled list if and only if it has a vacancy"
            );

            live_count += header.live.count_ones() as usize;
        }

        assert_eq!(live_count, self.len);
    }
}

/// Splits an item index into its block index and the slot within that block.
#[expect(
    clippy::integer_division,
    clippy::modulo_arithmetic,
    reason = "the quotient and remainder are exactly the coordinates"
)]
fn coordinates<M: SlotMask>(index: usize) -> (usize, usize) {
    (index / M::SLOTS, index % M::SLOTS)
}

impl<A: Allocator, M: SlotMask> Drop for StableArray<A, M> {
    fn drop(&mut self) {
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropItems) {
            assert!(
                self.is_empty(),
                "dropped a non-empty StableArray with {} items - this is forbidden by DropPolicy::MustNotDropItems",
                self.len
            );
        }
    }
}

impl<A: Allocator, M: SlotMask> fmt::Debug for StableArray<A, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StableArray")
            .field("item_layout", &self.item_layout)
            .field("slots_per_block", &M::SLOTS)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("first_not_filled", &self.first_not_filled)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::indexing_slicing,
        clippy::cast_possible_truncation,
        reason = "we do not need to worry about these things when writing test code"
    )]

    use std::cell::RefCell;
    use std::collections::HashSet;

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::DebugAllocator;

    assert_not_impl_any!(StableArray: Send, Sync);

    fn u64_array() -> StableArray {
        StableArray::builder().layout_of::<u64>().build()
    }

    #[test]
    fn smoke_test() {
        let mut array = u64_array();

        assert_eq!(array.len(), 0);
        assert!(array.is_empty());

        let a = array.insert();
        let b = array.insert();
        let c = array.insert();

        assert_eq!(array.len(), 3);
        assert!(array.capacity() >= 3);

        unsafe {
            a.ptr().cast::<u64>().write(42);
            b.ptr().cast::<u64>().write(43);
            c.ptr().cast::<u64>().write(44);
        }

        assert!(array.remove(b.index()));

        let d = array.insert();
        unsafe {
            d.ptr().cast::<u64>().write(45);

            assert_eq!(array.at(a.index()).cast::<u64>().read(), 42);
            assert_eq!(array.at(c.index()).cast::<u64>().read(), 44);
            assert_eq!(array.at(d.index()).cast::<u64>().read(), 45);
        }

        array.integrity_check();
    }

    #[test]
    fn inserts_fill_lowest_indexes_first() {
        let mut array = u64_array();

        for expected in 0..200 {
            assert_eq!(array.insert().index(), expected);
        }

        array.integrity_check();
    }

    #[test]
    fn second_block_allocated_and_reused_before_extending() {
        let mut array = u64_array();

        for _ in 0..64 {
            _ = array.insert();
        }
        assert_eq!(array.capacity(), 64);

        let item_64 = array.insert();
        assert_eq!(item_64.index(), 64);
        let capacity_after_growth = array.capacity();
        assert!(capacity_after_growth > 64);

        assert!(array.remove(64));
        assert_eq!(array.insert().index(), 64);
        assert_eq!(array.capacity(), capacity_after_growth);

        array.integrity_check();
    }

    #[test]
    fn removal_from_full_block_relinks_it() {
        let mut array = u64_array();

        for _ in 0..128 {
            _ = array.insert();
        }

        // Both blocks are full now. Free a slot in the first one.
        assert!(array.remove(10));
        array.integrity_check();

        assert_eq!(array.insert().index(), 10);
        array.integrity_check();
    }

    #[test]
    fn light_variant_uses_32_slot_blocks() {
        let mut array = StableArray::builder()
            .layout_of::<u32>()
            .slot_mask::<u32>()
            .growth(1, 1)
            .build();

        for _ in 0..33 {
            _ = array.insert();
        }

        assert_eq!(array.capacity(), 64);
        array.integrity_check();
    }

    #[test]
    fn inserted_memory_is_zeroed() {
        let mut array = StableArray::builder().layout_of::<[u8; 24]>().build();

        let slot = array.insert();
        unsafe {
            slot.ptr().write_bytes(0xAB, 24);
        }
        assert!(array.remove(slot.index()));

        let slot = array.insert();
        let bytes = unsafe { std::slice::from_raw_parts(slot.ptr().as_ptr(), 24) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn addresses_are_stable_across_growth() {
        let mut array = u64_array();

        let first = array.insert();
        unsafe {
            first.ptr().cast::<u64>().write(7);
        }

        for _ in 0..10_000 {
            _ = array.insert();
        }

        assert_eq!(array.at(first.index()), first.ptr());
        assert_eq!(unsafe { first.ptr().cast::<u64>().read() }, 7);
    }

    #[test]
    fn slots_respect_alignment() {
        #[repr(C, align(32))]
        struct Aligned {
            data: [u8; 40],
        }

        let mut array = StableArray::builder().layout_of::<Aligned>().build();

        for _ in 0..100 {
            let slot = array.insert();
            assert_eq!(slot.ptr().as_ptr() as usize % 32, 0);
        }
    }

    #[test]
    fn remove_dead_or_out_of_range_is_false() {
        let mut array = u64_array();

        assert!(!array.remove(0));
        assert!(!array.remove(usize::MAX));

        let slot = array.insert();
        assert!(array.remove(slot.index()));
        assert!(!array.remove(slot.index()));
    }

    #[test]
    fn at_safe_reports_dead_slots() {
        let mut array = u64_array();

        assert!(array.at_safe(0).is_none());

        let slot = array.insert();
        assert_eq!(array.at_safe(slot.index()), Some(slot.ptr()));
        assert!(array.is_alive(slot.index()));
        assert!(array.at_safe(slot.index() + 1).is_none());
        assert!(array.at_safe(usize::MAX).is_none());
    }

    #[test]
    #[should_panic]
    fn at_dead_slot_panics() {
        let mut array = u64_array();
        let slot = array.insert();
        array.remove(slot.index());

        _ = array.at(slot.index());
    }

    #[test]
    fn reserve_grows_capacity_once() {
        let mut array = u64_array();

        array.reserve(1000);
        let capacity = array.capacity();
        assert!(capacity >= 1000);

        for _ in 0..1000 {
            _ = array.insert();
        }

        assert_eq!(array.capacity(), capacity);
        array.integrity_check();
    }

    #[test]
    fn iter_visits_live_items_in_order() {
        let mut array = u64_array();

        for _ in 0..130 {
            _ = array.insert();
        }
        for index in [0, 5, 64, 129] {
            assert!(array.remove(index));
        }

        let indexes: Vec<_> = array.iter().map(|slot| slot.index()).collect();
        let expected: Vec<_> = (0..130)
            .filter(|i| ![0, 5, 64, 129].contains(i))
            .collect();

        assert_eq!(indexes, expected);
        assert!(array.iter().all(|slot| array.at(slot.index()) == slot.ptr()));
    }

    #[test]
    fn churn_keeps_free_list_consistent() {
        let mut array = u64_array();
        let mut live = HashSet::new();

        for round in 0..2000_usize {
            if round % 3 == 2 {
                let victim = *live.iter().next().unwrap();
                assert!(array.remove(victim));
                live.remove(&victim);
            } else {
                assert!(live.insert(array.insert().index()));
            }
        }

        assert_eq!(array.len(), live.len());
        array.integrity_check();
    }

    #[test]
    fn in_refcell_works_fine() {
        let array = RefCell::new(u64_array());

        let index = array.borrow_mut().insert().index();
        assert!(array.borrow().is_alive(index));
        assert!(array.borrow_mut().remove(index));
        assert!(array.borrow().is_empty());
    }

    #[test]
    fn drop_releases_all_memory() {
        let allocator = DebugAllocator::new(SystemAllocator::system());

        {
            let mut array = StableArray::builder()
                .layout_of::<u64>()
                .allocator(&allocator)
                .build();

            for _ in 0..500 {
                _ = array.insert();
            }
        }

        assert_eq!(allocator.live_count(), 0);
    }

    #[test]
    #[should_panic]
    fn drop_item_with_forbidden_to_drop_policy_panics() {
        let mut array = StableArray::builder()
            .layout_of::<u64>()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        _ = array.insert();
    }

    #[test]
    fn drop_itemless_with_forbidden_to_drop_policy_ok() {
        let mut array = StableArray::builder()
            .layout_of::<u64>()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        let slot = array.insert();
        assert!(array.remove(slot.index()));
    }

    #[test]
    fn block_layout_places_slots_after_header() {
        let info = BlockLayoutInfo::calculate::<u64>(Layout::new::<u64>());

        assert!(info.slots_offset >= size_of::<BlockHeader<u64>>());
        assert_eq!(info.slot_stride, 8);
        assert!(info.block_layout.size() >= info.slots_offset + 64 * 8);
    }
}
