use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;
use std::{fmt, thread};

use crate::{
    Allocator, DropPolicy, Handle, HandleTableBuilder, StableArray, StableArrayBuilder,
    SystemAllocator,
};

/// A table of reference-counted items addressed by generation-checked [`Handle`]s.
///
/// Each item lives in a slot of an internal [`StableArray`], preceded by a small header that
/// records the slot generation and the item state. A handle resolves only while the slot
/// generation still matches the one in the handle and the item is alive, so handles can be stored
/// long-term: once the item is released, every handle to it is rejected, even after the slot is
/// reused for a different item.
///
/// Items are reference counted. [`insert()`][Self::insert] creates an item with one reference,
/// [`make_shared()`][Self::make_shared] adds another and [`remove()`][Self::remove] drops one,
/// releasing the slot when the last reference is gone.
///
/// Like [`StableArray`], the table is untyped: it is configured with a memory layout and hands
/// out pointers to zeroed item memory whose address is stable until the item is released.
///
/// # Examples
///
/// ```
/// use stable_memory::HandleTable;
///
/// let mut table = HandleTable::builder().layout_of::<u64>().build();
///
/// let (handle, ptr) = table.insert();
///
/// // SAFETY: The item memory is sized and aligned for a u64 and we have exclusive access.
/// unsafe {
///     ptr.cast::<u64>().write(42);
/// }
///
/// assert_eq!(table.get(handle), Some(ptr));
///
/// // The last reference is gone, so the item is released.
/// assert_eq!(table.remove(handle, None), Some(0));
///
/// // The handle is stale now and will never resolve again.
/// assert_eq!(table.get(handle), None);
/// assert_eq!(table.remove(handle, None), None);
/// ```
pub struct HandleTable<A: Allocator = SystemAllocator> {
    slots: StableArray<A>,

    item_layout: Layout,

    /// Offset of the item memory from the start of a slot.
    item_offset: usize,

    /// Head of the chain of released slots, as a 0-based slot index. The chain continues through
    /// `SlotState::Free` headers.
    first_free: Option<u32>,

    len: usize,

    drop_policy: DropPolicy,
}

/// Stored at the start of every slot, in front of the item memory.
#[derive(Debug)]
#[repr(C)]
struct SlotHeader {
    generation: u32,
    state: SlotState,
}

#[derive(Clone, Copy, Debug)]
enum SlotState {
    Alive { references: NonZero<u32> },
    Free { next_free: Option<u32> },
}

/// The generation a slot has when it is first handed out.
const FIRST_GENERATION: u32 = 1;

impl HandleTable {
    /// Starts configuring a new handle table. The item layout is mandatory.
    ///
    /// # Examples
    ///
    /// ```
    /// use stable_memory::{DropPolicy, HandleTable};
    ///
    /// let table = HandleTable::builder()
    ///     .layout_of::<[f32; 4]>()
    ///     .drop_policy(DropPolicy::MustNotDropItems)
    ///     .build();
    ///
    /// assert!(table.is_empty());
    /// ```
    #[inline]
    pub fn builder() -> HandleTableBuilder {
        HandleTableBuilder::new()
    }
}

impl<A: Allocator> HandleTable<A> {
    pub(crate) fn new_inner(item_layout: Layout, allocator: A, drop_policy: DropPolicy) -> Self {
        assert!(
            item_layout.size() > 0,
            "HandleTable must have non-zero item size"
        );

        let (slot_layout, item_offset) = Layout::new::<SlotHeader>()
            .extend(item_layout)
            .expect("slot size calculation overflow");

        let slots = StableArrayBuilder::new()
            .layout(slot_layout.pad_to_align())
            .allocator(allocator)
            .drop_policy(DropPolicy::MayDropItems)
            .build();

        Self {
            slots,
            item_layout,
            item_offset,
            first_free: None,
            len: 0,
            drop_policy,
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

    /// Number of items the table can hold without growing.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// The layout of the item memory behind each handle.
    #[must_use]
    #[inline]
    pub fn item_layout(&self) -> Layout {
        self.item_layout
    }

    /// Ensures that at least `to_size` items fit without growing.
    pub fn reserve(&mut self, to_size: usize) {
        self.slots.reserve(to_size);
    }

    /// Creates a new item with one reference and returns its handle together with a pointer to
    /// its zeroed memory.
    ///
    /// Released slots are reused before the table grows.
    ///
    /// # Panics
    ///
    /// Panics if the table would exceed `u32::MAX - 1` slots.
    pub fn insert(&mut self) -> (Handle, NonNull<u8>) {
        let (slot_index, slot) = match self.first_free {
            Some(slot_index) => {
                let slot = self.slot(slot_index);

                // SAFETY: Every slot in the stable array holds an initialized header and we
                // hold an exclusive reference to the table.
                let header = unsafe { slot.cast::<SlotHeader>().as_mut() };

                let SlotState::Free { next_free } = header.state else {
                    panic!("slot {slot_index} is in the free chain but is alive: {header:?}");
                };

                self.first_free = next_free;
                header.state = SlotState::Alive {
                    references: NonZero::<u32>::MIN,
                };

                let item = self.item(slot);

                // SAFETY: The item memory is in bounds of the slot and no handle refers to it.
                unsafe {
                    item.write_bytes(0, self.item_layout.size());
                }

                (slot_index, slot)
            }
            None => {
                let slot = self.slots.insert();

                let slot_index = u32::try_from(slot.index())
                    .ok()
                    .filter(|index| *index < u32::MAX)
                    .expect("handle table cannot hold more than u32::MAX - 1 slots");

                // SAFETY: The slot was just created, is sized for a header and nothing else
                // refers to it.
                unsafe {
                    slot.ptr().cast::<SlotHeader>().write(SlotHeader {
                        generation: FIRST_GENERATION,
                        state: SlotState::Alive {
                            references: NonZero::<u32>::MIN,
                        },
                    });
                }

                (slot_index, slot.ptr())
            }
        };

        // Cannot overflow because every item occupies memory.
        self.len = self.len.wrapping_add(1);

        // SAFETY: The header was initialized above.
        let generation = unsafe { slot.cast::<SlotHeader>().as_ref() }.generation;

        (
            Handle::from_raw_parts(handle_index(slot_index), generation),
            self.item(slot),
        )
    }

    /// Resolves a handle to the memory of its item, or `None` if the handle is stale or was never
    /// issued by this table.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<NonNull<u8>> {
        self.resolve(handle).map(|(slot, _)| self.item(slot))
    }

    /// Whether the handle resolves to a live item.
    #[must_use]
    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.resolve(handle).is_some()
    }

    /// The number of references to the item, or `None` if the handle is stale.
    #[must_use]
    #[inline]
    pub fn references(&self, handle: Handle) -> Option<u32> {
        self.resolve(handle)
            .map(|(_, references)| references.get())
    }

    /// Drops one reference to the item and returns the number of references left, or `None` if
    /// the handle is stale.
    ///
    /// When the last reference is dropped the item is released: its bytes are copied into `out`
    /// (if provided), the slot generation advances so that every existing handle to the item
    /// becomes stale, and the slot becomes the first one reused by the next insert.
    ///
    /// # Panics
    ///
    /// Panics if `out` is provided and its length is not the item size.
    pub fn remove(&mut self, handle: Handle, out: Option<&mut [u8]>) -> Option<u32> {
        if let Some(out) = &out {
            assert_eq!(
                out.len(),
                self.item_layout.size(),
                "output buffer must be exactly the size of one item"
            );
        }

        let (slot, references) = self.resolve(handle)?;

        // SAFETY: Every slot in the stable array holds an initialized header and we hold an
        // exclusive reference to the table.
        let header = unsafe { slot.cast::<SlotHeader>().as_mut() };

        if let Some(remaining) = NonZero::new(references.get().wrapping_sub(1)) {
            header.state = SlotState::Alive {
                references: remaining,
            };

            return Some(remaining.get());
        }

        let item = self.item(slot);

        if let Some(out) = out {
            // SAFETY: The item memory is valid for reads of its size and the buffer is exactly
            // that long. The two cannot overlap because we hold `out` as a unique borrow.
            unsafe {
                item.copy_to_nonoverlapping(
                    NonNull::from(&mut *out).cast::<u8>(),
                    self.item_layout.size(),
                );
            }
        }

        if cfg!(debug_assertions) {
            // SAFETY: The item memory is in bounds of the slot and nothing may use it any more.
            unsafe {
                item.write_bytes(0, self.item_layout.size());
            }
        }

        header.generation = next_generation(header.generation);
        header.state = SlotState::Free {
            next_free: self.first_free,
        };

        self.first_free = Some(slot_index(handle).expect("resolved handles have a valid index"));

        self.len = self
            .len
            .checked_sub(1)
            .expect("a live item was found so len must be non-zero");

        Some(0)
    }

    /// Adds a reference to the item, returning the (unchanged) handle and the item memory, or
    /// `None` if the handle is stale.
    ///
    /// The item stays alive until [`remove()`][Self::remove] has been called once for the
    /// original reference and once for every shared one.
    ///
    /// # Panics
    ///
    /// Panics if the reference count would overflow `u32`.
    pub fn make_shared(&mut self, handle: Handle) -> Option<(Handle, NonNull<u8>)> {
        let (slot, references) = self.resolve(handle)?;

        let references = references
            .checked_add(1)
            .expect("reference count overflow in handle table");

        // SAFETY: Every slot in the stable array holds an initialized header and we hold an
        // exclusive reference to the table.
        unsafe { slot.cast::<SlotHeader>().as_mut() }.state = SlotState::Alive { references };

        Some((handle, self.item(slot)))
    }

    /// Returns a handle to an item that nobody else references, or `None` if the handle is stale.
    ///
    /// If the handle holds the only reference, the same handle and memory are returned. Otherwise
    /// the item bytes are copied into a new item with one reference, the reference held through
    /// `handle` is dropped from the original item and the new item is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use stable_memory::HandleTable;
    ///
    /// let mut table = HandleTable::builder().layout_of::<u32>().build();
    ///
    /// let (original, ptr) = table.insert();
    /// // SAFETY: The memory is sized and aligned for a u32.
    /// unsafe { ptr.cast::<u32>().write(7) };
    ///
    /// let (shared, _) = table.make_shared(original).unwrap();
    /// let (unique, unique_ptr) = table.make_unique(shared).unwrap();
    ///
    /// assert_ne!(unique, original);
    /// assert_eq!(table.references(original), Some(1));
    /// // SAFETY: The memory is sized and aligned for a u32 and was copied from the original.
    /// assert_eq!(unsafe { unique_ptr.cast::<u32>().read() }, 7);
    /// ```
    pub fn make_unique(&mut self, handle: Handle) -> Option<(Handle, NonNull<u8>)> {
        let (slot, references) = self.resolve(handle)?;

        if references.get() == 1 {
            return Some((handle, self.item(slot)));
        }

        // The original slot keeps its address while the table grows.
        let source = self.item(slot);
        let (unique, target) = self.insert();

        // SAFETY: Both are distinct live items of the same size.
        unsafe {
            source.copy_to_nonoverlapping(target, self.item_layout.size());
        }

        let remaining = self.remove(handle, None);
        debug_assert!(matches!(remaining, Some(remaining) if remaining > 0));

        Some((unique, target))
    }

    /// Iterates over the live items in slot order, yielding each handle with its item memory.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, NonNull<u8>)> + '_ {
        self.slots.iter().filter_map(move |slot| {
            // SAFETY: Every slot in the stable array holds an initialized header.
            let header = unsafe { slot.ptr().cast::<SlotHeader>().as_ref() };

            let SlotState::Alive { .. } = header.state else {
                return None;
            };

            #[expect(
                clippy::cast_possible_truncation,
                reason = "slot indexes are checked to fit in u32 on insert"
            )]
            let index = handle_index(slot.index() as u32);

            Some((
                Handle::from_raw_parts(index, header.generation),
                self.item(slot.ptr()),
            ))
        })
    }

    /// Returns the slot and reference count of the live item the handle refers to.
    fn resolve(&self, handle: Handle) -> Option<(NonNull<u8>, NonZero<u32>)> {
        let slot = self.slots.at_safe(slot_index(handle)? as usize)?;

        // SAFETY: Every slot in the stable array holds an initialized header.
        let header = unsafe { slot.cast::<SlotHeader>().as_ref() };

        if header.generation != handle.generation() {
            return None;
        }

        match header.state {
            SlotState::Alive { references } => Some((slot, references)),
            SlotState::Free { .. } => None,
        }
    }

    fn slot(&self, slot_index: u32) -> NonNull<u8> {
        self.slots.at(slot_index as usize)
    }

    fn item(&self, slot: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: The item offset was calculated from the slot layout and is in bounds.
        unsafe { slot.byte_add(self.item_offset) }
    }

    /// The handle index of the first slot in the free chain.
    #[cfg(test)]
    pub(crate) fn first_free_index(&self) -> Option<u32> {
        self.first_free.map(handle_index)
    }
}

/// Converts a 0-based slot index into a 1-based handle index.
fn handle_index(slot_index: u32) -> u32 {
    // Cannot overflow because slot indexes are kept below u32::MAX.
    slot_index.wrapping_add(1)
}

/// Converts the 1-based handle index into a 0-based slot index. `None` for the null handle.
fn slot_index(handle: Handle) -> Option<u32> {
    handle.index().checked_sub(1)
}

/// Generations wrap around but skip zero, which no issued handle ever carries.
fn next_generation(generation: u32) -> u32 {
    generation.checked_add(1).unwrap_or(FIRST_GENERATION)
}

impl<A: Allocator> Drop for HandleTable<A> {
    fn drop(&mut self) {
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropItems) {
            assert!(
                self.is_empty(),
                "dropped a non-empty HandleTable with {} items - this is forbidden by DropPolicy::MustNotDropItems",
                self.len
            );
        }
    }
}

impl<A: Allocator> fmt::Debug for HandleTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("item_layout", &self.item_layout)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("first_free", &self.first_free)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}
