use std::alloc::Layout;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::ptr::NonNull;
use std::slice;

use num_traits::{AsPrimitive, PrimInt, Unsigned, WrappingAdd};
use tracing::trace;

use crate::{Allocator, SystemAllocator};

mod sealed {
    #[expect(
        unnameable_types,
        reason = "seals the public trait so only u32 and u64 can implement it"
    )]
    pub trait Sealed {}

    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// An unsigned integer width that a [`HashIndex`] can store hashes and values in.
///
/// Implemented for `u32` and `u64`.
pub trait HashWord:
    PrimInt + Unsigned + WrappingAdd + AsPrimitive<usize> + Hash + Debug + sealed::Sealed + 'static
{
}

impl HashWord for u32 {}
impl HashWord for u64 {}

/// One slot of a [`HashIndex`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct HashIndexEntry<W> {
    hash: W,
    value: W,
}

impl<W: HashWord> HashIndexEntry<W> {
    /// The stored (escaped) hash. Real hashes are never equal to the empty or gravestone markers.
    #[must_use]
    #[inline]
    pub fn hash(&self) -> W {
        self.hash
    }

    /// The stored value.
    #[must_use]
    #[inline]
    pub fn value(&self) -> W {
        self.value
    }

    fn is_alive(&self) -> bool {
        self.hash > gravestone::<W>()
    }
}

/// Smallest capacity allocated by a growing index.
const MIN_CAPACITY: usize = 16;

fn empty<W: HashWord>() -> W {
    W::zero()
}

fn gravestone<W: HashWord>() -> W {
    W::one()
}

/// Moves hashes that collide with the empty or gravestone markers out of their way.
fn escape<W: HashWord>(hash: W) -> W {
    if hash > gravestone::<W>() {
        hash
    } else {
        hash.wrapping_add(&W::one()).wrapping_add(&W::one())
    }
}

/// Maps integer hashes to integer values using linear probing.
///
/// The index does not know or care what the hashes were computed from. Several entries may share
/// the same hash; [`find()`][1] returns the first and [`find_next()`][2] walks the rest, so callers
/// resolve collisions against their own keys.
///
/// Slots are addressed by a plain `usize` position which stays valid until the next
/// [`insert()`][3], [`rehash()`][4] or [`reserve()`][5].
///
/// The capacity is always zero or a power of two and the table is kept at most half full of live
/// entries, doubling before any insert that would break that rule.
///
/// # Examples
///
/// ```
/// use stable_memory::HashIndex;
///
/// let mut index = HashIndex::<u64>::new();
///
/// let slot = index.insert(5, 100);
/// assert_eq!(index.find(5), Some(slot));
/// assert_eq!(index.value(slot), 100);
///
/// index.remove(slot);
/// assert_eq!(index.find(5), None);
/// ```
///
/// [1]: Self::find
/// [2]: Self::find_next
/// [3]: Self::insert
/// [4]: Self::rehash
/// [5]: Self::reserve
pub struct HashIndex<W: HashWord, A: Allocator = SystemAllocator> {
    entries: NonNull<HashIndexEntry<W>>,

    /// Always zero or a power of two.
    capacity: usize,

    /// Number of live entries.
    len: usize,

    /// Number of slots holding the gravestone marker. These are not live but still extend probe
    /// chains, so they count towards keeping at least one empty slot available.
    gravestones: usize,

    allocator: A,
}

impl<W: HashWord> HashIndex<W> {
    /// Creates an empty index backed by the system allocator. Does not allocate.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(SystemAllocator::system())
    }
}

impl<W: HashWord> Default for HashIndex<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: HashWord, A: Allocator> HashIndex<W, A> {
    /// Creates an empty index that obtains its storage from `allocator`. Does not allocate.
    #[must_use]
    pub fn with_allocator(allocator: A) -> Self {
        Self {
            entries: NonNull::dangling(),
            capacity: 0,
            len: 0,
            gravestones: 0,
            allocator,
        }
    }

    /// Number of live entries.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no live entries.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots in the backing array. Zero or a power of two.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn entries(&self) -> &[HashIndexEntry<W>] {
        // SAFETY: `entries` is either dangling with capacity 0 or points to our allocation of
        // `capacity` initialized entries.
        unsafe { slice::from_raw_parts(self.entries.as_ptr(), self.capacity) }
    }

    fn entries_mut(&mut self) -> &mut [HashIndexEntry<W>] {
        // SAFETY: See entries(); we hold an exclusive reference to the index.
        unsafe { slice::from_raw_parts_mut(self.entries.as_ptr(), self.capacity) }
    }

    fn mask(&self) -> usize {
        debug_assert!(self.capacity.is_power_of_two());

        // Cannot underflow because callers only probe a non-empty table.
        self.capacity.wrapping_sub(1)
    }

    /// Walks the probe sequence of `escaped` starting at `start`, returning the first slot whose
    /// hash equals `escaped`. Stops at the first empty slot.
    fn probe(&self, escaped: W, start: usize) -> Option<usize> {
        let mask = self.mask();
        let entries = self.entries();

        let mut index = start;

        // The table always has at least one empty slot, so this terminates well before wrapping
        // around. The bound exists only to turn a corrupted table into a miss, not a hang.
        for _ in 0..self.capacity {
            let entry = entries
                .get(index)
                .expect("index is masked to capacity which is the slice length");

            if entry.hash == escaped {
                return Some(index);
            }

            if entry.hash == empty::<W>() {
                return None;
            }

            index = index.wrapping_add(1) & mask;
        }

        None
    }

    /// Returns the slot of the first live entry with `hash`, if any.
    #[must_use]
    pub fn find(&self, hash: W) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }

        let escaped = escape(hash);
        let start = escaped.as_() & self.mask();

        self.probe(escaped, start)
    }

    /// Returns the slot of the next live entry with `hash` after `previous`, which must be a slot
    /// returned by [`find()`][Self::find] or an earlier call to this method for the same hash.
    ///
    /// Used to enumerate every entry sharing a hash.
    #[must_use]
    pub fn find_next(&self, hash: W, previous: usize) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }

        assert!(
            previous < self.capacity,
            "find_next() slot {previous} out of bounds in hash index of capacity {}",
            self.capacity
        );

        let escaped = escape(hash);
        let start = previous.wrapping_add(1) & self.mask();

        self.probe(escaped, start)
    }

    /// Inserts an entry, returning its slot. Does not check for existing entries with the same
    /// hash.
    pub fn insert(&mut self, hash: W, value: W) -> usize {
        self.ensure_room_for_one_more();

        let escaped = escape(hash);
        let mask = self.mask();
        let mut index = escaped.as_() & mask;

        loop {
            let entry = self
                .entries_mut()
                .get_mut(index)
                .expect("index is masked to capacity which is the slice length");

            if !entry.is_alive() {
                let reused_gravestone = entry.hash == gravestone::<W>();

                *entry = HashIndexEntry {
                    hash: escaped,
                    value,
                };

                if reused_gravestone {
                    self.gravestones = self
                        .gravestones
                        .checked_sub(1)
                        .expect("gravestone count tracks gravestone slots");
                }

                // Cannot overflow because len < capacity.
                self.len = self.len.wrapping_add(1);

                return index;
            }

            index = index.wrapping_add(1) & mask;
        }
    }

    /// Removes the live entry at `slot`.
    ///
    /// The slot becomes a gravestone so that probe chains passing through it stay intact.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of bounds or does not hold a live entry.
    pub fn remove(&mut self, slot: usize) {
        let entry = self.live_entry_mut(slot);
        entry.hash = gravestone::<W>();

        self.len = self
            .len
            .checked_sub(1)
            .expect("removed a live entry so len must be non-zero");
        // Cannot overflow because gravestones < capacity.
        self.gravestones = self.gravestones.wrapping_add(1);
    }

    /// Returns the value of the live entry at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of bounds or does not hold a live entry.
    #[must_use]
    #[inline]
    pub fn value(&self, slot: usize) -> W {
        self.live_entry(slot).value
    }

    /// Returns the (escaped) hash of the live entry at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of bounds or does not hold a live entry.
    #[must_use]
    pub fn hash_at(&self, slot: usize) -> W {
        self.live_entry(slot).hash
    }

    /// Replaces the value of the live entry at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of bounds or does not hold a live entry.
    pub fn set_value(&mut self, slot: usize, value: W) {
        self.live_entry_mut(slot).value = value;
    }

    /// Returns the live entry at `slot`, if there is one.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&HashIndexEntry<W>> {
        self.entries().get(slot).filter(|entry| entry.is_alive())
    }

    fn live_entry(&self, slot: usize) -> &HashIndexEntry<W> {
        let capacity = self.capacity;

        self.get(slot).unwrap_or_else(|| {
            panic!("hash index slot {slot} is not a live entry (capacity {capacity})")
        })
    }

    fn live_entry_mut(&mut self, slot: usize) -> &mut HashIndexEntry<W> {
        let capacity = self.capacity;

        self.entries_mut()
            .get_mut(slot)
            .filter(|entry| entry.is_alive())
            .unwrap_or_else(|| {
                panic!("hash index slot {slot} is not a live entry (capacity {capacity})")
            })
    }

    /// Iterates over the live entries and their slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &HashIndexEntry<W>)> {
        self.entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_alive())
    }

    /// Removes all entries, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.entries_mut().fill(HashIndexEntry {
            hash: empty::<W>(),
            value: W::zero(),
        });

        self.len = 0;
        self.gravestones = 0;
    }

    /// Ensures that `to_size` live entries fit without any further rehash.
    pub fn reserve(&mut self, to_size: usize) {
        let required = required_capacity(to_size);

        if required > self.capacity {
            self.rehash(required);
        }
    }

    /// Moves every live entry into a fresh backing array of at least `to_capacity` slots (rounded
    /// up to a power of two, and never so small that the load limit would be exceeded).
    ///
    /// Rehashing to the current capacity discards all gravestones. Rehashing an empty index to
    /// zero releases the backing array.
    pub fn rehash(&mut self, to_capacity: usize) {
        let to_capacity = if to_capacity == 0 && self.len == 0 {
            0
        } else {
            to_capacity
                .checked_next_power_of_two()
                .expect("hash index capacity overflow")
                .max(required_capacity(self.len))
        };

        assert!(
            to_capacity == 0 || to_capacity.is_power_of_two(),
            "hash index capacity {to_capacity} is not a power of two"
        );

        trace!(
            from = self.capacity,
            to = to_capacity,
            len = self.len,
            gravestones = self.gravestones,
            "rehashing hash index"
        );

        let old_entries = self.entries;
        let old_capacity = self.capacity;

        self.entries = if to_capacity == 0 {
            NonNull::dangling()
        } else {
            self.allocator
                .allocate_zeroed(Self::layout(to_capacity))
                .cast()
        };
        self.capacity = to_capacity;
        self.len = 0;
        self.gravestones = 0;

        if old_capacity == 0 {
            return;
        }

        // SAFETY: The old array is still allocated and initialized; nothing else refers to it.
        let old = unsafe { slice::from_raw_parts(old_entries.as_ptr(), old_capacity) };

        for entry in old.iter().filter(|entry| entry.is_alive()) {
            self.reinsert(*entry);
        }

        // SAFETY: We allocated the old array with exactly this layout and it is no longer used.
        unsafe {
            self.allocator
                .deallocate(old_entries.cast(), Self::layout(old_capacity));
        }
    }

    /// Places an already escaped entry during a rehash, without any growth checks.
    fn reinsert(&mut self, entry: HashIndexEntry<W>) {
        let mask = self.mask();
        let mut index = entry.hash.as_() & mask;

        loop {
            let slot = self
                .entries_mut()
                .get_mut(index)
                .expect("index is masked to capacity which is the slice length");

            if slot.hash == empty::<W>() {
                *slot = entry;
                self.len = self.len.wrapping_add(1);
                return;
            }

            index = index.wrapping_add(1) & mask;
        }
    }

    fn ensure_room_for_one_more(&mut self) {
        // Cannot overflow because len < capacity <= isize::MAX.
        let new_len = self.len.wrapping_add(1);

        if new_len.saturating_mul(2) >= self.capacity {
            let doubled = self.capacity.saturating_mul(2).max(MIN_CAPACITY);
            self.rehash(doubled);
            return;
        }

        // Too many gravestones would leave no empty slot to end a probe on. Clean up in place.
        let occupied = new_len.wrapping_add(self.gravestones);
        if occupied.saturating_mul(4) >= self.capacity.saturating_mul(3) {
            self.rehash(self.capacity);
        }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::array::<HashIndexEntry<W>>(capacity).expect("hash index capacity overflow")
    }
}

/// Smallest power-of-two capacity that keeps `len` entries under the load limit.
fn required_capacity(len: usize) -> usize {
    if len == 0 {
        return 0;
    }

    len.checked_mul(2)
        .and_then(|doubled| doubled.checked_add(1))
        .and_then(usize::checked_next_power_of_two)
        .expect("hash index capacity overflow")
        .max(MIN_CAPACITY)
}

impl<W: HashWord, A: Allocator> Drop for HashIndex<W, A> {
    fn drop(&mut self) {
        if self.capacity > 0 {
            // SAFETY: We allocated the array with exactly this layout and still own it.
            unsafe {
                self.allocator
                    .deallocate(self.entries.cast(), Self::layout(self.capacity));
            }
        }
    }
}

impl<W: HashWord, A: Allocator> Debug for HashIndex<W, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashIndex")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("gravestones", &self.gravestones)
            .finish_non_exhaustive()
    }
}
