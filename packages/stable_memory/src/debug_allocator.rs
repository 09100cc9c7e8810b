use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

use tracing::{error, info, warn};

use crate::alloc_buf::AllocBuf;
use crate::{Allocator, DebugAllocError, DebugAllocatorBuilder, HashIndex, SystemAllocator};

/// Byte written over memory released through a [`DebugAllocator`] configured to poison it.
pub(crate) const POISON_BYTE: u8 = 0xDD;

/// Reacts to a contract violation detected by a [`DebugAllocator`].
///
/// If the handler returns instead of panicking, the offending call is ignored: no memory is
/// touched and the call reports failure by returning `None`.
pub type DebugAllocPanicHandler = fn(&DebugAllocError);

/// An [`Allocator`] decorator that tracks every live allocation made through it and validates
/// every resize and release against its records.
///
/// Tracking uses a [`HashIndex`] keyed by address pointing into a flat array of
/// [`AllocationRecord`]s, both of which take their own storage from the parent allocator. The most
/// recent releases are kept in a bounded history for post-mortem inspection.
///
/// Releasing or resizing memory that is not a live allocation of this allocator, or doing so with
/// a size or alignment different from the recorded one, is reported to the panic handler (see
/// [`DebugAllocatorBuilder::panic_handler()`]).
///
/// # Examples
///
/// ```
/// use stable_memory::{DebugAllocator, HandleTable, SystemAllocator};
///
/// let debug = DebugAllocator::new(SystemAllocator::system());
///
/// {
///     let mut table = HandleTable::builder()
///         .layout_of::<u64>()
///         .allocator(&debug)
///         .build();
///
///     _ = table.insert();
///     assert!(debug.live_count() > 0);
/// }
///
/// // Dropping the table released everything it allocated.
/// assert_eq!(debug.live_count(), 0);
/// assert!(debug.stats().peak_live_bytes() > 0);
/// ```
pub struct DebugAllocator<A: Allocator + Clone = SystemAllocator> {
    parent: A,

    state: RefCell<DebugState<A>>,

    poison_freed: bool,

    panic_handler: DebugAllocPanicHandler,
}

/// One allocation as seen by a [`DebugAllocator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocationRecord {
    address: usize,
    size: usize,
    align: usize,
    serial: u64,
}

impl AllocationRecord {
    /// Address of the allocated memory.
    #[must_use]
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Size in bytes.
    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes.
    #[must_use]
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Sequence number of the allocation. Allocations made earlier have lower serial numbers and
    /// resizing keeps the serial number.
    #[must_use]
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// Running totals kept by a [`DebugAllocator`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationStats {
    live_bytes: usize,
    peak_live_bytes: usize,
    allocations: u64,
    deallocations: u64,
    resizes: u64,
}

impl AllocationStats {
    /// Bytes currently allocated.
    #[must_use]
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// The highest value [`live_bytes()`][Self::live_bytes] has ever had.
    #[must_use]
    #[inline]
    pub fn peak_live_bytes(&self) -> usize {
        self.peak_live_bytes
    }

    /// Number of successful fresh allocations.
    #[must_use]
    #[inline]
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Number of releases.
    #[must_use]
    #[inline]
    pub fn deallocations(&self) -> u64 {
        self.deallocations
    }

    /// Number of successful resizes.
    #[must_use]
    #[inline]
    pub fn resizes(&self) -> u64 {
        self.resizes
    }

    fn add_live(&mut self, bytes: usize) {
        self.live_bytes = self
            .live_bytes
            .checked_add(bytes)
            .expect("live bytes cannot exceed the address space");
        self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
    }

    fn remove_live(&mut self, bytes: usize) {
        self.live_bytes = self
            .live_bytes
            .checked_sub(bytes)
            .expect("only recorded allocations are removed");
    }
}

struct DebugState<A: Allocator> {
    /// Address to position in `records`.
    by_address: HashIndex<u64, A>,

    records: AllocBuf<AllocationRecord, A>,

    /// Circular buffer of the most recently released allocations.
    dead: AllocBuf<AllocationRecord, A>,

    /// Maximum length of `dead`.
    dead_history: usize,

    /// Where the next released allocation is written once `dead` is full. This is also the
    /// position of the oldest entry.
    dead_cursor: usize,

    next_serial: u64,

    stats: AllocationStats,
}

impl<A: Allocator> DebugState<A> {
    fn slot_of(&self, address: usize) -> Option<usize> {
        self.by_address.find(address as u64)
    }

    fn position_at(&self, slot: usize) -> usize {
        usize::try_from(self.by_address.value(slot)).expect("positions are stored from a usize")
    }

    fn validate(&self, address: usize, size: usize, align: usize) -> Result<(), DebugAllocError> {
        let slot = self
            .slot_of(address)
            .ok_or(DebugAllocError::UnknownPointer { address })?;

        let record = self
            .records
            .as_slice()
            .get(self.position_at(slot))
            .expect("index positions always point into the record array");

        if record.size != size {
            return Err(DebugAllocError::SizeMismatch {
                address,
                recorded: record.size,
                given: size,
            });
        }

        if record.align != align {
            return Err(DebugAllocError::AlignMismatch {
                address,
                recorded: record.align,
                given: align,
            });
        }

        Ok(())
    }

    fn record(&mut self, address: usize, size: usize, align: usize) {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);

        self.insert_record(AllocationRecord {
            address,
            size,
            align,
            serial,
        });

        self.stats.allocations = self.stats.allocations.wrapping_add(1);
        self.stats.add_live(size);
    }

    fn insert_record(&mut self, record: AllocationRecord) {
        self.by_address
            .insert(record.address as u64, self.records.len() as u64);
        self.records.push(record);
    }

    /// Removes and returns the record of a validated allocation.
    fn take_record(&mut self, address: usize) -> AllocationRecord {
        let slot = self
            .slot_of(address)
            .expect("allocation was validated before being taken");
        let position = self.position_at(slot);

        self.by_address.remove(slot);
        let record = self.records.swap_remove(position);

        // The last record moved into the hole, so its index entry needs the new position.
        if let Some(moved) = self.records.as_slice().get(position).copied() {
            let moved_slot = self
                .slot_of(moved.address)
                .expect("every record has an index entry");
            self.by_address.set_value(moved_slot, position as u64);
        }

        record
    }

    fn release(&mut self, address: usize) {
        let record = self.take_record(address);

        self.stats.deallocations = self.stats.deallocations.wrapping_add(1);
        self.stats.remove_live(record.size);

        self.bury(record);
    }

    fn resized(&mut self, old_address: usize, new_address: usize, new_size: usize) {
        let old = self.take_record(old_address);

        self.insert_record(AllocationRecord {
            address: new_address,
            size: new_size,
            ..old
        });

        self.stats.resizes = self.stats.resizes.wrapping_add(1);
        self.stats.remove_live(old.size);
        self.stats.add_live(new_size);
    }

    fn bury(&mut self, record: AllocationRecord) {
        if self.dead_history == 0 {
            return;
        }

        if self.dead.len() < self.dead_history {
            self.dead.push(record);
            return;
        }

        *self
            .dead
            .as_mut_slice()
            .get_mut(self.dead_cursor)
            .expect("cursor stays below the history length") = record;

        self.dead_cursor = self.dead_cursor.wrapping_add(1);
        if self.dead_cursor == self.dead_history {
            self.dead_cursor = 0;
        }
    }

    fn dead_oldest_first(&self) -> Vec<AllocationRecord> {
        let dead = self.dead.as_slice();
        let (newer, older) = dead.split_at(self.dead_cursor);

        older.iter().chain(newer).copied().collect()
    }
}

impl<A: Allocator + Clone> DebugAllocator<A> {
    /// Creates a debug allocator over `parent` with the default settings.
    #[must_use]
    pub fn new(parent: A) -> Self {
        Self::builder(parent).build()
    }

    /// Starts configuring a debug allocator over `parent`.
    #[inline]
    pub fn builder(parent: A) -> DebugAllocatorBuilder<A> {
        DebugAllocatorBuilder::new(parent)
    }

    pub(crate) fn new_inner(
        parent: A,
        dead_history: usize,
        poison_freed: bool,
        panic_handler: DebugAllocPanicHandler,
    ) -> Self {
        let state = DebugState {
            by_address: HashIndex::with_allocator(parent.clone()),
            records: AllocBuf::new(parent.clone()),
            dead: AllocBuf::new(parent.clone()),
            dead_history,
            dead_cursor: 0,
            next_serial: 0,
            stats: AllocationStats::default(),
        };

        Self {
            parent,
            state: RefCell::new(state),
            poison_freed,
            panic_handler,
        }
    }

    /// Number of live allocations.
    #[must_use]
    #[inline]
    pub fn live_count(&self) -> usize {
        self.state.borrow().records.len()
    }

    /// Running totals since the allocator was created.
    #[must_use]
    pub fn stats(&self) -> AllocationStats {
        self.state.borrow().stats
    }

    /// The live allocations, oldest first.
    #[must_use]
    pub fn active_allocations(&self) -> Vec<AllocationRecord> {
        let mut records = self.state.borrow().records.as_slice().to_vec();
        records.sort_unstable_by_key(AllocationRecord::serial);
        records
    }

    /// The most recently released allocations, oldest first.
    #[must_use]
    pub fn dead_allocations(&self) -> Vec<AllocationRecord> {
        self.state.borrow().dead_oldest_first()
    }

    /// Logs every live allocation at info level.
    pub fn print_active_allocations(&self) {
        let records = self.active_allocations();
        let stats = self.stats();

        info!(
            count = records.len(),
            live_bytes = stats.live_bytes,
            peak_live_bytes = stats.peak_live_bytes,
            "active allocations"
        );

        for record in records {
            info!(
                serial = record.serial,
                address = format_args!("{:#x}", record.address),
                size = record.size,
                align = record.align,
                "active allocation"
            );
        }
    }

    /// Logs the release history at info level.
    pub fn print_dead_allocations(&self) {
        let records = self.dead_allocations();

        info!(count = records.len(), "recently released allocations");

        for record in records {
            info!(
                serial = record.serial,
                address = format_args!("{:#x}", record.address),
                size = record.size,
                align = record.align,
                "released allocation"
            );
        }
    }

    fn report(&self, violation: &DebugAllocError) {
        error!(%violation, "allocator contract violated");

        (self.panic_handler)(violation);
    }
}

impl<A: Allocator + Clone> Allocator for DebugAllocator<A> {
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        if let Some(ptr) = ptr {
            // The borrow ends here, so a handler that inspects the allocator does not conflict.
            let verdict = self.state.borrow().validate(ptr.addr().get(), old_size, align);

            if let Err(violation) = verdict {
                self.report(&violation);
                return None;
            }

            if new_size == 0 && self.poison_freed {
                // SAFETY: The memory was validated as a live allocation of `old_size` bytes.
                unsafe {
                    ptr.write_bytes(POISON_BYTE, old_size);
                }
            }
        }

        // SAFETY: Forwarding safety requirements to the caller. For existing memory, we validated
        // above that the size and alignment match what the parent handed out.
        let result = unsafe { self.parent.reallocate(ptr, old_size, new_size, align) };

        let mut state = self.state.borrow_mut();

        match (ptr, result) {
            (Some(old), _) if new_size == 0 => state.release(old.addr().get()),
            (Some(old), Some(new)) => state.resized(old.addr().get(), new.addr().get(), new_size),
            (None, Some(new)) => state.record(new.addr().get(), new_size, align),
            // Failed requests leave existing memory untouched and still owned by the caller.
            (_, None) => {}
        }

        result
    }
}

impl<A: Allocator + Clone> Drop for DebugAllocator<A> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if !state.records.is_empty() {
            warn!(
                count = state.records.len(),
                live_bytes = state.stats.live_bytes,
                "debug allocator dropped with live allocations"
            );
        }
    }
}

impl<A: Allocator + Clone + fmt::Debug> fmt::Debug for DebugAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugAllocator")
            .field("parent", &self.parent)
            .field("live_count", &self.live_count())
            .field("stats", &self.stats())
            .field("poison_freed", &self.poison_freed)
            .finish_non_exhaustive()
    }
}
