//! Allocator-aware memory primitives with stable addresses and stale-reference detection.
//!
//! This package provides the building blocks that higher level subsystems (resource caches,
//! entity storage, render command lists) store their data in. Every container takes an
//! [`Allocator`] at construction and never touches a global allocation function directly.
//!
//! * [`Allocator`] - a single realloc-style memory capability, with a replaceable process-wide
//!   [out-of-memory handler][set_out_of_memory_handler], a [`DebugAllocator`] decorator that
//!   validates every release and an [`AllocatorContext`] for passing default and scratch
//!   allocators around with scoped overrides.
//! * [`HashIndex`] - an open-addressing index from integer hashes to integer values, generic over
//!   `u32` and `u64` words.
//! * [`BlockArray`] - a growable sequence of equally sized memory blocks whose addresses never
//!   change.
//! * [`StableArray`] - fixed-size slots carved out of block array blocks, with O(1) insertion and
//!   removal driven by per-block liveness bitmasks.
//! * [`HandleTable`] - reference-counted items addressed by generation-checked [`Handle`]s that
//!   can be stored long-term and are rejected once their item is released.
//!
//! The containers are untyped: they are configured with a [`std::alloc::Layout`] and hand out
//! pointers to zeroed memory of that layout. What is stored in that memory is up to the caller.
//!
//! All types are single-threaded. Callers that share a container between threads must provide
//! their own synchronization.
//!
//! # Examples
//!
//! ```
//! use stable_memory::{DebugAllocator, Handle, HandleTable, SystemAllocator};
//!
//! let allocator = DebugAllocator::new(SystemAllocator::system());
//!
//! let mut meshes = HandleTable::builder()
//!     .layout_of::<[f32; 3]>()
//!     .allocator(&allocator)
//!     .build();
//!
//! let (mesh, ptr) = meshes.insert();
//!
//! // SAFETY: The memory is sized and aligned for [f32; 3] and nobody else accesses it.
//! unsafe {
//!     ptr.cast::<[f32; 3]>().write([1.0, 2.0, 3.0]);
//! }
//!
//! // Handles can be stored as plain integers and resolved later.
//! let stored = mesh.to_bits();
//! let resolved = meshes.get(Handle::from_bits(stored)).unwrap();
//!
//! // SAFETY: Same memory as above.
//! assert_eq!(unsafe { resolved.cast::<[f32; 3]>().read() }, [1.0, 2.0, 3.0]);
//!
//! meshes.remove(mesh, None);
//! assert!(meshes.get(mesh).is_none());
//! ```

mod alloc_buf;
mod allocator;
mod block_array;
mod context;
mod debug_allocator;
mod debug_allocator_builder;
mod drop_policy;
mod error;
mod handle;
mod handle_table;
mod handle_table_builder;
mod hash_index;
mod out_of_memory;
mod slot_mask;
mod stable_array;
mod stable_array_builder;

pub use allocator::{Allocator, GlobalAllocator, SystemAllocator};
pub use block_array::BlockArray;
pub use context::{AllocatorContext, ScopedAllocator};
pub use debug_allocator::{
    AllocationRecord, AllocationStats, DebugAllocPanicHandler, DebugAllocator,
};
pub use debug_allocator_builder::DebugAllocatorBuilder;
pub use drop_policy::DropPolicy;
pub use error::DebugAllocError;
pub use handle::Handle;
pub use handle_table::HandleTable;
pub use handle_table_builder::HandleTableBuilder;
pub use hash_index::{HashIndex, HashIndexEntry, HashWord};
pub use out_of_memory::{OutOfMemoryHandler, OutOfMemoryHandlerGuard, set_out_of_memory_handler};
pub use slot_mask::SlotMask;
pub use stable_array::{StableArray, StableSlot};
pub use stable_array_builder::StableArrayBuilder;
