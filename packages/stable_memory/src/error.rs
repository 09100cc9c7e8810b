use thiserror::Error;

/// A contract violation detected by a [`DebugAllocator`][crate::DebugAllocator].
///
/// Violations are handed to the allocator's panic handler, which panics with this error's message
/// unless a custom handler is configured.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum DebugAllocError {
    /// Memory was resized or released through an allocator that did not hand it out, or that has
    /// already taken it back.
    #[error("pointer {address:#x} is not a live allocation of this allocator")]
    UnknownPointer {
        /// Address of the offending pointer.
        address: usize,
    },

    /// The size given when resizing or releasing memory is not the size it was allocated with.
    #[error(
        "allocation at {address:#x} has size {recorded} but the caller claims it has size {given}"
    )]
    SizeMismatch {
        /// Address of the allocation.
        address: usize,

        /// The size the memory was allocated with.
        recorded: usize,

        /// The size the caller passed.
        given: usize,
    },

    /// The alignment given when resizing or releasing memory is not the alignment it was
    /// allocated with.
    #[error(
        "allocation at {address:#x} has alignment {recorded} but the caller claims it has alignment {given}"
    )]
    AlignMismatch {
        /// Address of the allocation.
        address: usize,

        /// The alignment the memory was allocated with.
        recorded: usize,

        /// The alignment the caller passed.
        given: usize,
    },
}
