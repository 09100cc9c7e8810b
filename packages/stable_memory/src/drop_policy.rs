/// Determines what happens when a container is dropped while it still has live items.
///
/// Containers in this package hold raw, untyped memory and never run item destructors, so the
/// only question is whether abandoning live items is acceptable. By default it is.
///
/// # Examples
///
/// ```
/// use stable_memory::{DropPolicy, HandleTable};
///
/// // Every handle must be removed before the table goes away.
/// let table = HandleTable::builder()
///     .layout_of::<u64>()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The container releases its memory regardless of live items. This is the default.
    #[default]
    MayDropItems,

    /// The container will panic if it still contains live items when it is dropped.
    ///
    /// Useful when items reference resources that must be released explicitly (for example
    /// through the out buffer of [`HandleTable::remove()`][crate::HandleTable::remove]), turning
    /// a forgotten removal into a loud failure instead of a silent leak.
    MustNotDropItems,
}
