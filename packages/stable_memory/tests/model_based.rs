//! Model-based property tests for the `stable_memory` containers.
//!
//! Each test drives a container and a simple standard library model with the same random
//! operation sequence and checks that they agree after every step.
#![allow(
    missing_docs,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "No need for API documentation or overflow pedantry in test code"
)]

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use proptest::sample::Index;
use stable_memory::{Handle, HandleTable, HashIndex, StableArray};

#[derive(Clone, Debug)]
enum IndexOp {
    Upsert(u64, u64),
    Remove(u64),
    Find(u64),
    Reserve(u8),
}

prop_compose! {
    // Small key space so that removals and re-insertions hit the same probe chains, including
    // the hashes that collide with the empty and gravestone markers.
    fn arb_index_ops()(ops in proptest::collection::vec(
        prop_oneof![
            4 => (0..48_u64, any::<u64>()).prop_map(|(k, v)| IndexOp::Upsert(k, v)),
            3 => (0..48_u64).prop_map(IndexOp::Remove),
            2 => (0..48_u64).prop_map(IndexOp::Find),
            1 => any::<u8>().prop_map(IndexOp::Reserve),
        ], 1..300)) -> Vec<IndexOp> { ops }
}

#[derive(Clone, Debug)]
enum TableOp {
    Insert(u64),
    Remove(Index),
    Share(Index),
    MakeUnique(Index),
    Get(Index),
}

prop_compose! {
    fn arb_table_ops()(ops in proptest::collection::vec(
        prop_oneof![
            4 => any::<u64>().prop_map(TableOp::Insert),
            3 => any::<Index>().prop_map(TableOp::Remove),
            2 => any::<Index>().prop_map(TableOp::Share),
            1 => any::<Index>().prop_map(TableOp::MakeUnique),
            2 => any::<Index>().prop_map(TableOp::Get),
        ], 1..300)) -> Vec<TableOp> { ops }
}

/// Hashes 0 and 1 collide with the index's empty and gravestone markers and are stored as 2 and 3,
/// so the index treats them as the same keys as 2 and 3.
fn stored_hash(key: u64) -> u64 {
    if key < 2 { key + 2 } else { key }
}

fn read_u64(table: &HandleTable, handle: Handle) -> Option<u64> {
    table.get(handle).map(|ptr| {
        // SAFETY: The table stores u64 items.
        unsafe { ptr.cast::<u64>().read() }
    })
}

proptest! {
    #[test]
    fn hash_index_matches_hash_map(ops in arb_index_ops()) {
        let mut index = HashIndex::<u64>::new();
        let mut model: HashMap<u64, u64> = HashMap::new();

        for op in ops {
            match op {
                IndexOp::Upsert(key, value) => {
                    if let Some(slot) = index.find(key) {
                        index.set_value(slot, value);
                    } else {
                        let slot = index.insert(key, value);
                        prop_assert_eq!(index.find(key), Some(slot));

                        // Load factor stays below one half after every insert.
                        prop_assert!(index.len() * 2 < index.capacity());
                    }
                    model.insert(stored_hash(key), value);
                }
                IndexOp::Remove(key) => {
                    match (index.find(key), model.remove(&stored_hash(key))) {
                        (Some(slot), Some(expected)) => {
                            prop_assert_eq!(index.value(slot), expected);
                            index.remove(slot);
                        }
                        (None, None) => {}
                        (found, expected) => {
                            prop_assert!(false, "index found {:?} but model had {:?}", found, expected);
                        }
                    }
                }
                IndexOp::Find(key) => {
                    let found = index.find(key).map(|slot| index.value(slot));
                    prop_assert_eq!(found, model.get(&stored_hash(key)).copied());

                    // Never more than one live entry per key.
                    if let Some(slot) = index.find(key) {
                        prop_assert_eq!(index.find_next(key, slot), None);
                    }
                }
                IndexOp::Reserve(size) => {
                    index.reserve(usize::from(size));
                    prop_assert!(index.capacity() > usize::from(size) * 2 || size == 0);
                }
            }

            prop_assert_eq!(index.len(), model.len());
        }

        let mut live: Vec<_> = index.iter().map(|(_, entry)| entry.value()).collect();
        let mut expected: Vec<_> = model.values().copied().collect();
        live.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(live, expected);
    }

    #[test]
    fn handle_table_matches_shadow_map(ops in arb_table_ops()) {
        let mut table = HandleTable::builder().layout_of::<u64>().build();

        // Every handle ever issued, live or stale.
        let mut issued: Vec<Handle> = Vec::new();
        // Live handles with their reference count and stored value.
        let mut model: HashMap<Handle, (u32, u64)> = HashMap::new();

        for op in ops {
            match op {
                TableOp::Insert(value) => {
                    let (handle, ptr) = table.insert();

                    // SAFETY: The table stores u64 items.
                    unsafe {
                        prop_assert_eq!(ptr.cast::<u64>().read(), 0);
                        ptr.cast::<u64>().write(value);
                    }

                    prop_assert_eq!(table.get(handle), Some(ptr));
                    prop_assert!(model.insert(handle, (1, value)).is_none());
                    issued.push(handle);
                }
                TableOp::Remove(index) if !issued.is_empty() => {
                    let handle = *index.get(&issued);
                    let remaining = table.remove(handle, None);

                    match model.get_mut(&handle) {
                        Some((references, _)) => {
                            *references -= 1;
                            prop_assert_eq!(remaining, Some(*references));

                            if *references == 0 {
                                model.remove(&handle);
                            }
                        }
                        None => prop_assert_eq!(remaining, None),
                    }
                }
                TableOp::Share(index) if !issued.is_empty() => {
                    let handle = *index.get(&issued);
                    let shared = table.make_shared(handle);

                    match model.get_mut(&handle) {
                        Some((references, _)) => {
                            *references += 1;
                            prop_assert_eq!(shared.map(|(h, _)| h), Some(handle));
                        }
                        None => prop_assert!(shared.is_none()),
                    }
                }
                TableOp::MakeUnique(index) if !issued.is_empty() => {
                    let handle = *index.get(&issued);
                    let unique = table.make_unique(handle);

                    match model.get(&handle).copied() {
                        Some((1, _)) => {
                            prop_assert_eq!(unique.map(|(h, _)| h), Some(handle));
                        }
                        Some((references, value)) => {
                            let (new_handle, _) = unique.expect("live handle must resolve");
                            prop_assert_ne!(new_handle, handle);

                            model.insert(handle, (references - 1, value));
                            prop_assert!(model.insert(new_handle, (1, value)).is_none());
                            issued.push(new_handle);
                        }
                        None => prop_assert!(unique.is_none()),
                    }
                }
                TableOp::Get(index) if !issued.is_empty() => {
                    let handle = *index.get(&issued);

                    prop_assert_eq!(read_u64(&table, handle), model.get(&handle).map(|(_, v)| *v));
                    prop_assert_eq!(table.references(handle), model.get(&handle).map(|(r, _)| *r));
                }
                _ => {}
            }

            prop_assert_eq!(table.len(), model.len());
        }

        let live: BTreeSet<_> = table.iter().map(|(handle, _)| handle).collect();
        let expected: BTreeSet<_> = model.keys().copied().collect();
        prop_assert_eq!(live, expected);
    }

    #[test]
    fn stable_array_reuses_and_keeps_addresses(
        removals in proptest::collection::vec(any::<Index>(), 0..200),
        count in 1..400_usize,
    ) {
        let mut array = StableArray::builder().layout_of::<u32>().build();

        let slots: Vec<_> = (0..count).map(|_| array.insert()).collect();
        let mut live: BTreeSet<usize> = slots.iter().map(|slot| slot.index()).collect();

        for removal in removals {
            let slot = *removal.get(&slots);
            prop_assert_eq!(array.remove(slot.index()), live.remove(&slot.index()));
        }

        for slot in &slots {
            let expected = live.contains(&slot.index()).then_some(slot.ptr());
            prop_assert_eq!(array.at_safe(slot.index()), expected);
        }

        // Freed slots are reused before the array grows.
        let capacity = array.capacity();
        let vacated = count - live.len();
        for _ in 0..vacated {
            let slot = array.insert();
            prop_assert!(slot.index() < count);
            prop_assert!(live.insert(slot.index()));
        }
        prop_assert_eq!(array.capacity(), capacity);
        prop_assert_eq!(array.len(), count);
    }
}
