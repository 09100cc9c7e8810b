//! Example of tracking container memory with `DebugAllocator`.
//!
//! This example demonstrates how to route the memory of several containers through a debug
//! allocator, inspect what is live and see what was released most recently.

use stable_memory::{AllocatorContext, DebugAllocator, HashIndex, StableArray, SystemAllocator};

fn main() {
    let system = SystemAllocator::system();
    let debug = DebugAllocator::builder(SystemAllocator::system())
        .dead_history(8)
        .poison_freed(true)
        .build();

    let mut context = AllocatorContext::new(&system);

    {
        // Everything built from the scratch allocator in this scope is tracked.
        let scoped = context.push_scratch(&debug);

        let mut particles = StableArray::builder()
            .layout_of::<[f32; 4]>()
            .allocator(scoped.scratch())
            .build();
        let mut lookup = HashIndex::<u32, _>::with_allocator(scoped.scratch());

        for id in 0..200_u32 {
            let slot = particles.insert();
            _ = lookup.insert(id, u32::try_from(slot.index()).expect("fewer than 2^32 items"));
        }

        println!(
            "{} live allocations holding {} bytes",
            debug.live_count(),
            debug.stats().live_bytes()
        );

        for record in debug.active_allocations() {
            println!(
                "  #{} at {:#x}: {} bytes, align {}",
                record.serial(),
                record.address(),
                record.size(),
                record.align()
            );
        }
    }

    println!(
        "After the scope: {} live allocations, peak was {} bytes",
        debug.live_count(),
        debug.stats().peak_live_bytes()
    );

    for record in debug.dead_allocations() {
        println!("  released #{}: {} bytes", record.serial(), record.size());
    }

    assert_eq!(debug.live_count(), 0);
}
