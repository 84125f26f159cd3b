//! End-to-end interception through a real global allocator.
//!
//! Everything lives in one `#[test]` because the watch is process-global and
//! the default harness runs tests concurrently.

use std::alloc::System;

use testudo_leakwatch::{dump_leaks, simple_watch, unregister, MemoryEntry, WatchAllocator};
use tracing::Level;

#[global_allocator]
static ALLOC: WatchAllocator<System> = WatchAllocator::system();

// Deliberately odd sizes so harness-internal allocations cannot be mistaken
// for the ones made below.
const BALANCED: usize = 1033;
const LEAKED: usize = 4111;
const AFTER_DISARM: usize = 8221;

fn find_by_size(entries: &[MemoryEntry], size: usize) -> Option<MemoryEntry> {
    entries.iter().find(|entry| entry.size == size).cloned()
}

#[test]
fn watch_follows_the_allocation_lifecycle() {
    let (handle, table) = simple_watch();

    // Balanced allocation: tracked while live, gone once freed.
    let balanced = vec![0u8; BALANCED].into_boxed_slice();
    assert!(
        find_by_size(&table.entries(), BALANCED).is_some(),
        "live allocation should be tracked"
    );
    drop(balanced);
    assert!(
        find_by_size(&table.entries(), BALANCED).is_none(),
        "freed allocation should leave the table"
    );

    // Leaked allocation: stays in the table with its origin trace.
    let leaked: &'static mut [u8] = Box::leak(vec![0u8; LEAKED].into_boxed_slice());
    assert_eq!(leaked.len(), LEAKED);
    let entry = find_by_size(&table.entries(), LEAKED).expect("leak should be tracked");
    assert!(
        !entry.origin.is_empty(),
        "origin trace should have at least one frame"
    );
    assert!(entry.last_realloc.is_none());
    assert!(table.leaked_bytes() >= LEAKED);

    // Growing a Vec rekeys the entry and records the reallocation site.
    let mut grown: Vec<u64> = Vec::with_capacity(5);
    grown.reserve_exact(257);
    let grown_bytes = grown.capacity() * size_of::<u64>();
    let entry = find_by_size(&table.entries(), grown_bytes)
        .expect("reallocated buffer should be tracked under its new size");
    assert!(
        entry.last_realloc.is_some(),
        "growth should record a reallocation trace"
    );
    assert!(!entry.origin.is_empty());
    drop(grown);
    assert!(find_by_size(&table.entries(), grown_bytes).is_none());

    // Reporting must not disturb the table.
    let before = table.len();
    dump_leaks(&table, Level::TRACE);
    assert_eq!(table.len(), before);

    assert!(unregister(handle));
    assert!(!unregister(handle), "second unregister is a no-op");

    // Disarmed: new allocations are invisible, the table stays readable.
    let unseen: &'static mut [u8] = Box::leak(vec![0u8; AFTER_DISARM].into_boxed_slice());
    assert_eq!(unseen.len(), AFTER_DISARM);
    assert!(find_by_size(&table.entries(), AFTER_DISARM).is_none());
    assert!(find_by_size(&table.entries(), LEAKED).is_some());
}
