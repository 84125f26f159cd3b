use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use testudo_trace::{Backtrace, emit_at};
use tracing::Level;

use crate::{AllocEvent, WatchId};

/// One live allocation: where it was created and, if it has been resized
/// since, where it was last reallocated.
#[derive(Clone, Debug)]
pub struct MemoryEntry {
    pub ptr: usize,
    pub size: usize,
    pub origin: Backtrace,
    pub last_realloc: Option<Backtrace>,
}

/// Address-keyed table of allocations that have not been freed yet,
/// maintained by the observer [`simple_watch`] registers.
///
/// Clones share the underlying table, so the copy handed back by
/// [`simple_watch`] keeps working after the observer is unregistered.
#[derive(Clone, Default)]
pub struct LiveTable {
    entries: Arc<Mutex<HashMap<usize, MemoryEntry>>>,
}

impl LiveTable {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total bytes still live.
    pub fn leaked_bytes(&self) -> usize {
        self.entries.lock().values().map(|entry| entry.size).sum()
    }

    /// Snapshot of the live entries, ordered by address.
    pub fn entries(&self) -> Vec<MemoryEntry> {
        crate::unwatched(|| {
            let mut snapshot: Vec<MemoryEntry> = self.entries.lock().values().cloned().collect();
            snapshot.sort_by_key(|entry| entry.ptr);
            snapshot
        })
    }

    pub(crate) fn apply(&self, event: &AllocEvent) {
        let mut entries = self.entries.lock();
        match event {
            AllocEvent::Alloc { ptr, size, trace } => {
                entries.insert(
                    *ptr,
                    MemoryEntry {
                        ptr: *ptr,
                        size: *size,
                        origin: trace.clone(),
                        last_realloc: None,
                    },
                );
            }
            AllocEvent::Realloc {
                old_ptr,
                ptr,
                size,
                trace,
            } => {
                // A block we never saw allocated predates the watch. Resizing
                // does not put it in scope; leave it untracked.
                let Some(previous) = entries.remove(old_ptr) else {
                    return;
                };
                entries.insert(
                    *ptr,
                    MemoryEntry {
                        ptr: *ptr,
                        size: *size,
                        origin: previous.origin,
                        last_realloc: Some(trace.clone()),
                    },
                );
            }
            AllocEvent::Free { ptr, .. } => {
                entries.remove(ptr);
            }
        }
    }
}

/// Registers the built-in live-table observer. Returns the observer handle
/// and the table it maintains.
pub fn simple_watch() -> (WatchId, LiveTable) {
    let table = LiveTable::default();
    let sink = table.clone();
    let id = crate::register(move |event| sink.apply(event));
    (id, table)
}

/// Emits one record per live entry at `level`, followed by the backtrace of
/// the allocation and, when the block was resized, of the last reallocation.
///
/// Dispatch is suppressed for the duration, so the reporting itself cannot
/// feed entries back into a table that is still being watched.
pub fn dump_leaks(table: &LiveTable, level: Level) {
    crate::unwatched(|| {
        for entry in table.entries() {
            emit_at!(
                level,
                ptr = format_args!("{:#x}", entry.ptr),
                size = entry.size,
                "memory leak found"
            );
            emit_at!(level, "original allocator");
            entry.origin.dump_to_log(level);
            if let Some(last) = &entry.last_realloc {
                emit_at!(level, "last reallocator");
                last.dump_to_log(level);
            }
        }
    });
}
