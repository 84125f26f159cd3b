//! Heap allocation interception.
//!
//! [`WatchAllocator`] wraps any [`GlobalAlloc`](std::alloc::GlobalAlloc) and
//! reports every allocation, reallocation and free to a process-wide observer
//! registry. Interception is armed only while at least one observer is
//! registered; with the registry empty the wrapper forwards straight to the
//! inner allocator.
//!
//! The built-in observer, [`simple_watch`], maintains a [`LiveTable`] of
//! allocations that have not been freed yet. Snapshot the table at a point
//! where everything should have been released and anything still in it is a
//! leak, each entry carrying the backtrace of the allocation that created it.
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: WatchAllocator<System> = WatchAllocator::system();
//!
//! let (handle, table) = simple_watch();
//! exercise_code_under_test();
//! unregister(handle);
//! assert_eq!(table.leaked_bytes(), 0);
//! ```

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use testudo_trace::Backtrace;
use tracing::{debug, warn};

mod allocator;
mod table;

pub use allocator::WatchAllocator;
pub use table::{LiveTable, MemoryEntry, dump_leaks, simple_watch};

/// Frames between the intercepted call site and the capture point inside the
/// dispatcher: the allocator shim, `notify` and `dispatch` itself.
const EVENT_TRACE_SKIP: usize = 3;

/// Depth recorded for allocation-site backtraces. Allocation events are hot,
/// so this stays well below the capture default.
const EVENT_TRACE_DEPTH: usize = 64;

/// One intercepted heap operation, with the backtrace of its call site.
#[derive(Clone, Debug)]
pub enum AllocEvent {
    Alloc {
        ptr: usize,
        size: usize,
        trace: Backtrace,
    },
    Realloc {
        old_ptr: usize,
        ptr: usize,
        size: usize,
        trace: Backtrace,
    },
    Free {
        ptr: usize,
        trace: Backtrace,
    },
}

impl AllocEvent {
    /// Address of the block the event is about. For reallocations this is
    /// the new address.
    pub fn ptr(&self) -> usize {
        match self {
            AllocEvent::Alloc { ptr, .. }
            | AllocEvent::Realloc { ptr, .. }
            | AllocEvent::Free { ptr, .. } => *ptr,
        }
    }

    pub fn trace(&self) -> &Backtrace {
        match self {
            AllocEvent::Alloc { trace, .. }
            | AllocEvent::Realloc { trace, .. }
            | AllocEvent::Free { trace, .. } => trace,
        }
    }
}

/// An intercepted operation before the backtrace has been attached.
pub(crate) enum RawEvent {
    Alloc { ptr: usize, size: usize },
    Realloc { old_ptr: usize, ptr: usize, size: usize },
    Free { ptr: usize },
}

/// Handle identifying one registered observer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WatchId(u64);

type Observer = Arc<dyn Fn(&AllocEvent) + Send + Sync>;

/// Number of registered observers. Non-zero means interception is armed.
static ARMED: AtomicUsize = AtomicUsize::new(0);

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

fn observers() -> &'static Mutex<Vec<(WatchId, Observer)>> {
    static OBSERVERS: OnceLock<Mutex<Vec<(WatchId, Observer)>>> = OnceLock::new();
    OBSERVERS.get_or_init(|| Mutex::new(Vec::new()))
}

thread_local! {
    /// Set while this thread is inside `dispatch`. Allocations made by the
    /// dispatcher itself (backtrace buffers, observer bookkeeping) must not
    /// produce further events.
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Registers an allocation observer and returns its handle. The first
/// registration arms interception in [`WatchAllocator`].
pub fn register<F>(callback: F) -> WatchId
where
    F: Fn(&AllocEvent) + Send + Sync + 'static,
{
    let id = WatchId(NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed));
    unwatched(|| {
        if ARMED.load(Ordering::SeqCst) == 0 {
            debug!(handle = id.0, "arming allocation interception");
        }
        observers().lock().push((id, Arc::new(callback)));
    });
    ARMED.fetch_add(1, Ordering::SeqCst);
    id
}

/// Removes a previously registered observer. Returns `false` for a handle
/// that is not registered. Removing the last observer disarms interception.
pub fn unregister(id: WatchId) -> bool {
    unwatched(|| {
        let removed = {
            let mut list = observers().lock();
            let before = list.len();
            list.retain(|(registered, _)| *registered != id);
            before != list.len()
        };
        if removed {
            if ARMED.fetch_sub(1, Ordering::SeqCst) == 1 {
                debug!(handle = id.0, "allocation interception disarmed");
            }
        } else {
            warn!(handle = id.0, "unregistering unknown leak-watch handle");
        }
        removed
    })
}

/// Entry point for the allocator shim. Cheap when disarmed, re-entrancy safe
/// when armed.
pub(crate) fn notify(raw: RawEvent) {
    if ARMED.load(Ordering::Relaxed) == 0 {
        return;
    }
    IN_DISPATCH.with(|guard| {
        if guard.replace(true) {
            return;
        }
        struct Reset<'a>(&'a Cell<bool>);
        impl Drop for Reset<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }
        let _reset = Reset(guard);
        dispatch(raw);
    });
}

/// Runs `f` with event dispatch suppressed on the current thread.
///
/// The registry and the built-in table use it internally: they allocate
/// while holding their own locks, and without suppression those allocations
/// would re-enter them through the shim and deadlock. It is public because
/// harness code has the same need, e.g. keeping a one-time buffer it leaks
/// on purpose out of a live table.
pub fn unwatched<T>(f: impl FnOnce() -> T) -> T {
    IN_DISPATCH.with(|guard| {
        let was = guard.replace(true);
        struct Reset<'a>(&'a Cell<bool>, bool);
        impl Drop for Reset<'_> {
            fn drop(&mut self) {
                self.0.set(self.1);
            }
        }
        let _reset = Reset(guard, was);
        f()
    })
}

fn dispatch(raw: RawEvent) {
    let trace = Backtrace::capture(EVENT_TRACE_SKIP, EVENT_TRACE_DEPTH);
    let event = match raw {
        RawEvent::Alloc { ptr, size } => AllocEvent::Alloc { ptr, size, trace },
        RawEvent::Realloc { old_ptr, ptr, size } => AllocEvent::Realloc {
            old_ptr,
            ptr,
            size,
            trace,
        },
        RawEvent::Free { ptr } => AllocEvent::Free { ptr, trace },
    };
    // Snapshot under the lock, call outside it. An observer is free to
    // register or unregister others from its callback.
    let snapshot: Vec<Observer> = observers()
        .lock()
        .iter()
        .map(|(_, callback)| callback.clone())
        .collect();
    for callback in snapshot {
        callback(&event);
    }
}
