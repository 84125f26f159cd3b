use std::alloc::{GlobalAlloc, Layout, System};

use crate::RawEvent;

/// Global-allocator wrapper that reports every heap operation to the
/// observer registry while interception is armed.
///
/// Install it in the binary whose allocations should be watched:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: WatchAllocator<System> = WatchAllocator::system();
/// ```
///
/// Failed allocations (null returns) are not reported.
pub struct WatchAllocator<A> {
    inner: A,
}

impl WatchAllocator<System> {
    /// Wrapper around the system allocator.
    pub const fn system() -> Self {
        WatchAllocator { inner: System }
    }
}

impl<A> WatchAllocator<A> {
    pub const fn new(inner: A) -> Self {
        WatchAllocator { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for WatchAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            crate::notify(RawEvent::Alloc {
                ptr: ptr as usize,
                size: layout.size(),
            });
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            crate::notify(RawEvent::Alloc {
                ptr: ptr as usize,
                size: layout.size(),
            });
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        crate::notify(RawEvent::Free { ptr: ptr as usize });
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            crate::notify(RawEvent::Realloc {
                old_ptr: ptr as usize,
                ptr: new_ptr as usize,
                size: new_size,
            });
        }
        new_ptr
    }
}
