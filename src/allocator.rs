//! Top-level allocator: binds a [`LocalCache`] to the running thread and
//! implements `GlobalAlloc` over it. Process-wide state — the pagemap, the
//! buddy backend, and the pool of `CoreAlloc` instances — lives here as
//! plain statics; everything else in the crate is reached through them.
//!
//! Thread-binding strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (one TLS read, no
//!   lazy-init branch once `Active`).
//! - `std` feature (no `nightly`): `std::thread_local!`, whose own Drop glue
//!   tears the `LocalCache` down on thread exit — no manual cleanup guard
//!   needed, since `LocalCache` already implements `Drop`.
//! - neither: one process-wide `LocalCache` behind a `SpinMutex`, the
//!   degenerate "every thread shares one core" case.

use crate::buddy::BuddyAllocator;
use crate::config::CONFIG;
use crate::local_cache::LocalCache;
use crate::pagemap::PageMap;
use crate::pool::Pool;
use crate::sync::SpinMutex;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

pub(crate) static PAGEMAP: PageMap = PageMap::new();
pub(crate) static BUDDY: BuddyAllocator = BuddyAllocator::new();
pub(crate) static POOL: Pool = Pool::new();

/// Spawn the background thread that ages every idle `CoreAlloc`'s decay
/// caches roughly every `config::DECAY_PERIOD_MS`. Only available under
/// `std`; without it, decay only happens opportunistically via
/// `LocalCache::maybe_decay`'s tick counter on a busy thread.
#[cfg(feature = "std")]
fn ensure_maintenance_thread() {
    use core::sync::atomic::{AtomicBool, Ordering};
    static STARTED: AtomicBool = AtomicBool::new(false);
    // Not `std::sync::Once`: `Builder::name`'s `String` and `spawn`'s boxed
    // closure both allocate through this same global allocator, so the
    // spawn below reenters `with_local` -> `ensure_maintenance_thread` on
    // this very thread before it returns. `Once::call_once` would deadlock
    // against its own still-running call in that reentrant call; a plain
    // `compare_exchange` just lets the reentrant call see `STARTED` already
    // set and fall straight through.
    if STARTED.compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
        let _ = std::thread::Builder::new().name("threadheap-decay".into()).spawn(|| loop {
            std::thread::sleep(std::time::Duration::from_millis(crate::config::DECAY_PERIOD_MS));
            POOL.cleanup_unused();
        });
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot<T> {
            state: TlsState,
            content: T,
        }

        #[inline(always)]
        unsafe fn lc() -> *mut LocalCache {
            unsafe { core::ptr::addr_of_mut!(LC.content) }
        }

        #[thread_local]
        static mut LC: TlsSlot<LocalCache> = TlsSlot {
            state: TlsState::Uninitialized,
            content: LocalCache::new(&PAGEMAP, &BUDDY, &POOL),
        };

        #[cold]
        #[allow(dead_code)] // only reachable from the std cleanup guard below
        unsafe fn lc_destroy() {
            unsafe {
                if LC.state == TlsState::Active {
                    LC.state = TlsState::Destroyed;
                    (*lc()).teardown();
                }
            }
        }

        #[cold]
        #[inline(never)]
        unsafe fn lc_init() {
            // Set BEFORE cleanup registration — if register() triggers
            // allocation, the reentrant call sees LC as Active and uses it
            // normally.
            unsafe { LC.state = TlsState::Active };
            lc_cleanup::register();
        }

        #[cfg(feature = "std")]
        mod lc_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    if unsafe { super::LC.state } == super::TlsState::Active {
                        unsafe { super::lc_destroy() };
                    }
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // If std's own TLS is already torn down (thread-shutdown
                // edge case), skip silently — the LocalCache's objects leak
                // rather than risk reentering a destroyed allocator.
                let _ = GUARD.try_with(|_| {});
            }
        }

        #[cfg(not(feature = "std"))]
        mod lc_cleanup {
            pub(super) fn register() {}
        }

        #[inline(always)]
        fn with_local<R>(f: impl FnOnce(&mut LocalCache) -> R) -> R {
            #[cfg(feature = "std")]
            ensure_maintenance_thread();
            unsafe {
                if LC.state != TlsState::Active {
                    lc_init();
                }
                f(&mut *lc())
            }
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static LC_CELL: core::cell::UnsafeCell<LocalCache> = const {
                core::cell::UnsafeCell::new(LocalCache::new(&PAGEMAP, &BUDDY, &POOL))
            };
        }

        #[inline(always)]
        fn with_local<R>(f: impl FnOnce(&mut LocalCache) -> R) -> R {
            ensure_maintenance_thread();
            LC_CELL.with(|cell| f(unsafe { &mut *cell.get() }))
        }
    } else {
        static FALLBACK: SpinMutex<LocalCache> = SpinMutex::new(LocalCache::new(&PAGEMAP, &BUDDY, &POOL));

        #[inline(always)]
        fn with_local<R>(f: impl FnOnce(&mut LocalCache) -> R) -> R {
            let mut guard = FALLBACK.lock();
            f(&mut guard)
        }
    }
}

/// The allocator. Zero-sized; all state lives in the statics above and in
/// whichever thread-local slot binds this thread to a `CoreAlloc`.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: threadheap::ThreadHeap = threadheap::ThreadHeap;
/// ```
pub struct ThreadHeap;

impl ThreadHeap {
    /// Allocate `size` bytes with no alignment requirement stronger than
    /// `size`'s own natural alignment. `size == 0` still returns a valid,
    /// smallest-class pointer.
    #[inline]
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let addr = with_local(|lc| lc.alloc(size.max(1)));
        crate::hist_record!(size);
        addr as *mut u8
    }

    /// Allocate `size` bytes aligned to at least `align`.
    #[inline]
    pub fn alloc_aligned(&self, align: usize, size: usize) -> *mut u8 {
        let addr = with_local(|lc| lc.alloc_aligned(align, size.max(1)));
        crate::hist_record!(size);
        addr as *mut u8
    }

    /// As `alloc`, with the returned region zeroed.
    #[inline]
    pub fn alloc_zero(&self, size: usize) -> *mut u8 {
        let addr = with_local(|lc| lc.alloc_zero(size.max(1)));
        crate::hist_record!(size);
        addr as *mut u8
    }

    /// Free a previously-allocated object. `ptr` must be null or the start
    /// of a live allocation from any thread.
    #[inline]
    pub fn dealloc(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        with_local(|lc| lc.dealloc(ptr as usize));
    }

    /// As `dealloc`, asserting in debug builds that `size`'s size class
    /// matches the allocation's actual size class.
    #[inline]
    pub fn dealloc_sized(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        debug_assert_eq!(
            crate::size_class::size_to_sizeclass(size.max(1)),
            crate::size_class::size_to_sizeclass(self.alloc_size(ptr)),
            "dealloc size {size} doesn't match the allocation's size class"
        );
        self.dealloc(ptr);
    }

    /// Usable size of a live allocation, or 0 for null.
    #[inline]
    pub fn alloc_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        with_local(|lc| lc.alloc_size(ptr as usize))
    }

    /// Start of the allocation containing `ptr`, or `ptr` itself if it
    /// isn't one of ours.
    #[inline]
    pub fn external_pointer_start(&self, ptr: *mut u8) -> *mut u8 {
        if ptr.is_null() {
            return ptr;
        }
        let start = with_local(|lc| lc.object_start(ptr as usize));
        if start == 0 { ptr } else { start as *mut u8 }
    }

    /// End of the allocation containing `ptr` (the last live byte), or
    /// `ptr` if it isn't one of ours.
    #[inline]
    pub fn external_pointer_end(&self, ptr: *mut u8) -> *mut u8 {
        let one_past = self.external_pointer_one_past_end(ptr);
        if one_past == ptr {
            return ptr;
        }
        unsafe { one_past.sub(1) }
    }

    /// One past the end of the allocation containing `ptr`, or `ptr` if it
    /// isn't one of ours.
    #[inline]
    pub fn external_pointer_one_past_end(&self, ptr: *mut u8) -> *mut u8 {
        if ptr.is_null() {
            return ptr;
        }
        let start = self.external_pointer_start(ptr);
        if start == ptr {
            let size = self.alloc_size(ptr);
            if size == 0 {
                return ptr;
            }
            return unsafe { ptr.add(size) };
        }
        let size = self.alloc_size(start);
        unsafe { start.add(size) }
    }

    /// Return this thread's bound `CoreAlloc` to the pool and forget it.
    /// Mostly useful from tests, where a fresh thread per test isn't always
    /// practical.
    pub fn debug_teardown(&self) {
        with_local(|lc| lc.teardown());
    }
}

unsafe impl GlobalAlloc for ThreadHeap {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() <= core::mem::align_of::<usize>() {
            ThreadHeap::alloc(self, size)
        } else {
            ThreadHeap::alloc_aligned(self, layout.align(), size)
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        ThreadHeap::dealloc(self, ptr)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() <= core::mem::align_of::<usize>() {
            ThreadHeap::alloc_zero(self, size)
        } else {
            // `alloc_aligned` doesn't zero; over-aligned zeroed requests are
            // rare enough that a manual zero here is fine (Non-goals: no
            // in-place realloc optimization, same spirit applies here).
            let ptr = ThreadHeap::alloc_aligned(self, layout.align(), size);
            if !ptr.is_null() {
                unsafe { ptr::write_bytes(ptr, 0, size) };
            }
            ptr
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size.max(1), layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        crate::stat_inc!(realloc_count);

        // Non-goals: no in-place realloc. Always alloc + copy + dealloc,
        // sized off the allocation's real (size-class-rounded) usable size
        // rather than `layout.size()`, since a prior realloc may have
        // returned the same pointer for an in-place-fitting shrink.
        let old_usable = self.alloc_size(ptr);
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for ThreadHeap {
    fn allocate(&self, layout: Layout) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alloc_dealloc_round_trips() {
        let heap = ThreadHeap;
        let p = heap.alloc(64);
        assert!(!p.is_null());
        assert!(heap.alloc_size(p) >= 64);
        heap.dealloc(p);
        heap.debug_teardown();
    }

    #[test]
    fn zeroed_alloc_is_zero() {
        let heap = ThreadHeap;
        let p = heap.alloc_zero(256);
        assert!(!p.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(p, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        heap.dealloc(p);
        heap.debug_teardown();
    }

    #[test]
    fn large_alloc_dealloc_round_trips() {
        let heap = ThreadHeap;
        let p = heap.alloc(1 << 20);
        assert!(!p.is_null());
        heap.dealloc(p);
        heap.debug_teardown();
    }

    #[test]
    fn external_pointer_family_brackets_the_allocation() {
        let heap = ThreadHeap;
        let p = heap.alloc(48);
        let mid = unsafe { p.add(10) };
        assert_eq!(heap.external_pointer_start(mid), p);
        let end = heap.external_pointer_end(p);
        let one_past = heap.external_pointer_one_past_end(p);
        assert_eq!(unsafe { end.add(1) }, one_past);
        heap.dealloc(p);
        heap.debug_teardown();
    }

    #[test]
    fn global_alloc_trait_impl_round_trips() {
        let heap = ThreadHeap;
        let layout = Layout::from_size_align(128, 16).unwrap();
        unsafe {
            let p = GlobalAlloc::alloc(&heap, layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            let grown = GlobalAlloc::realloc(&heap, p, layout, 512);
            assert!(!grown.is_null());
            GlobalAlloc::dealloc(&heap, grown, Layout::from_size_align(512, 16).unwrap());
        }
        heap.debug_teardown();
    }

    #[test]
    fn over_aligned_zeroed_alloc_is_aligned_and_zero() {
        let heap = ThreadHeap;
        let layout = Layout::from_size_align(100, 4096).unwrap();
        let p = unsafe { GlobalAlloc::alloc_zeroed(&heap, layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 4096, 0);
        let bytes = unsafe { core::slice::from_raw_parts(p, 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { GlobalAlloc::dealloc(&heap, p, layout) };
        heap.debug_teardown();
    }
}
