//! Pool of `CoreAlloc` instances (spec.md §4.9).
//!
//! Two linked lists share every `CoreAlloc` this process ever carves out of
//! the backend: the idle LIFO (`acquire`/`release`, hot, contended,
//! combining-lock guarded per spec.md §4.10) and the "ever created" list
//! (`FlagLock`-guarded, touched only on the rare cold path of minting a
//! brand new instance or walking every instance for maintenance).

use crate::buddy::BuddyAllocator;
use crate::core_alloc::CoreAlloc;
use crate::pagemap::PageMap;
use crate::sync::{CombiningLock, FlagLock};
use core::cell::UnsafeCell;
use core::ptr;

struct IdleList {
    head: *mut CoreAlloc,
}

unsafe impl Send for IdleList {}

struct AllList {
    head: *mut CoreAlloc,
}

unsafe impl Send for AllList {}

/// Process-wide pool of `CoreAlloc` instances (spec.md §4.9). One static
/// instance; threads acquire a `CoreAlloc` lazily on first use and release
/// it back on teardown (`LocalCache`'s `Drop`).
pub struct Pool {
    idle: UnsafeCell<IdleList>,
    idle_lock: CombiningLock,
    all: UnsafeCell<AllList>,
    all_lock: FlagLock,
}

unsafe impl Sync for Pool {}

impl Pool {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            idle: UnsafeCell::new(IdleList { head: ptr::null_mut() }),
            idle_lock: CombiningLock::new(),
            all: UnsafeCell::new(AllList { head: ptr::null_mut() }),
            all_lock: FlagLock::new(),
        }
    }

    /// Pop an idle `CoreAlloc`, or mint a fresh one from the backend if none
    /// is waiting. Marks the result `in_use`; acquiring an already-in-use
    /// instance (a `Pool` bug, never legitimate caller input) is fatal.
    pub fn acquire(&self, pagemap: &'static PageMap, buddy: &'static BuddyAllocator) -> *mut CoreAlloc {
        let mut popped: *mut CoreAlloc = ptr::null_mut();
        self.idle_lock.combine(|| {
            let list = unsafe { &mut *self.idle.get() };
            if !list.head.is_null() {
                popped = list.head;
                list.head = unsafe { (*popped).pool_next };
            }
        });

        if popped.is_null() {
            popped = CoreAlloc::new_boxed(pagemap, buddy);
            self.link_all(popped);
        }

        unsafe { (*popped).mark_in_use() };
        popped
    }

    /// Return `core` to the idle LIFO for reuse by the next thread that
    /// calls `acquire`.
    pub fn release(&self, core: *mut CoreAlloc) {
        unsafe { (*core).mark_idle() };
        self.idle_lock.combine(|| {
            let list = unsafe { &mut *self.idle.get() };
            unsafe { (*core).pool_next = list.head };
            list.head = core;
        });
    }

    fn link_all(&self, core: *mut CoreAlloc) {
        self.all_lock.lock();
        let list = unsafe { &mut *self.all.get() };
        unsafe { (*core).pool_all_next = list.head };
        list.head = core;
        self.all_lock.unlock();
    }

    /// Detach the entire idle LIFO as a `(first, last)` pair linked through
    /// `pool_next`, leaving the pool empty until `restore` puts it back.
    /// Used by the maintenance pass to age every *idle* core's decay caches
    /// without racing a concurrent `acquire`/`release` (spec.md §4.9
    /// `extract`/`restore`, feeding `cleanup_unused`).
    pub fn extract(&self) -> (*mut CoreAlloc, *mut CoreAlloc) {
        let mut first = ptr::null_mut();
        self.idle_lock.combine(|| {
            let list = unsafe { &mut *self.idle.get() };
            first = list.head;
            list.head = ptr::null_mut();
        });
        if first.is_null() {
            return (ptr::null_mut(), ptr::null_mut());
        }
        let mut last = first;
        loop {
            let next = unsafe { (*last).pool_next };
            if next.is_null() {
                break;
            }
            last = next;
        }
        (first, last)
    }

    /// Splice a `(first, last)` chain (as returned by `extract`) back onto
    /// the front of the idle LIFO.
    pub fn restore(&self, first: *mut CoreAlloc, last: *mut CoreAlloc) {
        if first.is_null() {
            return;
        }
        self.idle_lock.combine(|| {
            let list = unsafe { &mut *self.idle.get() };
            unsafe { (*last).pool_next = list.head };
            list.head = first;
        });
    }

    /// Age every currently-idle core's decay caches by one epoch, returning
    /// whatever ages out to the buddy backend. Safe to call from any
    /// thread: an idle core has no owning thread touching it (spec.md §4.9
    /// `cleanup_unused`'s janitor). A core acquired mid-pass by another
    /// thread simply isn't in the extracted chain and is left untouched —
    /// its decay cadence instead rides its own thread's slow-path polling
    /// (see `LocalCache::maybe_decay`, DESIGN.md).
    pub fn cleanup_unused(&self) {
        let (first, last) = self.extract();
        let mut cursor = first;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).pool_next };
            unsafe { (*cursor).decay() };
            cursor = next;
        }
        self.restore(first, last);
    }
}
