//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` because it allocates. Instead we provide
//! a simple test-and-set spinlock, a `SpinMutex<T>` wrapper, a debug-checked
//! `FlagLock` for one-shot singleton bring-up (spec.md §4.10), and a
//! combining lock (MCS queue + flat combining) for the `Pool`'s hot LIFO.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin while locked (read-only, doesn't invalidate cache line)
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

/// A test-and-set spinlock for rare one-shot initialisations (pool list
/// mutation, singleton bring-up). In debug builds it records the owning
/// thread id and asserts no re-entrant acquire, matching spec.md §4.10's
/// "debug mode" — a thread deadlocking on itself is a bug we want to catch
/// loudly rather than hang on.
pub struct FlagLock {
    locked: AtomicBool,
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

fn current_thread_marker() -> usize {
    // A per-thread-unique, non-zero value without pulling in a thread-id
    // crate: the address of a thread-local byte is stable for the life of
    // the thread and distinct across threads.
    #[cfg(feature = "std")]
    {
        std::thread_local!(static MARK: u8 = const { 0 });
        MARK.with(|m| m as *const u8 as usize)
    }
    #[cfg(not(feature = "std"))]
    {
        1
    }
}

impl FlagLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) {
        #[cfg(debug_assertions)]
        {
            let me = current_thread_marker();
            if self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == me {
                crate::platform::HostPlatform::fatal_error(crate::error::FatalKind::DoubleAcquire);
            }
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        #[cfg(debug_assertions)]
        self.owner.store(current_thread_marker(), Ordering::Relaxed);
    }

    pub fn unlock(&self) {
        #[cfg(debug_assertions)]
        self.owner.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for FlagLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for FlagLock {}
unsafe impl Sync for FlagLock {}

/// A waiter node for [`CombiningLock`]. Stack-allocated by the caller and
/// linked into the MCS queue for the duration of one `combine` call. The
/// thunk is stored as a `'static`-erased trait object pointer; this is
/// sound because `combine` never returns until this node's `ready` flag is
/// observed set, by which point no other thread still holds a reference to
/// it (the same scoped-borrow pattern `std::thread::scope` uses).
struct Node {
    next: AtomicPtr<Node>,
    ready: AtomicBool,
    thunk: UnsafeCell<Option<*mut (dyn FnMut() + 'static)>>,
}

/// An MCS queue lock with flat combining (spec.md §4.10): the thread at the
/// head of the queue doesn't just run its own critical section, it also
/// runs every successor's thunk in queue order before waking them. This
/// trades a single cache-warm executor for avoiding N separate lock
/// hand-offs when many threads contend on a short critical section (the
/// `Pool`'s acquire/release stack is the intended caller).
///
/// Thunks must be safe to run on whichever thread happens to be the current
/// combiner — they may only touch state reachable by reference (never a
/// caller's thread-local), which is exactly what `Pool::acquire`/`release`
/// need (shared `Pool` state only).
pub struct CombiningLock {
    tail: AtomicPtr<Node>,
}

impl CombiningLock {
    pub const fn new() -> Self {
        Self { tail: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Run `thunk` under the combining lock. Returns once `thunk` (and, if
    /// this thread became the combiner, every successor queued behind it
    /// at the time it runs) has executed.
    pub fn combine<F: FnMut()>(&self, mut thunk: F) {
        let fat: *mut (dyn FnMut() + 'static) = unsafe {
            core::mem::transmute::<*mut (dyn FnMut() + '_), *mut (dyn FnMut() + 'static)>(
                &mut thunk as *mut F,
            )
        };
        let node = Node {
            next: AtomicPtr::new(ptr::null_mut()),
            ready: AtomicBool::new(false),
            thunk: UnsafeCell::new(Some(fat)),
        };
        let node_ptr = &node as *const Node as *mut Node;

        let prev = self.tail.swap(node_ptr, Ordering::AcqRel);
        if !prev.is_null() {
            unsafe { (*prev).next.store(node_ptr, Ordering::Release) };
            while !node.ready.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            return;
        }

        // We are the combiner: run our own thunk, then walk and run every
        // successor that has linked itself in so far, in order, waking
        // each as we go.
        let mut curr = node_ptr;
        loop {
            unsafe {
                if let Some(f) = (*(*curr).thunk.get()).take() {
                    (*f)();
                }
            }
            if curr != node_ptr {
                unsafe { (*curr).ready.store(true, Ordering::Release) };
            }
            let next = unsafe { (*curr).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Try to close the queue; if someone linked in between our
                // load and this CAS, keep draining instead of stopping.
                match self.tail.compare_exchange(curr, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(_) => {
                        while unsafe { (*curr).next.load(Ordering::Acquire) }.is_null() {
                            core::hint::spin_loop();
                        }
                        curr = unsafe { (*curr).next.load(Ordering::Acquire) };
                    }
                }
            } else {
                curr = next;
            }
        }
    }
}

impl Default for CombiningLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for CombiningLock {}
unsafe impl Sync for CombiningLock {}

use core::ptr;
