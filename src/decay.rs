//! A decaying, epoch-bucketed cache of same-sized freed blocks, used both
//! as the decay layer in front of the buddy backend and, with a second
//! instantiation, as the per-`CoreAlloc` adaptive large-object cache —
//! both are "recently freed, same size, might be reused soon" caches
//! differing only in what `key` indexes and who drains evictions.
//!
//! Each of `MAX_KEYS` buckets (one per power-of-two size/order) holds `N`
//! epoch slots, each an intrusive LIFO of free blocks. `put` always lands in
//! the *current* epoch's slot; `take` searches all `N` slots so a block
//! cached a few epochs back is still found. `advance_epoch` rotates the
//! current slot forward and drains whatever the slot it now occupies held,
//! via a caller-supplied `on_evict` (return-to-backend for the chunk cache,
//! return-to-OS for the large-object cache).
//!
//! Nothing in this type calls `advance_epoch` on a timer — "decay" is the
//! eviction that happens *when* it's called, not a background thread this
//! crate spins up. Something external drives the cadence (see DESIGN.md for
//! where `config::DECAY_PERIOD_MS` is consulted).

use crate::sync::SpinLock;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

struct CacheNode {
    next: *mut CacheNode,
}

struct Buckets<const N: usize, const MAX_KEYS: usize> {
    slots: [[*mut CacheNode; N]; MAX_KEYS],
}

/// `N` epoch slots per key, `MAX_KEYS` independent size/order buckets.
pub struct EpochCache<const N: usize, const MAX_KEYS: usize> {
    lock: SpinLock,
    buckets: UnsafeCell<Buckets<N, MAX_KEYS>>,
    current: AtomicUsize,
}

unsafe impl<const N: usize, const MAX_KEYS: usize> Send for EpochCache<N, MAX_KEYS> {}
unsafe impl<const N: usize, const MAX_KEYS: usize> Sync for EpochCache<N, MAX_KEYS> {}

impl<const N: usize, const MAX_KEYS: usize> EpochCache<N, MAX_KEYS> {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            buckets: UnsafeCell::new(Buckets { slots: [[ptr::null_mut(); N]; MAX_KEYS] }),
            current: AtomicUsize::new(0),
        }
    }

    /// Cache `addr` under `key` (a size-class/order index, `< MAX_KEYS`).
    ///
    /// # Safety
    /// `addr` must point to a live block at least `size_of::<usize>()`
    /// bytes long that the caller no longer uses until a matching `take`.
    pub unsafe fn put(&self, key: usize, addr: usize) {
        debug_assert!(key < MAX_KEYS);
        self.lock.lock();
        let cur = self.current.load(Ordering::Relaxed) % N;
        unsafe {
            let buckets = &mut *self.buckets.get();
            let node = addr as *mut CacheNode;
            (*node).next = buckets.slots[key][cur];
            buckets.slots[key][cur] = node;
        }
        self.lock.unlock();
    }

    /// Take any cached block under `key`, searching the most recent epoch
    /// first.
    pub fn take(&self, key: usize) -> Option<usize> {
        debug_assert!(key < MAX_KEYS);
        self.lock.lock();
        let cur = self.current.load(Ordering::Relaxed);
        let mut found = None;
        unsafe {
            let buckets = &mut *self.buckets.get();
            for back in 0..N {
                let slot = (cur + N - back) % N;
                let head = buckets.slots[key][slot];
                if !head.is_null() {
                    buckets.slots[key][slot] = (*head).next;
                    found = Some(head as usize);
                    break;
                }
            }
        }
        self.lock.unlock();
        found
    }

    /// Rotate to the next epoch, draining whatever the slot now being
    /// reclaimed held via `on_evict(key, addr)`.
    pub fn advance_epoch(&self, mut on_evict: impl FnMut(usize, usize)) {
        self.lock.lock();
        let next = self.current.load(Ordering::Relaxed).wrapping_add(1);
        let reclaim_slot = next % N;
        unsafe {
            let buckets = &mut *self.buckets.get();
            for key in 0..MAX_KEYS {
                let mut node = buckets.slots[key][reclaim_slot];
                buckets.slots[key][reclaim_slot] = ptr::null_mut();
                while !node.is_null() {
                    let next_node = unsafe { (*node).next };
                    on_evict(key, node as usize);
                    node = next_node;
                }
            }
        }
        self.current.store(next, Ordering::Relaxed);
        self.lock.unlock();
    }
}

impl<const N: usize, const MAX_KEYS: usize> Default for EpochCache<N, MAX_KEYS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_region(bytes: usize) -> usize {
        let layout = std::alloc::Layout::from_size_align(bytes, 16).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) as usize }
    }

    #[test]
    fn put_then_take_round_trips() {
        let cache: EpochCache<4, 8> = EpochCache::new();
        let addr = alloc_region(64);
        unsafe { cache.put(2, addr) };
        assert_eq!(cache.take(2), Some(addr));
        assert_eq!(cache.take(2), None);
    }

    #[test]
    fn take_searches_older_epochs() {
        let cache: EpochCache<3, 4> = EpochCache::new();
        let addr = alloc_region(64);
        unsafe { cache.put(1, addr) };
        cache.advance_epoch(|_, _| panic!("nothing to evict yet"));
        assert_eq!(cache.take(1), Some(addr));
    }

    #[test]
    fn advance_epoch_evicts_full_cycle_old_entries() {
        let cache: EpochCache<2, 4> = EpochCache::new();
        let addr = alloc_region(64);
        unsafe { cache.put(0, addr) };
        cache.advance_epoch(|_, _| panic!("first rotation must not evict yet"));
        let mut evicted = None;
        cache.advance_epoch(|key, a| {
            evicted = Some((key, a));
        });
        assert_eq!(evicted, Some((0, addr)));
        assert_eq!(cache.take(0), None);
    }

    #[test]
    fn distinct_keys_dont_interfere() {
        let cache: EpochCache<4, 4> = EpochCache::new();
        let a = alloc_region(32);
        let b = alloc_region(32);
        unsafe {
            cache.put(0, a);
            cache.put(1, b);
        }
        assert_eq!(cache.take(1), Some(b));
        assert_eq!(cache.take(0), Some(a));
    }
}
