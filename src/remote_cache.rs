//! Per-`LocalCache` batching of remote (cross-thread) frees (spec.md §4.6).
//!
//! Posting straight to a `RemoteAllocator` on every single cross-thread
//! `dealloc` would put a CAS loop on the fast path. Instead, frees destined
//! for a given owner accumulate here, direct-mapped into one of
//! `REMOTE_SLOTS` buckets by the owner's address; a bucket holds a
//! singly-linked chain plus its tail, ready to hand to
//! `RemoteAllocator::post_chain` in one shot. A new owner hashing to an
//! already-occupied, differently-owned bucket evicts (flushes) it first —
//! this cache never grows past `REMOTE_SLOTS` live batches. Accumulating
//! `config::REMOTE_CACHE` bytes total forces a flush of every bucket, so a
//! thread that quietly frees a lot of cross-thread memory doesn't delay
//! every owner's reclamation indefinitely.

use crate::config::{REMOTE_CACHE, REMOTE_SLOTS};

#[derive(Clone, Copy)]
struct RemoteSlot {
    owner: usize,
    head: usize,
    tail: usize,
    count: u32,
}

impl RemoteSlot {
    const EMPTY: RemoteSlot = RemoteSlot { owner: 0, head: 0, tail: 0, count: 0 };
}

/// A thread-local cache of pending remote frees, one bucket per
/// `REMOTE_SLOTS`.
pub struct RemoteDeallocCache {
    slots: [RemoteSlot; REMOTE_SLOTS],
    bytes_pending: usize,
}

impl RemoteDeallocCache {
    pub const fn new() -> Self {
        Self { slots: [RemoteSlot::EMPTY; REMOTE_SLOTS], bytes_pending: 0 }
    }

    fn slot_index(owner: usize) -> usize {
        debug_assert!(REMOTE_SLOTS.is_power_of_two());
        let mixed = crate::platform::splitmix64(owner as u64);
        (mixed as usize) & (REMOTE_SLOTS - 1)
    }

    /// Queue `addr` (an object of `object_size` bytes) for eventual
    /// delivery to `owner`'s remote queue. `on_flush(owner, head, tail)` is
    /// called for every bucket this call evicts or forces out, including
    /// possibly the bucket `addr` just joined, if the byte budget trips.
    ///
    /// # Safety
    /// `addr` must be a live object no longer referenced by the caller;
    /// its first word is overwritten to link it into the bucket's chain.
    pub unsafe fn post(&mut self, owner: usize, addr: usize, object_size: usize, mut on_flush: impl FnMut(usize, usize, usize)) {
        let idx = Self::slot_index(owner);
        if self.slots[idx].owner != owner && self.slots[idx].owner != 0 {
            self.evict(idx, &mut on_flush);
        }
        let slot = &mut self.slots[idx];
        slot.owner = owner;
        unsafe { *(addr as *mut usize) = slot.head };
        if slot.head == 0 {
            slot.tail = addr;
        }
        slot.head = addr;
        slot.count += 1;
        self.bytes_pending += object_size;

        if self.bytes_pending >= REMOTE_CACHE {
            self.flush_all(on_flush);
        }
    }

    fn evict(&mut self, idx: usize, on_flush: &mut impl FnMut(usize, usize, usize)) {
        let slot = self.slots[idx];
        if slot.owner != 0 && slot.head != 0 {
            // Every object batched into one slot landed here via the same
            // owner, one dealloc at a time, so the whole chain is a single
            // ring (spec.md §4.6): pack its length into the head before
            // handing it to the queue, so the consumer can learn the
            // batch size without walking it.
            unsafe { crate::remote::pack_ring_header(slot.head, slot.tail, slot.count) };
            on_flush(slot.owner, slot.head, slot.tail);
        }
        self.slots[idx] = RemoteSlot::EMPTY;
    }

    /// Flush every non-empty bucket, resetting the byte budget. Called on
    /// the periodic-maintenance path and on `LocalCache` teardown so no
    /// batched free is ever silently lost.
    pub fn flush_all(&mut self, mut on_flush: impl FnMut(usize, usize, usize)) {
        for idx in 0..REMOTE_SLOTS {
            let slot = self.slots[idx];
            if slot.owner != 0 && slot.head != 0 {
                unsafe { crate::remote::pack_ring_header(slot.head, slot.tail, slot.count) };
                on_flush(slot.owner, slot.head, slot.tail);
            }
            self.slots[idx] = RemoteSlot::EMPTY;
        }
        self.bytes_pending = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_pending == 0
    }
}

impl Default for RemoteDeallocCache {
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
    fn single_owner_batches_without_flushing() {
        let mut cache = RemoteDeallocCache::new();
        let mut flushes = 0;
        for _ in 0..4 {
            let addr = alloc_region(64);
            unsafe { cache.post(0x1000, addr, 64, |_, _, _| flushes += 1) };
        }
        assert_eq!(flushes, 0);
        assert!(!cache.is_empty());
    }

    #[test]
    fn byte_budget_forces_flush_all() {
        let mut cache = RemoteDeallocCache::new();
        let mut flushed_owners = std::vec::Vec::new();
        let big_object = REMOTE_CACHE;
        let addr = alloc_region(big_object.max(64));
        unsafe { cache.post(0x2000, addr, big_object, |owner, _, _| flushed_owners.push(owner)) };
        assert_eq!(flushed_owners, std::vec![0x2000]);
        assert!(cache.is_empty());
    }

    #[test]
    fn colliding_owner_evicts_previous_batch() {
        let mut cache = RemoteDeallocCache::new();
        // Force a collision by reusing slot_index directly.
        let idx_owner_a = 0x3000usize;
        let idx = RemoteDeallocCache::slot_index(idx_owner_a);
        // Find another owner value that maps to the same slot.
        let mut owner_b = idx_owner_a + 1;
        while RemoteDeallocCache::slot_index(owner_b) != idx {
            owner_b += 1;
        }
        let mut flushed = std::vec::Vec::new();
        let a1 = alloc_region(64);
        unsafe { cache.post(idx_owner_a, a1, 64, |o, _, _| flushed.push(o)) };
        let b1 = alloc_region(64);
        unsafe { cache.post(owner_b, b1, 64, |o, _, _| flushed.push(o)) };
        assert_eq!(flushed, std::vec![idx_owner_a]);
    }
}
