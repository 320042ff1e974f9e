//! Per-thread-group core allocator: owns a set of slabs per
//! small size class, the live/full ("laden") slabs, a decay cache of raw
//! chunks and large objects, and the [`RemoteAllocator`] other threads post
//! cross-owner frees to. Exactly one `CoreAlloc` is bound to a thread at a
//! time (via [`crate::pool::Pool`]); everything here assumes single-writer
//! access — no field is behind its own lock.
//!
//! `CoreAlloc` instances are themselves carved from chunk-aligned backend
//! memory (`new_boxed`), so their address can be packed into a pagemap
//! meta-entry's owner word alongside a size class (`pagemap.rs`).

use crate::buddy::{BuddyAllocator, NUM_ORDERS};
use crate::config::{CONFIG, MAX_CACHEABLE_SIZE, MIN_CHUNK_SIZE};
use crate::decay::EpochCache;
use crate::error::FatalKind;
use crate::pagemap::{MetaEntry, PageMap, OWNER_ALIGN};
use crate::platform::{HostPlatform, Platform};
use crate::remote::RemoteAllocator;
use crate::size_class::{SizeClass, NUM_SMALL_SIZECLASSES, SIZE_CLASSES};
use crate::slab::{fill_free_list, SignedFreeListIter, SlabMeta, SlabSet, SlabState};
use core::ptr;

const NUM_EPOCHS: usize = crate::config::NUM_EPOCHS;
/// One bucket per possible `SizeClass::Large` leading-zero-count.
const LARGE_CACHE_KEYS: usize = usize::BITS as usize;

/// Result of pulling a slab's entire free list to satisfy one small
/// allocation: the object handed back immediately, plus the remainder as a
/// ready-to-use signed chain the caller (`LocalCache`) keeps as its fast
/// per-size-class free list.
pub struct SlabAllocResult {
    pub object: usize,
    pub remainder_head: usize,
    pub remainder_count: u32,
    pub key1: usize,
    pub key2: usize,
    pub key_next: usize,
}

struct SizeClassState {
    available: SlabSet,
    unused_count: u32,
}

impl SizeClassState {
    const fn new() -> Self {
        Self { available: SlabSet::new(), unused_count: 0 }
    }
}

pub struct CoreAlloc {
    pagemap: &'static PageMap,
    buddy: &'static BuddyAllocator,
    classes: [SizeClassState; NUM_SMALL_SIZECLASSES],
    /// Fully-used small slabs (the "laden" set). Large allocations aren't
    /// tracked here — they carry no `SlabMeta` to link through, and this
    /// crate doesn't need to enumerate live large objects.
    laden: SlabSet,
    remote: RemoteAllocator,
    /// Raw chunks recently vacated by a fully-freed slab, keyed by buddy
    /// order, kept warm for a few epochs before falling back to the buddy
    /// backend.
    chunk_cache: EpochCache<NUM_EPOCHS, NUM_ORDERS>,
    /// Recently-freed large objects, keyed by their `SizeClass::Large` bit
    /// count, sharing the same `EpochCache` machinery as the chunk decay
    /// layer above.
    large_cache: EpochCache<NUM_EPOCHS, LARGE_CACHE_KEYS>,
    self_addr: usize,
    /// Set while bound to a thread; `Pool::acquire` double-setting this is
    /// a fatal "double use".
    in_use: core::sync::atomic::AtomicBool,
    /// Slow-path events since this core's decay caches were last aged, used
    /// by `LocalCache::maybe_decay` to approximate a periodic timer without
    /// one.
    pub(crate) ticks_since_decay: u32,
    pub(crate) pool_next: *mut CoreAlloc,
    pub(crate) pool_all_next: *mut CoreAlloc,
}

unsafe impl Send for CoreAlloc {}

impl CoreAlloc {
    /// Carve a new `CoreAlloc` out of a fresh, chunk-aligned backend
    /// allocation and initialize it in place. Returned as a raw pointer
    /// because this crate's own allocator can't be used to allocate itself.
    pub fn new_boxed(pagemap: &'static PageMap, buddy: &'static BuddyAllocator) -> *mut CoreAlloc {
        // Must be aligned to at least `OWNER_ALIGN`, not just `MIN_CHUNK_SIZE`:
        // `MetaEntry::frontend` packs a size-class index into this address's
        // low bits, and `OWNER_ALIGN` is exactly the span that field needs.
        let size = core::mem::size_of::<CoreAlloc>().next_power_of_two().max(MIN_CHUNK_SIZE).max(OWNER_ALIGN);
        let raw = unsafe { HostPlatform::alloc(size, size) };
        if raw.is_null() {
            HostPlatform::fatal_error(FatalKind::Oom);
        }
        let ptr = raw as *mut CoreAlloc;
        let core = CoreAlloc {
            pagemap,
            buddy,
            classes: core::array::from_fn(|_| SizeClassState::new()),
            laden: SlabSet::new(),
            remote: RemoteAllocator::new(),
            chunk_cache: EpochCache::new(),
            large_cache: EpochCache::new(),
            self_addr: raw as usize,
            in_use: core::sync::atomic::AtomicBool::new(false),
            ticks_since_decay: 0,
            pool_next: ptr::null_mut(),
            pool_all_next: ptr::null_mut(),
        };
        unsafe { ptr::write(ptr, core) };
        ptr
    }

    #[inline]
    pub fn self_addr(&self) -> usize {
        self.self_addr
    }

    /// Mark this instance bound to a thread. Double-setting (acquiring an
    /// already-in-use core) is a `Pool` invariant violation, fatal.
    pub(crate) fn mark_in_use(&self) {
        if self.in_use.swap(true, core::sync::atomic::Ordering::AcqRel) {
            HostPlatform::fatal_error(FatalKind::DoubleAcquire);
        }
    }

    pub(crate) fn mark_idle(&self) {
        self.in_use.store(false, core::sync::atomic::Ordering::Release);
    }

    /// Reconstruct a `RemoteAllocator` reference from a pagemap entry's
    /// owner address. Sound because `owner_addr` is always the base address
    /// of a live, chunk-aligned `CoreAlloc` pointer for as long as the chunk
    /// it was read from stays frontend-owned, and the queue is designed for
    /// exactly this: any thread may be a producer against it.
    #[inline]
    pub fn remote_from_owner_addr<'a>(owner_addr: usize) -> &'a RemoteAllocator {
        unsafe { &(*(owner_addr as *const CoreAlloc)).remote }
    }

    #[inline]
    pub fn remote(&self) -> &RemoteAllocator {
        &self.remote
    }

    #[inline]
    pub fn pagemap(&self) -> &'static PageMap {
        self.pagemap
    }

    /// Refill a thread's fast free list for small size class `sc_idx`:
    /// either harvest an already-waiting `available` slab, or carve a fresh
    /// one.
    pub fn refill(&mut self, sc_idx: u16) -> SlabAllocResult {
        let slab_ptr = self.classes[sc_idx as usize].available.pop_front();
        if !slab_ptr.is_null() {
            self.drain_and_laden(slab_ptr, sc_idx)
        } else {
            self.refill_slow(sc_idx)
        }
    }

    fn drain_and_laden(&mut self, slab_ptr: *mut SlabMeta, sc_idx: u16) -> SlabAllocResult {
        let info = &SIZE_CLASSES[sc_idx as usize];
        let slab = unsafe { &mut *slab_ptr };
        let (mut iter, count) = slab.take_free_list();
        let (key1, key2, key_next) = (slab.key1, slab.key2, slab.key_next);
        let object = iter
            .take(key1, key2, key_next)
            .expect("a slab in `available` always has at least one free object");
        let remainder_head = iter.peek();
        let remainder_count = count - 1;

        slab.state = SlabState::Laden;
        slab.needed = info.waking_threshold.max(1);
        unsafe { self.laden.push_front(slab_ptr) };

        SlabAllocResult { object, remainder_head, remainder_count, key1, key2, key_next }
    }

    fn refill_slow(&mut self, sc_idx: u16) -> SlabAllocResult {
        crate::stat_inc!(core_alloc_refills);
        let info = &SIZE_CLASSES[sc_idx as usize];
        let order = BuddyAllocator::order_for_size(info.slab_size);
        let chunk_addr = match self.chunk_cache.take(order as usize) {
            Some(addr) => addr,
            None => self.retry_buddy_alloc(info.slab_size),
        };
        if chunk_addr == 0 {
            // OOM even after decay-cache retry: propagate as a zero object
            // rather than building a free list over a null chunk.
            // `LocalCache::alloc_small` passes this straight through as a
            // null `alloc` return.
            return SlabAllocResult { object: 0, remainder_head: 0, remainder_count: 0, key1: 0, key2: 0, key_next: 0 };
        }

        let key1 = HostPlatform::entropy() as usize;
        let key2 = HostPlatform::entropy() as usize;
        let key_next = HostPlatform::entropy() as usize;

        let mut builder = fill_free_list(
            chunk_addr,
            info.object_size,
            info.capacity,
            key1,
            key2,
            key_next,
            CONFIG.random_initial,
            CONFIG.random_extra_slab,
            HostPlatform::entropy,
        );
        let (h0, _t0, c0) = builder.close(0);
        let (h1, _t1, c1) = builder.close(1);

        let slab_ptr = self.alloc_slab_meta();
        let sc_raw = SizeClass::Small(sc_idx).to_raw();
        unsafe {
            ptr::write(
                slab_ptr,
                SlabMeta::new(
                    sc_raw,
                    chunk_addr,
                    info.slab_size,
                    info.object_size,
                    info.capacity,
                    key1,
                    key2,
                    key_next,
                    self.self_addr,
                    false,
                ),
            );
        }
        // Preserve whatever boundary bit the buddy backend already
        // established for this chunk rather than assuming it starts a
        // fresh backend allocation — a cached/split chunk usually doesn't.
        let boundary = self.pagemap.get(chunk_addr).is_boundary();
        self.pagemap.set_range(
            chunk_addr,
            info.slab_size,
            MetaEntry::frontend(self.self_addr, slab_ptr as usize, sc_raw, boundary),
        );

        let mut iter0 = SignedFreeListIter::new(h0);
        let object = iter0
            .take(key1, key2, key_next)
            .expect("a freshly filled slab always has at least one object");
        let remainder_head = iter0.peek();
        let remainder_count = c0 - 1;

        let slab = unsafe { &mut *slab_ptr };
        if c1 > 0 {
            slab.free_head = h1;
            slab.free_count = c1;
            slab.state = SlabState::Available;
            unsafe { self.classes[sc_idx as usize].available.push_front(slab_ptr) };
        } else {
            slab.state = SlabState::Laden;
            slab.needed = info.waking_threshold.max(1);
            unsafe { self.laden.push_front(slab_ptr) };
        }

        SlabAllocResult { object, remainder_head, remainder_count, key1, key2, key_next }
    }

    fn alloc_slab_meta(&self) -> *mut SlabMeta {
        let size = core::mem::size_of::<SlabMeta>();
        let align = core::mem::align_of::<SlabMeta>();
        let raw = unsafe { HostPlatform::alloc(size, align) };
        if raw.is_null() {
            HostPlatform::fatal_error(FatalKind::Oom);
        }
        raw as *mut SlabMeta
    }

    /// Route a raw chain of locally-owned, excess-cached objects (addresses
    /// linked via their own first word, as `LocalCache` stores its fast
    /// lists before a batch return) back through each one's slab, waking or
    /// retiring slabs as needed.
    pub fn return_objects(&mut self, mut head: usize) {
        while head != 0 {
            let addr = head;
            head = unsafe { *(addr as *const usize) };
            self.return_one(addr);
        }
    }

    /// Drain this `CoreAlloc`'s remote queue, returning every object to its
    /// slab the same way a local free would.
    ///
    /// Every head posted by `RemoteDeallocCache` carries a ring header
    /// (spec.md §4.6) recording how many objects follow it in the chain;
    /// `open_free_ring` surfaces that count purely as a drain-progress
    /// signal here (each object still splices onto its slab one at a
    /// time via `return_one` — batching the `needed` update itself would
    /// require threading ring boundaries through the slab's free-list
    /// internals, which this pass leaves alone; see DESIGN.md).
    pub fn handle_message_queue(&mut self) {
        let mut iter = self.remote.drain();
        while let Some(head) = iter.next() {
            crate::stat_inc!(remote_queue_drains);
            let (_tail, length) = unsafe { crate::remote::open_free_ring(head) };
            self.return_one(head);
            for _ in 1..length {
                match iter.next() {
                    Some(addr) => {
                        crate::stat_inc!(remote_queue_drains);
                        self.return_one(addr);
                    }
                    None => break,
                }
            }
        }
    }

    fn return_one(&mut self, addr: usize) {
        let entry = self.pagemap.get(addr);
        if entry.is_unowned() || entry.is_backend_owned() {
            HostPlatform::fatal_error(FatalKind::NotOurs { addr });
        }
        if SizeClass::from_raw(entry.sizeclass_raw()).is_large() {
            // Large objects carry no `SlabMeta` (`slab_addr() == 0`); a
            // cross-thread free of one arrives here the same way a small
            // object's does, so route it straight to the large-object path.
            let bits = match SizeClass::from_raw(entry.sizeclass_raw()) {
                SizeClass::Large(b) => b,
                SizeClass::Small(_) => unreachable!(),
            };
            self.dealloc_large(addr, bits);
            return;
        }
        let slab_addr = entry.slab_addr();
        if slab_addr == 0 {
            HostPlatform::fatal_error(FatalKind::NotOurs { addr });
        }
        let slab_ptr = slab_addr as *mut SlabMeta;
        let slab = unsafe { &mut *slab_ptr };
        let woke = slab.push_free_fast(addr);
        if woke {
            self.wake_or_mark_unused(slab_ptr);
            return;
        }
        match slab.state {
            SlabState::Laden => slab.state = SlabState::Sleeping,
            SlabState::Available | SlabState::Unused => {
                let sc_raw = slab.size_class_raw;
                let class = &mut self.classes[sc_raw];
                class.unused_count += 1;
                if class.unused_count > 2 && (class.unused_count as usize) > class.available.len() / 4 {
                    self.dealloc_local_slabs(sc_raw as u16);
                }
            }
            SlabState::Sleeping => {}
        }
    }

    fn wake_or_mark_unused(&mut self, slab_ptr: *mut SlabMeta) {
        let slab = unsafe { &mut *slab_ptr };
        unsafe { self.laden.remove(slab_ptr) };
        slab.state = SlabState::Available;
        let sc_raw = slab.size_class_raw;
        unsafe { self.classes[sc_raw].available.push_front(slab_ptr) };
    }

    /// Reclaim fully-empty slabs of size class `sc_idx` back to the chunk
    /// decay cache, freeing their `SlabMeta` storage.
    fn dealloc_local_slabs(&mut self, sc_idx: u16) {
        let info = &SIZE_CLASSES[sc_idx as usize];
        self.classes[sc_idx as usize].unused_count = 0;

        let mut cursor = self.classes[sc_idx as usize].available.head();
        while !cursor.is_null() {
            let slab_ptr = cursor;
            cursor = unsafe { (*cursor).link.next };
            let free_count = unsafe { (*slab_ptr).free_count };
            if free_count == info.capacity {
                unsafe { self.classes[sc_idx as usize].available.remove(slab_ptr) };
                let chunk_addr = unsafe { (*slab_ptr).chunk_addr };
                let boundary = self.pagemap.get(chunk_addr).is_boundary();
                self.pagemap.set_range(chunk_addr, info.slab_size, MetaEntry::backend_owned(boundary));
                let order = BuddyAllocator::order_for_size(info.slab_size);
                unsafe { self.chunk_cache.put(order as usize, chunk_addr) };
                unsafe { HostPlatform::dealloc(slab_ptr as *mut u8, core::mem::size_of::<SlabMeta>()) };
            }
        }
    }

    /// Allocate a large (non-slab) object of the given `SizeClass::Large`
    /// magnitude, preferring a recently-freed block of the same size.
    pub fn alloc_large(&mut self, bits: u32) -> usize {
        crate::stat_inc!(large_allocs);
        let size = 1usize << (usize::BITS - bits);
        let addr = if size <= MAX_CACHEABLE_SIZE {
            self.large_cache.take(bits as usize).unwrap_or_else(|| self.retry_buddy_alloc(size))
        } else {
            self.retry_buddy_alloc(size)
        };
        if addr == 0 {
            return 0;
        }
        let boundary = self.pagemap.get(addr).is_boundary();
        self.pagemap.set_range(addr, size, MetaEntry::frontend(self.self_addr, 0, SizeClass::Large(bits).to_raw(), boundary));
        addr
    }

    /// Ask the buddy backend for `size` bytes; on OOM, force-drain both
    /// decay caches one epoch at a time and retry, up to `NUM_EPOCHS`
    /// attempts, before giving up. A cache miss means memory this core
    /// already holds but hasn't returned to the backend yet — flushing it
    /// can satisfy a request the backend alone couldn't.
    fn retry_buddy_alloc(&mut self, size: usize) -> usize {
        let addr = self.buddy.alloc(self.pagemap, size);
        if addr != 0 {
            return addr;
        }
        let pagemap = self.pagemap;
        let buddy = self.buddy;
        for _ in 0..NUM_EPOCHS {
            self.chunk_cache.advance_epoch(|order, addr| {
                let sz = MIN_CHUNK_SIZE << order;
                let boundary = pagemap.get(addr).is_boundary();
                pagemap.set_range(addr, sz, MetaEntry::backend_owned(boundary));
                buddy.dealloc(pagemap, addr, sz);
            });
            self.large_cache.advance_epoch(|bits, addr| {
                let sz = 1usize << (usize::BITS - bits as u32);
                let boundary = pagemap.get(addr).is_boundary();
                pagemap.set_range(addr, sz, MetaEntry::backend_owned(boundary));
                buddy.dealloc(pagemap, addr, sz);
            });
            let addr = buddy.alloc(pagemap, size);
            if addr != 0 {
                return addr;
            }
        }
        0
    }

    /// Return a large object: cache it if small enough to be worth
    /// keeping, otherwise hand it straight back to the buddy backend
    /// (chunks larger than `MAX_CACHEABLE_SIZE` always bypass the decay
    /// cache).
    pub fn dealloc_large(&mut self, addr: usize, bits: u32) {
        let size = 1usize << (usize::BITS - bits);
        let boundary = self.pagemap.get(addr).is_boundary();
        self.pagemap.set_range(addr, size, MetaEntry::backend_owned(boundary));
        if size <= MAX_CACHEABLE_SIZE {
            unsafe { self.large_cache.put(bits as usize, addr) };
        } else {
            self.buddy.dealloc(self.pagemap, addr, size);
        }
    }

    /// Periodic maintenance: advance both decay caches by one epoch,
    /// returning whatever ages out to the buddy backend. Driven externally
    /// at roughly `config::DECAY_PERIOD_MS` cadence (see `allocator.rs`).
    pub fn decay(&mut self) {
        let pagemap = self.pagemap;
        let buddy = self.buddy;
        self.chunk_cache.advance_epoch(|order, addr| {
            crate::stat_inc!(decay_evictions);
            let size = MIN_CHUNK_SIZE << order;
            let boundary = pagemap.get(addr).is_boundary();
            pagemap.set_range(addr, size, MetaEntry::backend_owned(boundary));
            buddy.dealloc(pagemap, addr, size);
        });
        self.large_cache.advance_epoch(|bits, addr| {
            crate::stat_inc!(decay_evictions);
            let size = 1usize << (usize::BITS - bits as u32);
            let boundary = pagemap.get(addr).is_boundary();
            pagemap.set_range(addr, size, MetaEntry::backend_owned(boundary));
            buddy.dealloc(pagemap, addr, size);
        });
    }
}
