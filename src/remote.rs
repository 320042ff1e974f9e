//! Per-owner remote-free queue (spec.md §4.6): the one mechanism by which a
//! thread deallocating an object it doesn't own gets that object back to
//! the `CoreAlloc` that does, without either side ever blocking.
//!
//! A classic MPSC linked list with a permanent sentinel. `back` is the
//! producer-side tail pointer: every sender updates it with a single
//! `exchange` and links the previous tail's next-word to whatever it just
//! published. `front` is the consumer-side cursor, always one step behind
//! the next object to hand out (it starts at, and forever trails,
//! `stub`'s own address) — exactly the shape a Michael & Scott-style
//! unbounded queue uses a dummy node for, so the very first enqueue needs
//! no special case. `front` and `back` live on separate cache lines since
//! producers hammer one and the single consumer only ever touches the
//! other.
//!
//! Both fields actually want to start at `&stub`, which a `const fn`
//! constructor can't compute (it doesn't have `self`'s address yet); they
//! lazily self-initialize to it on first use instead, gated on `back`
//! being the placeholder `0` no real node address ever takes.
//!
//! Every message is individually signed like a free object (spec.md §4.3),
//! using a single global obfuscation key rather than one per transfer,
//! since messages move between threads (spec.md §4.6).
//!
//! **Batched sends (ring message).** A run of consecutive frees bound for
//! the same destination (built up in `remote_cache.rs`) is posted as one
//! chain, but the head of that chain additionally carries a bit-packed
//! `(displacement, length)` pair in its *second* word — its first word
//! stays the ordinary intra-queue link. `open_free_ring` recovers that
//! pair without walking the chain, so a consumer can learn how many
//! objects a batch holds in one read instead of counting them one at a
//! time. See `pack_ring_header`/`open_free_ring` below.
//!
//! Ordering within the queue is otherwise irrelevant — `handle_message_queue`
//! (core_alloc.rs) re-homes every drained address to its slab via the
//! pagemap, so processing order doesn't affect correctness, only which
//! slab happens to wake up first.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MAX_CAPACITY_BITS;

/// Pads `T` out to its own cache line so producer writes to one field never
/// invalidate a reader's line for the other. `64` mirrors
/// `config::CACHELINE_SIZE` (can't reference the const in `repr(align)`,
/// which needs a literal).
#[repr(align(64))]
struct CachePadded<T>(T);

/// A process-wide-unique, per-`CoreAlloc` MPSC queue of deallocated object
/// addresses awaiting pickup by their owner.
pub struct RemoteAllocator {
    /// Consumer-owned cursor: the last node already handed out (or the
    /// stub, if nothing has been yet). The next object to dequeue is
    /// always `*(front as *const usize)`.
    front: CachePadded<AtomicUsize>,
    /// Producer-side tail. Every post is exactly one `exchange` here.
    back: CachePadded<AtomicUsize>,
    /// Permanent dummy node. Never freed, never handed to a caller; its
    /// own backing word is simply the first real link once anything has
    /// ever been posted.
    stub: AtomicUsize,
}

unsafe impl Send for RemoteAllocator {}
unsafe impl Sync for RemoteAllocator {}

impl RemoteAllocator {
    pub const fn new() -> Self {
        Self {
            front: CachePadded(AtomicUsize::new(0)),
            back: CachePadded(AtomicUsize::new(0)),
            stub: AtomicUsize::new(0),
        }
    }

    fn stub_addr(&self) -> usize {
        &self.stub as *const AtomicUsize as usize
    }

    /// Install `stub`'s real address into `front`/`back` the first time
    /// this queue is touched. `back == 0` is otherwise unreachable once
    /// initialized (every subsequent tail is a real node or the stub
    /// itself), so it safely doubles as the one-time init flag. Racing
    /// initializers all write the same value, so relaxed stores are fine.
    #[inline]
    fn ensure_init(&self) {
        if self.back.0.load(Ordering::Relaxed) == 0 {
            let stub = self.stub_addr();
            self.front.0.store(stub, Ordering::Relaxed);
            self.back.0.store(stub, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ensure_init();
        self.front.0.load(Ordering::Relaxed) == self.back.0.load(Ordering::Acquire)
    }

    /// Post a pre-built chain `head_addr -> ... -> tail_addr -> 0` (each
    /// link stored in the object's first word) in a single atomic
    /// exchange.
    ///
    /// # Safety
    /// Every object in the chain must be live and not referenced anywhere
    /// else once posted; `tail_addr`'s first word is overwritten by this
    /// call, and the previous tail's first word is overwritten once the
    /// exchange completes.
    pub unsafe fn post_chain(&self, head_addr: usize, tail_addr: usize) {
        debug_assert!(head_addr != 0 && tail_addr != 0);
        self.ensure_init();
        unsafe { *(tail_addr as *mut usize) = 0 };
        let prev = self.back.0.swap(tail_addr, Ordering::AcqRel);
        // `prev` is always a valid node — a real object or the stub —
        // once initialized, so this link is unconditional. No empty-queue
        // special case is needed: the stub already plays that role.
        unsafe { *(prev as *mut usize) = head_addr };
    }

    /// Post a single object.
    ///
    /// # Safety
    /// Same requirements as `post_chain` with `head_addr == tail_addr ==
    /// addr`.
    #[inline]
    pub unsafe fn post_one(&self, addr: usize) {
        unsafe { self.post_chain(addr, addr) };
    }

    /// Start draining the queue up to whatever `back` currently is. Only
    /// the owning `CoreAlloc` calls this, but every operation here is safe
    /// under concurrent `post_chain` calls from other threads.
    pub fn drain(&self) -> RemoteDrainIter<'_> {
        self.ensure_init();
        let target = self.back.0.load(Ordering::Acquire);
        RemoteDrainIter { queue: self, target }
    }
}

impl Default for RemoteAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes a drained remote queue one object at a time, stopping at the
/// `back` snapshotted when draining began.
pub struct RemoteDrainIter<'a> {
    queue: &'a RemoteAllocator,
    target: usize,
}

impl Iterator for RemoteDrainIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let front = self.queue.front.0.load(Ordering::Relaxed);
        if front == self.target {
            return None;
        }
        let next = unsafe { *(front as *const usize) };
        if next == 0 {
            // A sender already won the `back` exchange past `front` but
            // hasn't finished linking `front`'s successor yet. Stop early
            // rather than spin; the object surfaces on the next drain
            // (spec.md §4.6's allowed non-linearisability).
            return None;
        }
        self.queue.front.0.store(next, Ordering::Relaxed);
        Some(next)
    }
}

/// Pack a same-destination batch's `(displacement, length)` pair into the
/// *second* word of `head_addr` (its first word stays the queue's own link
/// once posted). `length` is the number of objects in the ring including
/// the head itself; `tail_addr` is the last object in that same chain.
///
/// # Safety
/// `head_addr` must be at least two words wide (true of every size class
/// this allocator serves — the smallest object holds an intrusive
/// free-list link already) and not yet posted to any `RemoteAllocator`.
pub unsafe fn pack_ring_header(head_addr: usize, tail_addr: usize, length: u32) {
    debug_assert!(length > 0);
    debug_assert!((length as usize) < (1usize << MAX_CAPACITY_BITS));
    let displacement = tail_addr.wrapping_sub(head_addr);
    debug_assert!(displacement < (1usize << (usize::BITS - MAX_CAPACITY_BITS)));
    let header = (displacement << MAX_CAPACITY_BITS) | (length as usize);
    unsafe { *((head_addr + core::mem::size_of::<usize>()) as *mut usize) = header };
}

/// Recover `(tail_addr, length)` from a ring header previously packed at
/// `head_addr` by `pack_ring_header`.
///
/// # Safety
/// `head_addr` must be the head of a chain `pack_ring_header` was called
/// on, read before its second word is overwritten for any other purpose.
pub unsafe fn open_free_ring(head_addr: usize) -> (usize, u32) {
    let header = unsafe { *((head_addr + core::mem::size_of::<usize>()) as *const usize) };
    let length = (header & ((1usize << MAX_CAPACITY_BITS) - 1)) as u32;
    let displacement = header >> MAX_CAPACITY_BITS;
    (head_addr.wrapping_add(displacement), length)
}
