//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own locks provide the
//! ordering guarantees for correctness; these counters are purely for
//! monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = threadheap::stats::snapshot();
//! println!("allocs: {}", snap.alloc_count);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Global allocation stats ----
    /// Total calls to alloc with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to dealloc with a non-null pointer.
    pub dealloc_count: AtomicU64,
    /// Total calls to realloc (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to alloc.
    pub alloc_bytes: AtomicU64,

    // ---- Fast path / slow path breakdown ----
    /// Small allocations served straight off a thread's fast free list.
    pub local_cache_hits: AtomicU64,
    /// Small allocations that missed the fast list and had to refill from
    /// the bound core allocator.
    pub local_cache_misses: AtomicU64,
    /// Times a `CoreAlloc` carved a fresh slab out of the buddy backend or
    /// chunk decay cache (spec.md §4.5 `small_alloc_slow`).
    pub core_alloc_refills: AtomicU64,
    /// Large (non-slab) allocations served directly by a `CoreAlloc`.
    pub large_allocs: AtomicU64,

    // ---- Cross-thread reclamation ----
    /// Frees that landed on a thread's own bound core.
    pub local_frees: AtomicU64,
    /// Frees posted to another core's remote queue.
    pub remote_queue_posts: AtomicU64,
    /// Objects drained off a core's remote queue and returned to their slab.
    pub remote_queue_drains: AtomicU64,

    // ---- Buddy backend / decay ----
    /// Calls to `Platform::alloc` that actually reached the OS (buddy cache
    /// miss).
    pub buddy_os_allocs: AtomicU64,
    /// Bytes requested from the OS via `Platform::alloc`.
    pub buddy_os_alloc_bytes: AtomicU64,
    /// Times two buddy blocks coalesced on `dealloc`.
    pub buddy_coalesces: AtomicU64,
    /// Decay-cache entries aged out and returned to the buddy backend.
    pub decay_evictions: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            local_cache_hits: AtomicU64::new(0),
            local_cache_misses: AtomicU64::new(0),
            core_alloc_refills: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            local_frees: AtomicU64::new(0),
            remote_queue_posts: AtomicU64::new(0),
            remote_queue_drains: AtomicU64::new(0),
            buddy_os_allocs: AtomicU64::new(0),
            buddy_os_alloc_bytes: AtomicU64::new(0),
            buddy_coalesces: AtomicU64::new(0),
            decay_evictions: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between
/// loads. For monitoring purposes this is always sufficient.
///
/// Obtain a snapshot with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub local_cache_hits: u64,
    pub local_cache_misses: u64,
    pub core_alloc_refills: u64,
    pub large_allocs: u64,
    pub local_frees: u64,
    pub remote_queue_posts: u64,
    pub remote_queue_drains: u64,
    pub buddy_os_allocs: u64,
    pub buddy_os_alloc_bytes: u64,
    pub buddy_coalesces: u64,
    pub decay_evictions: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        local_cache_hits: s.local_cache_hits.load(Ordering::Relaxed),
        local_cache_misses: s.local_cache_misses.load(Ordering::Relaxed),
        core_alloc_refills: s.core_alloc_refills.load(Ordering::Relaxed),
        large_allocs: s.large_allocs.load(Ordering::Relaxed),
        local_frees: s.local_frees.load(Ordering::Relaxed),
        remote_queue_posts: s.remote_queue_posts.load(Ordering::Relaxed),
        remote_queue_drains: s.remote_queue_drains.load(Ordering::Relaxed),
        buddy_os_allocs: s.buddy_os_allocs.load(Ordering::Relaxed),
        buddy_os_alloc_bytes: s.buddy_os_alloc_bytes.load(Ordering::Relaxed),
        buddy_coalesces: s.buddy_coalesces.load(Ordering::Relaxed),
        decay_evictions: s.decay_evictions.load(Ordering::Relaxed),
    }
}
