//! The buddy chunk backend: the allocator underneath every `CoreAlloc` and
//! slab, responsible for carving chunk-aligned, power-of-two sized regions
//! out of OS memory and coalescing them back together on return.
//!
//! Free blocks of a given order are kept in a plain intrusive LIFO (the
//! block's own first word doubles as the `next` link, since a free block
//! has no other use for its memory). Buddies are tested for coalescability
//! by a linear scan of the buddy's order-list under the allocator's single
//! lock rather than an auxiliary bitmap or a red-black tree keyed by
//! address: every order's free list is short in practice (bounded by how
//! fragmented the address space currently is) and this crate can't
//! allocate a tree node without calling back into itself.
//!
//! A block is marked a *boundary* in the pagemap when it's the lowest
//! address of a single OS reservation; coalescing never crosses a
//! boundary, since the "buddy" on the other side of one might belong to an
//! entirely separate mapping that happens to sit there by chance.

use crate::config::MIN_CHUNK_SIZE;
use crate::error::FatalKind;
use crate::pagemap::{MetaEntry, PageMap};
use crate::platform::{HostPlatform, Platform};
use crate::sync::SpinMutex;
use core::ptr;

/// Orders `0..NUM_ORDERS` cover block sizes from `MIN_CHUNK_SIZE` up to
/// `MIN_CHUNK_SIZE << (NUM_ORDERS - 1)`, comfortably past any allocation
/// this crate will ever see on a 64-bit address space.
pub(crate) const NUM_ORDERS: usize = 48;

struct FreeNode {
    next: *mut FreeNode,
}

struct BuddyState {
    free_lists: [*mut FreeNode; NUM_ORDERS],
}

unsafe impl Send for BuddyState {}

/// The process-wide buddy backend. One static instance, shared by every
/// `CoreAlloc` (each of which sits its own decay cache in front of it).
pub struct BuddyAllocator {
    state: SpinMutex<BuddyState>,
}

impl BuddyAllocator {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self { state: SpinMutex::new(BuddyState { free_lists: [ptr::null_mut(); NUM_ORDERS] }) }
    }

    pub(crate) fn order_for_size(size: usize) -> u32 {
        debug_assert!(size > 0);
        let chunks = size.div_ceil(MIN_CHUNK_SIZE).next_power_of_two().max(1);
        chunks.trailing_zeros()
    }

    /// Reserve a chunk-aligned region of at least `size` bytes. Splits a
    /// larger cached block if one is free; otherwise requests a fresh,
    /// exactly-sized mapping from the platform and marks it as a boundary.
    pub fn alloc(&self, pagemap: &PageMap, size: usize) -> usize {
        let order = Self::order_for_size(size);
        self.alloc_order(pagemap, order)
    }

    fn alloc_order(&self, pagemap: &PageMap, order: u32) -> usize {
        let order = order as usize;
        assert!(order < NUM_ORDERS, "requested allocation exceeds the largest supported order");

        let mut guard = self.state.lock();
        let mut found = None;
        for o in order..NUM_ORDERS {
            if !guard.free_lists[o].is_null() {
                found = Some(o);
                break;
            }
        }

        let (addr, boundary) = match found {
            Some(o) => {
                let block = guard.free_lists[o];
                guard.free_lists[o] = unsafe { (*block).next };
                let addr = block as usize;
                // This block came out of the free list as-is, so its own
                // boundary status (set once, whenever it was first reserved
                // from the OS) is still whatever the pagemap already has on
                // file for it — never assume a cached/split block starts a
                // fresh backend allocation.
                let boundary = pagemap.get(addr).is_boundary();
                // Split the block down to `order`, pushing each upper half
                // onto its own order's free list as we go.
                let mut cur = o;
                while cur > order {
                    cur -= 1;
                    let half = MIN_CHUNK_SIZE << cur;
                    let sibling = (addr + half) as *mut FreeNode;
                    unsafe { (*sibling).next = guard.free_lists[cur] };
                    guard.free_lists[cur] = sibling;
                }
                drop(guard);
                (addr, boundary)
            }
            None => {
                drop(guard);
                let bytes = MIN_CHUNK_SIZE << order;
                crate::stat_inc!(buddy_os_allocs);
                crate::stat_add!(buddy_os_alloc_bytes, bytes);
                let addr = unsafe { HostPlatform::alloc(bytes, bytes) } as usize;
                if addr == 0 {
                    // Platform OOM on a user-driven request propagates as a
                    // null return all the way to `alloc` rather than
                    // aborting; metadata allocations elsewhere in this crate
                    // (SlabMeta, CoreAlloc, pagemap nodes) still treat OOM as
                    // fatal, since there's no caller to hand a null back to
                    // at that depth.
                    return 0;
                }
                pagemap.register_range(addr, bytes);
                // A brand new OS mapping: its lowest address is the one and
                // only boundary chunk for this whole reservation.
                (addr, true)
            }
        };
        pagemap.set_range(addr, MIN_CHUNK_SIZE << order, MetaEntry::backend_owned(boundary));
        addr
    }

    /// Return a previously-allocated `(addr, size)` region, coalescing with
    /// its buddy as far up as possible.
    pub fn dealloc(&self, pagemap: &PageMap, addr: usize, size: usize) {
        let order = Self::order_for_size(size);
        self.dealloc_order(pagemap, addr, order);
    }

    fn dealloc_order(&self, pagemap: &PageMap, addr: usize, order: u32) {
        let mut addr = addr;
        let mut order = order as usize;
        let mut guard = self.state.lock();

        loop {
            if order + 1 >= NUM_ORDERS {
                break;
            }
            let block_size = MIN_CHUNK_SIZE << order;
            let buddy_addr = addr ^ block_size;
            // Never merge across a reservation boundary: a buddy that is
            // itself the base of a separate backend allocation might not be
            // contiguous with this block in the way the address arithmetic
            // suggests. Being a boundary ourselves doesn't block merging
            // *upward* into a non-boundary buddy that belongs to the same
            // mapping we started.
            if pagemap.get(buddy_addr).is_boundary() {
                break;
            }
            if !Self::try_take(&mut guard.free_lists[order], buddy_addr) {
                break;
            }
            crate::stat_inc!(buddy_coalesces);
            addr = addr.min(buddy_addr);
            order += 1;
        }

        let was_boundary = pagemap.get(addr).is_boundary();
        let node = addr as *mut FreeNode;
        unsafe { (*node).next = guard.free_lists[order] };
        guard.free_lists[order] = node;
        drop(guard);

        pagemap.set_range(addr, MIN_CHUNK_SIZE << order, MetaEntry::backend_owned(was_boundary));
    }

    /// Remove `addr` from `free_lists[order]` if it's present there,
    /// reporting whether it was found (i.e. whether the buddy was actually
    /// free and available to coalesce with).
    fn try_take(list: &mut *mut FreeNode, addr: usize) -> bool {
        let target = addr as *mut FreeNode;
        if list.is_null() {
            return false;
        }
        if *list == target {
            *list = unsafe { (*target).next };
            return true;
        }
        let mut prev = *list;
        loop {
            let next = unsafe { (*prev).next };
            if next.is_null() {
                return false;
            }
            if next == target {
                unsafe { (*prev).next = (*next).next };
                return true;
            }
            prev = next;
        }
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}
