//! Pagemap: a flat, radix-indexed array mapping every chunk-aligned address
//! to a [`MetaEntry`].
//!
//! Keyed by `addr >> MIN_CHUNK_BITS` ("chunk id") rather than by OS page, so
//! one entry covers one `MIN_CHUNK_SIZE` span regardless of how that span is
//! currently used (unowned, a frontend slab, or held by the backend). A
//! three-level radix tree (root/mid/leaf) over two-word bit-packed leaves,
//! grown lazily one node at a time as new address ranges come into use.
//!
//! Reads never take a lock and never fail: an address whose radix path isn't
//! committed yet reads back [`MetaEntry::UNOWNED`], which is bitwise the
//! zero entry, so an all-zero (not-yet-touched) leaf page already reads as
//! "unowned" with no extra branch. Pagemap writes carry no ordering
//! guarantee with respect to reads by other threads; every access here uses
//! `Relaxed`.

use crate::config::MIN_CHUNK_BITS;
use crate::platform::Platform;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 11;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = MID_LEN - 1;
const LEAF_MASK: usize = LEAF_LEN - 1;

/// Bit 0 of the slab word: set when this chunk is the first chunk of a
/// backend allocation, blocking the buddy allocator from coalescing it with
/// a lower-addressed "buddy" that in fact belongs to a different OS mapping.
const BOUNDARY_BIT: usize = 1;

/// Bit 0 of the owner word: set when this chunk is currently held by the
/// buddy backend (free or mid-carve) rather than a frontend `CoreAlloc`.
const BACKEND_OWNED_BIT: usize = 1;

/// Bits [1, SIZECLASS_BITS] of the owner word hold the flat size-class id
/// (see `size_class::SizeClass::to_raw`). `CoreAlloc` instances are carved
/// from chunk-aligned backend memory, so their low `MIN_CHUNK_BITS` bits
/// are free for this without colliding with the pointer.
const SIZECLASS_BITS: u32 = 16;
const SIZECLASS_SHIFT: usize = 1;
const SIZECLASS_MASK: usize = (1 << SIZECLASS_BITS) - 1;

/// Minimum alignment anything whose address gets packed into an owner word
/// (i.e. every `CoreAlloc`) must have, so its low bits never collide with
/// the packed size-class field above.
pub const OWNER_ALIGN: usize = 1usize << (SIZECLASS_BITS as usize + SIZECLASS_SHIFT);

/// A two-word pagemap entry: a slab word (slab address + boundary bit) and
/// an owner word (owning `CoreAlloc` address + size class + backend-owned
/// bit).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaEntry {
    slab_word: usize,
    owner_word: usize,
}

impl MetaEntry {
    /// The sentinel value every unmapped/untouched address reads back as.
    pub const UNOWNED: MetaEntry = MetaEntry { slab_word: 0, owner_word: 0 };

    #[inline]
    pub fn backend_owned(boundary: bool) -> Self {
        MetaEntry {
            slab_word: if boundary { BOUNDARY_BIT } else { 0 },
            owner_word: BACKEND_OWNED_BIT,
        }
    }

    #[inline]
    pub fn frontend(owner_addr: usize, slab_addr: usize, sizeclass_raw: usize, boundary: bool) -> Self {
        debug_assert_eq!(owner_addr & (OWNER_ALIGN - 1), 0, "CoreAlloc must be OWNER_ALIGN-aligned");
        debug_assert_eq!(slab_addr & BOUNDARY_BIT, 0, "SlabMeta must be at least 2-byte aligned");
        MetaEntry {
            slab_word: slab_addr | if boundary { BOUNDARY_BIT } else { 0 },
            owner_word: owner_addr | (sizeclass_raw << SIZECLASS_SHIFT) & !BACKEND_OWNED_BIT,
        }
    }

    #[inline]
    pub fn is_unowned(&self) -> bool {
        *self == Self::UNOWNED
    }

    #[inline]
    pub fn is_backend_owned(&self) -> bool {
        self.owner_word & BACKEND_OWNED_BIT != 0
    }

    #[inline]
    pub fn is_boundary(&self) -> bool {
        self.slab_word & BOUNDARY_BIT != 0
    }

    /// Raw address of the owning `CoreAlloc`, or 0 if unowned/backend-owned.
    #[inline]
    pub fn owner_addr(&self) -> usize {
        self.owner_word & !SIZECLASS_MASK.wrapping_shl(SIZECLASS_SHIFT as u32) & !BACKEND_OWNED_BIT
    }

    /// Raw address of the `SlabMeta`, or 0 if unowned/backend-owned.
    #[inline]
    pub fn slab_addr(&self) -> usize {
        self.slab_word & !BOUNDARY_BIT
    }

    #[inline]
    pub fn sizeclass_raw(&self) -> usize {
        (self.owner_word >> SIZECLASS_SHIFT) & SIZECLASS_MASK
    }

    fn to_words(self) -> (usize, usize) {
        (self.slab_word, self.owner_word)
    }

    fn from_words(slab_word: usize, owner_word: usize) -> Self {
        MetaEntry { slab_word, owner_word }
    }
}

#[repr(C)]
struct Leaf {
    slab_words: [AtomicUsize; LEAF_LEN],
    owner_words: [AtomicUsize; LEAF_LEN],
}

#[repr(C)]
struct Mid {
    children: [AtomicPtr<Leaf>; MID_LEN],
}

/// The process-wide pagemap. One static instance backs every `CoreAlloc`
/// and the buddy backend.
pub struct PageMap {
    root: [AtomicPtr<Mid>; ROOT_LEN],
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: a null AtomicPtr<T> is bitwise all-zero.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self { root: null_atomic_array!(ROOT_LEN, Mid) }
    }

    #[inline]
    fn chunk_id(addr: usize) -> usize {
        addr >> MIN_CHUNK_BITS
    }

    /// Look up the meta-entry covering `addr`. Never fails; an address
    /// whose radix path hasn't been committed returns `MetaEntry::UNOWNED`.
    #[inline]
    pub fn get(&self, addr: usize) -> MetaEntry {
        let id = Self::chunk_id(addr);
        let root_idx = id >> ROOT_SHIFT;
        let mid_idx = (id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = id & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return MetaEntry::UNOWNED;
        }
        let mid = self.root[root_idx].load(Ordering::Relaxed);
        if mid.is_null() {
            return MetaEntry::UNOWNED;
        }
        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Relaxed) };
        if leaf.is_null() {
            return MetaEntry::UNOWNED;
        }
        let slab_word = unsafe { (*leaf).slab_words[leaf_idx].load(Ordering::Relaxed) };
        let owner_word = unsafe { (*leaf).owner_words[leaf_idx].load(Ordering::Relaxed) };
        MetaEntry::from_words(slab_word, owner_word)
    }

    /// Replicate `entry` across every chunk-granularity slot covering
    /// `[addr, addr + len)`. Used both to install a single chunk's entry
    /// and, for large allocations, to replicate across the whole span so
    /// interior-pointer lookups succeed.
    ///
    /// The boundary bit is never replicated: only the first chunk (`addr`
    /// itself) can carry it, since it marks the lowest address of a single
    /// backend allocation — every chunk after it is interior to that same
    /// allocation and is never a boundary on its own.
    pub fn set_range(&self, addr: usize, len: usize, entry: MetaEntry) {
        let start = Self::chunk_id(addr);
        let count = len.div_ceil(1 << MIN_CHUNK_BITS).max(1);
        let (slab_word, owner_word) = entry.to_words();
        let interior_slab_word = slab_word & !BOUNDARY_BIT;
        for i in 0..count {
            let word = if i == 0 { slab_word } else { interior_slab_word };
            self.set_one(start + i, word, owner_word);
        }
    }

    #[inline]
    pub fn set(&self, addr: usize, entry: MetaEntry) {
        let (slab_word, owner_word) = entry.to_words();
        self.set_one(Self::chunk_id(addr), slab_word, owner_word);
    }

    fn set_one(&self, id: usize, slab_word: usize, owner_word: usize) {
        let root_idx = id >> ROOT_SHIFT;
        let mid_idx = (id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = id & LEAF_MASK;
        assert!(root_idx < ROOT_LEN, "address out of pagemap range");

        let mut mid = self.root[root_idx].load(Ordering::Relaxed);
        if mid.is_null() {
            mid = self.alloc_mid();
            match self.root[root_idx].compare_exchange(
                ptr::null_mut(),
                mid,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {}
                Err(existing) => {
                    unsafe { crate::platform::HostPlatform::dealloc(mid.cast(), core::mem::size_of::<Mid>()) };
                    mid = existing;
                }
            }
        }
        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Relaxed) };
        if leaf.is_null() {
            leaf = self.alloc_leaf();
            match unsafe { (*mid).children[mid_idx].compare_exchange(
                ptr::null_mut(),
                leaf,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) } {
                Ok(_) => {}
                Err(existing) => {
                    unsafe { crate::platform::HostPlatform::dealloc(leaf.cast(), core::mem::size_of::<Leaf>()) };
                    leaf = existing;
                }
            }
        }
        unsafe {
            (*leaf).slab_words[leaf_idx].store(slab_word, Ordering::Relaxed);
            (*leaf).owner_words[leaf_idx].store(owner_word, Ordering::Relaxed);
        }
    }

    /// Ensure the radix path down to `addr` is committed, without changing
    /// its entry. The backend calls this once up front for a freshly
    /// reserved region so later lookups are pure reads.
    pub fn register_range(&self, addr: usize, len: usize) {
        let start = Self::chunk_id(addr);
        let count = len.div_ceil(1 << MIN_CHUNK_BITS).max(1);
        for i in 0..count {
            let entry = self.get(addr + (i << MIN_CHUNK_BITS));
            let (slab_word, owner_word) = entry.to_words();
            self.set_one(start + i, slab_word, owner_word);
        }
    }

    fn alloc_mid(&self) -> *mut Mid {
        let size = core::mem::size_of::<Mid>();
        unsafe { crate::platform::HostPlatform::alloc(size, core::mem::align_of::<Mid>()).cast() }
    }

    fn alloc_leaf(&self) -> *mut Leaf {
        let size = core::mem::size_of::<Leaf>();
        unsafe { crate::platform::HostPlatform::alloc(size, core::mem::align_of::<Leaf>()).cast() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_address_is_unowned() {
        let map = PageMap::new();
        assert!(map.get(0).is_unowned());
        assert!(map.get(0xdead_beef_0000).is_unowned());
    }

    #[test]
    fn set_then_get_round_trips() {
        let map = PageMap::new();
        let addr = 0x7f00_0000_0000usize;
        let entry = MetaEntry::frontend(0x10_0000, 0x20_0000, 5, false);
        map.set(addr, entry);
        assert_eq!(map.get(addr), entry);
        assert!(map.get(addr + (1 << MIN_CHUNK_BITS)).is_unowned());
    }

    #[test]
    fn set_range_replicates() {
        let map = PageMap::new();
        let addr = 0x8000_0000_0000usize;
        let entry = MetaEntry::backend_owned(true);
        map.set_range(addr, 4 << MIN_CHUNK_BITS, entry);
        for i in 0..4 {
            assert_eq!(map.get(addr + (i << MIN_CHUNK_BITS)), entry);
        }
        assert!(map.get(addr + (4 << MIN_CHUNK_BITS)).is_unowned());
    }

    #[test]
    fn frontend_entry_recovers_fields() {
        let owner = 0x1234_0000usize;
        let slab = 0x5678_0000usize;
        let entry = MetaEntry::frontend(owner, slab, 7, true);
        assert_eq!(entry.owner_addr(), owner);
        assert_eq!(entry.slab_addr(), slab);
        assert_eq!(entry.sizeclass_raw(), 7);
        assert!(entry.is_boundary());
        assert!(!entry.is_backend_owned());
    }

    #[test]
    fn backend_owned_is_not_unowned() {
        let entry = MetaEntry::backend_owned(false);
        assert!(entry.is_backend_owned());
        assert!(!entry.is_unowned());
    }

    #[test]
    fn high_address_exercises_all_radix_levels() {
        let map = PageMap::new();
        let addr = (1usize << 44) + (1 << 30) + (1 << 20);
        let entry = MetaEntry::frontend(1 << 20, 1 << 20, 1, false);
        map.set(addr, entry);
        assert_eq!(map.get(addr), entry);
    }
}
