//! Build-time and feature-derived configuration.
//!
//! Layout constants ([`MIN_CHUNK_BITS`] and friends) come from `threadheap.toml`
//! via `build.rs`; mitigation flags come from Cargo features. Both land here
//! so the rest of the crate has one place to ask "how is this build configured".

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Smallest allocation size: two pointers, so every object can hold an
/// intrusive free-list link.
pub const MIN_ALLOC_SIZE: usize = 2 * core::mem::size_of::<usize>();

/// `1 << MIN_CHUNK_BITS`: the smallest chunk the buddy backend hands out,
/// and the slab size for the smallest size classes.
pub const MIN_CHUNK_SIZE: usize = 1 << MIN_CHUNK_BITS;

/// `1 << MAX_SMALL_SIZECLASS_BITS`: the largest size served by the
/// small-object pipeline. Above this, allocations go straight to the buddy
/// backend as large objects.
pub const MAX_SMALL_SIZE: usize = 1 << MAX_SMALL_SIZECLASS_BITS;

/// Remote-dealloc cache capacity before a flush is forced, in bytes.
pub const REMOTE_CACHE: usize = MIN_CHUNK_SIZE;

/// Cache line size assumed for false-sharing padding.
pub const CACHELINE_SIZE: usize = 64;

/// Width, in bits, of the ring-length field packed into a remote-queue ring
/// message's header word (see `remote::pack_ring_header`). The remaining
/// high bits hold the displacement to the ring's tail. `REMOTE_CACHE` bounds
/// how many objects a single sender can ever batch into one ring (its byte
/// budget divided by the smallest object size), which is many orders of
/// magnitude under what 20 bits can hold.
pub const MAX_CAPACITY_BITS: u32 = 20;

/// `1 << MAX_CACHEABLE_BITS`: chunks larger than this bypass the decay cache
/// and are returned to the OS immediately on free.
pub const MAX_CACHEABLE_SIZE: usize = 1usize << MAX_CACHEABLE_BITS;

/// Mitigation and behavior flags, shared by every `CoreAlloc` and the `Pool`.
/// Fields mirror the Cargo features of the same name so call sites check a
/// plain bool instead of sprinkling `cfg!` everywhere.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub random_initial: bool,
    pub random_extra_slab: bool,
    pub reuse_lifo: bool,
    pub random_larger_thresholds: bool,
    pub freelist_teardown_validate: bool,
    pub clear_meta: bool,
    pub sanity_checks: bool,
    pub cheri_checks: bool,
    pub pal_enforce_access: bool,
}

impl Config {
    /// Built from the Cargo features this crate was compiled with.
    pub const fn from_features() -> Self {
        Config {
            random_initial: cfg!(feature = "random_initial"),
            random_extra_slab: cfg!(feature = "random_extra_slab"),
            reuse_lifo: cfg!(feature = "reuse_lifo"),
            random_larger_thresholds: cfg!(feature = "random_larger_thresholds"),
            freelist_teardown_validate: cfg!(feature = "freelist_teardown_validate"),
            clear_meta: cfg!(feature = "clear_meta"),
            sanity_checks: cfg!(feature = "sanity_checks"),
            cheri_checks: cfg!(feature = "cheri_checks"),
            pal_enforce_access: cfg!(feature = "pal_enforce_access"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_features()
    }
}

/// The configuration this build was compiled with. `CoreAlloc::new` and
/// `Pool::new` read this instead of threading a `Config` through every call.
pub static CONFIG: Config = Config::from_features();
