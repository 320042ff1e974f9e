//! Fatal-error taxonomy.
//!
//! Every condition in this enum is non-recoverable: there is no `Result`
//! to hand back to the caller, only a decision about how loudly to die.
//! See `Platform::fatal_error` for where these actually terminate the process.

use core::fmt;

/// Structured context for a fatal allocator error.
#[derive(Clone, Copy, Debug)]
pub enum FatalKind {
    /// The backend could not satisfy a reservation request.
    Oom,
    /// A free-list link failed its signature check.
    Corruption {
        expected: usize,
        actual: usize,
        curr_addr: usize,
        next_addr: usize,
    },
    /// An object was freed twice (caught by slab occupancy bookkeeping).
    DoubleFree { addr: usize },
    /// A pointer was passed to `dealloc`/`alloc_size` that this allocator
    /// never handed out (pagemap entry was the sentinel, or owner mismatch).
    NotOurs { addr: usize },
    /// A pointer or size violated an alignment invariant.
    Misaligned { addr: usize, align: usize },
    /// A `FlagLock` (or other non-reentrant lock) was acquired twice by the
    /// same thread.
    DoubleAcquire,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalKind::Oom => write!(f, "out of memory"),
            FatalKind::Corruption {
                expected,
                actual,
                curr_addr,
                next_addr,
            } => write!(
                f,
                "free-list corruption: expected signature {expected:#x}, got {actual:#x} \
                 (entry {curr_addr:#x} -> {next_addr:#x})"
            ),
            FatalKind::DoubleFree { addr } => write!(f, "double free at {addr:#x}"),
            FatalKind::NotOurs { addr } => write!(f, "pointer {addr:#x} not owned by this allocator"),
            FatalKind::Misaligned { addr, align } => {
                write!(f, "pointer {addr:#x} misaligned for alignment {align}")
            }
            FatalKind::DoubleAcquire => write!(f, "lock acquired twice by the same thread"),
        }
    }
}
