//! CPU-architecture primitives, isolated behind a trait so the core
//! allocator logic never hardcodes an intrinsic directly.

/// Architecture-specific helpers used on the hot path and at fatal-error
/// sites. A single zero-sized type implements this for the host target;
/// there is no multi-target dispatch, the trait exists so call sites read
/// `Arch::pause()` instead of `core::hint::spin_loop()` and stay swappable.
pub trait Architecture {
    /// Hint to the CPU that this is a spin-wait loop.
    fn pause();

    /// Best-effort prefetch of `addr` for a near-future read.
    ///
    /// # Safety
    /// `addr` need not be valid; prefetch is always safe to issue, but the
    /// trait is marked unsafe-free by convention since a wrong `addr` just
    /// wastes a cache line rather than faulting.
    fn prefetch(addr: *const u8);

    /// A coarse, non-monotonic cycle/tick counter used only to perturb
    /// entropy seeding. Not suitable for timing.
    fn cycle_counter() -> u64;

    /// Terminate the process after a fatal allocator error has been
    /// reported. Never returns.
    fn trap() -> !;
}

/// The architecture this crate is built for.
pub struct Arch;

impl Architecture for Arch {
    #[inline(always)]
    fn pause() {
        core::hint::spin_loop();
    }

    #[inline(always)]
    fn prefetch(addr: *const u8) {
        #[cfg(all(target_arch = "x86_64", not(miri)))]
        unsafe {
            core::arch::x86_64::_mm_prefetch(addr as *const i8, core::arch::x86_64::_MM_HINT_T0);
        }
        #[cfg(not(all(target_arch = "x86_64", not(miri))))]
        {
            let _ = addr;
        }
    }

    #[inline(always)]
    fn cycle_counter() -> u64 {
        #[cfg(all(target_arch = "x86_64", not(miri)))]
        unsafe {
            core::arch::x86_64::_rdtsc()
        }
        #[cfg(not(all(target_arch = "x86_64", not(miri))))]
        {
            // Fallback: address of a stack local still varies run to run
            // under ASLR and gives us *something* to fold into the seed.
            let x: u8 = 0;
            &x as *const u8 as u64
        }
    }

    fn trap() -> ! {
        // Under `cargo test`, unwind instead of aborting the whole process
        // so a single fatal-path test (e.g. corruption detection) can
        // observe the failure via `catch_unwind` without taking every other
        // test in the binary down with it.
        #[cfg(test)]
        {
            panic!("threadheap: fatal trap");
        }
        #[cfg(all(not(test), feature = "std"))]
        {
            std::process::abort();
        }
        #[cfg(all(not(test), not(feature = "std")))]
        {
            // No libc/std to call abort() through. Spin forever rather than
            // return from a `-> !` function; a debugger or watchdog is the
            // only thing that observes a bare-metal target past this point.
            loop {
                core::hint::spin_loop();
            }
        }
    }
}
