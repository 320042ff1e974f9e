//! Windows virtual memory backend using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const MEM_DECOMMIT: u32 = 0x4000;
const PAGE_READWRITE: u32 = 0x04;

// Windows allocation granularity is 64 KiB.
const ALLOC_GRANULARITY: usize = 65536;

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;
}

#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// `VirtualAlloc` only guarantees `ALLOC_GRANULARITY` (64 KiB) alignment, which
/// isn't enough once a caller asks for a bigger one (e.g. `OWNER_ALIGN`, or a
/// buddy chunk whose own size is its alignment). Unlike mmap, there's no way
/// to carve a sub-range back out of a reservation: `MEM_RELEASE` only ever
/// frees an entire region at its original base address. So the trick
/// mimalloc/snmalloc use on Windows is: reserve oversized to find a free
/// window, release it, then immediately reserve again at the aligned address
/// inside that window. Another thread can race in and steal that address
/// between the two calls, so retry a bounded number of times before giving up.
pub unsafe fn alloc(size: usize, align: usize) -> *mut u8 {
    let align = align.max(ALLOC_GRANULARITY);
    let alloc_size = round_up(size, ALLOC_GRANULARITY);
    if align <= ALLOC_GRANULARITY {
        let ptr = unsafe {
            virtual_alloc(core::ptr::null_mut(), alloc_size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        return ptr as *mut u8;
    }

    const MAX_ATTEMPTS: u32 = 8;
    for _ in 0..MAX_ATTEMPTS {
        let probe_size = alloc_size + align;
        let probe = unsafe { virtual_alloc(core::ptr::null_mut(), probe_size, MEM_RESERVE, PAGE_READWRITE) };
        if probe.is_null() {
            return core::ptr::null_mut();
        }
        let probe_addr = probe as usize;
        let aligned_addr = round_up(probe_addr, align);
        unsafe { virtual_free(probe, 0, MEM_RELEASE) };

        let ptr = unsafe {
            virtual_alloc(
                aligned_addr as *mut c_void,
                alloc_size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if !ptr.is_null() {
            return ptr as *mut u8;
        }
        // Another thread claimed `aligned_addr` between release and reserve; retry.
    }
    core::ptr::null_mut()
}

pub unsafe fn dealloc(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases the entire allocation).
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    unsafe { virtual_free(ptr as *mut c_void, size, MEM_DECOMMIT) };
}

pub unsafe fn recommit(ptr: *mut u8, size: usize) {
    unsafe {
        virtual_alloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE)
    };
}
