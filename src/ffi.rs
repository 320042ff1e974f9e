//! C-ABI exports for external linking (e.g. from benches or a C harness).
//!
//! Gated behind `features = ["ffi"]`. Built as part of the staticlib.
//! With the `testing` feature, export names are prefixed by which
//! thread-binding tier backs them, so a test harness can link all three
//! variants into one binary and compare:
//!   - `nightly` → `threadheap_nightly_*`
//!   - `std`     → `threadheap_std_*`
//!   - neither   → `threadheap_nostd_*`
//! Without `testing`, exports plain `threadheap_*` names.

use crate::allocator::ThreadHeap;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: ThreadHeap = ThreadHeap;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(all(feature = "testing", feature = "nightly"), unsafe(export_name = "threadheap_nightly_alloc"))]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "threadheap_std_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "threadheap_nostd_alloc")
)]
pub unsafe extern "C" fn threadheap_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size.max(1), align.max(1)) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(all(feature = "testing", feature = "nightly"), unsafe(export_name = "threadheap_nightly_dealloc"))]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "threadheap_std_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "threadheap_nostd_dealloc")
)]
pub unsafe extern "C" fn threadheap_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size.max(1), align.max(1)) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(all(feature = "testing", feature = "nightly"), unsafe(export_name = "threadheap_nightly_realloc"))]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "threadheap_std_realloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "threadheap_nostd_realloc")
)]
pub unsafe extern "C" fn threadheap_realloc(ptr: *mut u8, size: usize, align: usize, new_size: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size.max(1), align.max(1)) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(all(feature = "testing", feature = "nightly"), unsafe(export_name = "threadheap_nightly_alloc_size"))]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "threadheap_std_alloc_size")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "threadheap_nostd_alloc_size")
)]
pub unsafe extern "C" fn threadheap_alloc_size(ptr: *mut u8) -> usize {
    ALLOC.alloc_size(ptr)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(all(feature = "testing", feature = "nightly"), unsafe(export_name = "threadheap_nightly_debug_teardown"))]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "threadheap_std_debug_teardown")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "threadheap_nostd_debug_teardown")
)]
pub extern "C" fn threadheap_debug_teardown() {
    ALLOC.debug_teardown();
}
