//! Miri-compatible backend using `std::alloc` instead of real OS syscalls
//! (Miri can't execute mmap/VirtualAlloc), so unsafe pointer logic in the
//! allocator internals can still be checked under it.
//!
//! `std::alloc::dealloc` requires the exact `Layout` used at the matching
//! `alloc` call, but `Platform::dealloc` only carries `size` back (the real
//! mmap/VirtualAlloc backends don't need `align` to free a range). A small
//! header just before the returned pointer remembers the `align` the
//! caller asked for so `dealloc` can reconstruct the same `Layout`.

extern crate alloc;

use core::alloc::Layout;
use core::mem::size_of;

const HEADER_ALIGN: usize = size_of::<usize>();

unsafe fn layout_for(size: usize, align: usize) -> (Layout, usize) {
    let header_align = align.max(HEADER_ALIGN);
    let offset = header_align;
    let total = size.checked_add(offset).expect("allocation size overflow");
    (Layout::from_size_align(total, header_align).unwrap(), offset)
}

pub unsafe fn alloc(size: usize, align: usize) -> *mut u8 {
    let (layout, offset) = unsafe { layout_for(size, align) };
    let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return core::ptr::null_mut();
    }
    let data = unsafe { base.add(offset) };
    unsafe { (data.sub(HEADER_ALIGN) as *mut usize).write(align) };
    data
}

pub unsafe fn dealloc(ptr: *mut u8, size: usize) {
    let align = unsafe { *(ptr.sub(HEADER_ALIGN) as *const usize) };
    let (layout, offset) = unsafe { layout_for(size, align) };
    let base = unsafe { ptr.sub(offset) };
    unsafe { alloc::alloc::dealloc(base, layout) };
}
