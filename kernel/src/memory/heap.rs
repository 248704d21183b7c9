//! Kernel Heap Allocator
//!
//! Free-list allocator with coalescing (linked_list_allocator) registered
//! as the global allocator, plus sized wrappers for callers that track
//! their own layouts.

use core::alloc::Layout;
use linked_list_allocator::LockedHeap;

/// Global kernel heap allocator
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(test)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Minimum alignment handed out by the sized wrappers
const MIN_ALIGN: usize = 8;

/// Initialize kernel heap at specified address with given size
pub fn init_at(heap_start: usize, heap_size: usize) {
    unsafe {
        ALLOCATOR.lock().init(heap_start as *mut u8, heap_size);
    }
}

/// Used heap space in bytes
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}

/// Free heap space in bytes
pub fn free() -> usize {
    ALLOCATOR.lock().free()
}

/// Allocate `size` bytes with the default alignment. Null on failure.
pub fn allocate(size: usize) -> Option<*mut u8> {
    allocate_aligned(size, MIN_ALIGN)
}

/// Allocate `size` bytes aligned to `align`. Null on failure.
pub fn allocate_aligned(size: usize, align: usize) -> Option<*mut u8> {
    let layout = Layout::from_size_align(size, align.max(MIN_ALIGN)).ok()?;
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Allocate zeroed memory
pub fn allocate_zeroed(size: usize) -> Option<*mut u8> {
    let layout = Layout::from_size_align(size, MIN_ALIGN).ok()?;
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Deallocate memory
///
/// # Safety
/// - `ptr` must have been allocated by this allocator
/// - `size` and `align` must match the original allocation
pub unsafe fn deallocate(ptr: *mut u8, size: usize, align: usize) {
    if let Ok(layout) = Layout::from_size_align(size, align.max(MIN_ALIGN)) {
        alloc::alloc::dealloc(ptr, layout);
    }
}

/// Grow or shrink an allocation, preserving contents
///
/// # Safety
/// - `ptr` must have been allocated by this allocator with `old_size`
pub unsafe fn reallocate(ptr: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8> {
    let layout = Layout::from_size_align(old_size, MIN_ALIGN).ok()?;
    let new_ptr = alloc::alloc::realloc(ptr, layout, new_size);
    if new_ptr.is_null() {
        None
    } else {
        Some(new_ptr)
    }
}
