//! Memory Management Subsystem
//!
//! Heap, physical frame allocator and paging for a Limine-booted kernel.
//! The higher-half direct map (HHDM) is the kernel's window into all of
//! physical memory.

pub mod frame;
pub mod heap;
pub mod paging;

use core::sync::atomic::{AtomicU64, Ordering};

pub use paging::{is_kernel_address, is_user_address, validate_user_ptr, AddressSpace, PageFlags};

/// HHDM offset (higher half direct map), set from the Limine response
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0xFFFF_8000_0000_0000);

/// Total physical memory detected at boot
static TOTAL_PHYS_MEMORY: AtomicU64 = AtomicU64::new(0);

/// Minimum heap size (16 MB)
pub const HEAP_SIZE_MIN: usize = 16 * 1024 * 1024;
/// Maximum heap size (256 MB), leaves RAM for user frames and DMA
pub const HEAP_SIZE_MAX: usize = 256 * 1024 * 1024;

/// Compute dynamic heap size: 25% of total RAM, clamped
pub fn compute_heap_size(total_ram: u64) -> usize {
    let quarter = (total_ram / 4) as usize;
    quarter.clamp(HEAP_SIZE_MIN, HEAP_SIZE_MAX)
}

/// Store the HHDM offset and bring up the heap in the given physical region
pub fn init(hhdm_offset: u64, heap_phys: u64, heap_bytes: usize) {
    HHDM_OFFSET.store(hhdm_offset, Ordering::SeqCst);

    let heap_virt = hhdm_offset + heap_phys;
    heap::init_at(heap_virt as usize, heap_bytes);

    crate::serial_println!(
        "[MEM] Heap: {} MB at virt {:#x} (phys {:#x})",
        heap_bytes / 1024 / 1024,
        heap_virt,
        heap_phys
    );
}

/// Store detected total physical memory
pub fn set_total_physical_memory(bytes: u64) {
    TOTAL_PHYS_MEMORY.store(bytes, Ordering::SeqCst);
}

/// Total physical memory in bytes
pub fn total_physical_memory() -> u64 {
    TOTAL_PHYS_MEMORY.load(Ordering::Relaxed)
}

/// Get the HHDM offset
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Convert a physical address to a kernel-accessible virtual one (via HHDM)
pub fn phys_to_virt(phys: u64) -> u64 {
    hhdm_offset() + phys
}

/// Memory statistics
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub heap_used: usize,
    pub heap_free: usize,
    pub frames_used: usize,
    pub frames_free: usize,
}

/// Gather memory statistics
pub fn stats() -> MemoryStats {
    let (frames_total, frames_used) = frame::stats();
    MemoryStats {
        heap_used: heap::used(),
        heap_free: heap::free(),
        frames_used: frames_used as usize,
        frames_free: (frames_total - frames_used) as usize,
    }
}
