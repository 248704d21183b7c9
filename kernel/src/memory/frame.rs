//! Physical Frame Allocator (Bitmap)
//!
//! Tracks all usable physical pages (4 KB frames) via a bitmap.
//! Each bit represents one physical frame: 0 = free, 1 = allocated.
//! Initialized from the Limine memory map after the heap is ready.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Page / frame size (4 KB)
pub const FRAME_SIZE: u64 = 4096;

/// Global frame allocator (initialized in main.rs after heap is ready)
static FRAME_ALLOC: Mutex<Option<FrameAllocator>> = Mutex::new(None);

/// Statistics: total frames managed
static TOTAL_FRAMES: AtomicU64 = AtomicU64::new(0);
/// Statistics: allocated frames
static USED_FRAMES: AtomicU64 = AtomicU64::new(0);

/// Physical frame allocator using a bitmap
struct FrameAllocator {
    /// Bitmap: each bit = one 4 KB frame. bit set = allocated.
    bitmap: Vec<u64>,
    /// Base physical address (lowest tracked frame)
    base_phys: u64,
    /// Total number of frames tracked
    total_frames: usize,
    /// Hint: word index of the last allocation, speeds up the linear scan
    next_hint: usize,
}

impl FrameAllocator {
    /// Allocate one physical frame, first-fit. Returns its physical address.
    fn alloc(&mut self) -> Option<u64> {
        let words = self.bitmap.len();

        for offset in 0..words {
            let idx = (self.next_hint + offset) % words;
            let word = self.bitmap[idx];

            if word == u64::MAX {
                continue; // all 64 frames in this word are taken
            }

            let bit = (!word).trailing_zeros() as usize;
            let frame_index = idx * 64 + bit;

            if frame_index >= self.total_frames {
                continue;
            }

            self.bitmap[idx] |= 1u64 << bit;
            self.next_hint = idx;

            USED_FRAMES.fetch_add(1, Ordering::Relaxed);

            return Some(self.base_phys + frame_index as u64 * FRAME_SIZE);
        }

        None // Out of memory
    }

    fn is_free(&self, frame_index: usize) -> bool {
        self.bitmap[frame_index / 64] & (1u64 << (frame_index % 64)) == 0
    }

    fn mark_used(&mut self, frame_index: usize) {
        self.bitmap[frame_index / 64] |= 1u64 << (frame_index % 64);
    }

    /// Allocate `count` physically contiguous frames. Returns the first
    /// frame's physical address.
    fn alloc_contiguous(&mut self, count: usize) -> Option<u64> {
        if count == 0 {
            return None;
        }
        let mut run = 0usize;
        let mut run_start = 0usize;

        for frame in 0..self.total_frames {
            if self.is_free(frame) {
                if run == 0 {
                    run_start = frame;
                }
                run += 1;
                if run == count {
                    for f in run_start..run_start + count {
                        self.mark_used(f);
                    }
                    USED_FRAMES.fetch_add(count as u64, Ordering::Relaxed);
                    return Some(self.base_phys + run_start as u64 * FRAME_SIZE);
                }
            } else {
                run = 0;
            }
        }

        None
    }

    /// Free a previously allocated frame
    fn free(&mut self, phys: u64) {
        if phys < self.base_phys {
            return;
        }
        let frame_index = ((phys - self.base_phys) / FRAME_SIZE) as usize;
        if frame_index >= self.total_frames {
            return;
        }
        let word_idx = frame_index / 64;
        let bit_idx = frame_index % 64;

        if self.bitmap[word_idx] & (1u64 << bit_idx) != 0 {
            self.bitmap[word_idx] &= !(1u64 << bit_idx);
            USED_FRAMES.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Region descriptor passed from the main.rs memory-map scan
pub struct PhysRegion {
    pub base: u64,
    pub length: u64,
}

/// Initialize the frame allocator.
///
/// `usable_regions` — list of USABLE physical memory regions from the Limine
/// memory map.
/// `heap_phys` / `heap_size` — the region already consumed by the kernel heap
/// (must be marked used).
pub fn init(usable_regions: &[PhysRegion], heap_phys: u64, heap_size: u64) {
    if usable_regions.is_empty() {
        crate::serial_println!("[FRAME] No usable regions, frame allocator disabled");
        return;
    }

    let min_phys = usable_regions.iter().map(|r| r.base).min().unwrap();
    let max_phys = usable_regions.iter().map(|r| r.base + r.length).max().unwrap();

    // Align min down and max up to FRAME_SIZE
    let base_phys = min_phys & !(FRAME_SIZE - 1);
    let top_phys = (max_phys + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
    let total_frames = ((top_phys - base_phys) / FRAME_SIZE) as usize;

    // Allocate bitmap, all bits set = all allocated by default
    let bitmap_words = (total_frames + 63) / 64;
    let mut bitmap = vec![u64::MAX; bitmap_words];

    // Mark usable regions as FREE (clear bits)
    for region in usable_regions {
        let region_start = (region.base.max(base_phys) - base_phys) / FRAME_SIZE;
        let region_end = ((region.base + region.length).min(top_phys) - base_phys) / FRAME_SIZE;

        for frame in region_start..region_end {
            let word = frame as usize / 64;
            let bit = frame as usize % 64;
            bitmap[word] &= !(1u64 << bit);
        }
    }

    // Mark the heap region as USED
    let heap_end = heap_phys + heap_size;
    if heap_phys >= base_phys && heap_phys < top_phys {
        let start_frame = ((heap_phys - base_phys) / FRAME_SIZE) as usize;
        let end_frame = ((heap_end.min(top_phys) - base_phys) / FRAME_SIZE) as usize;
        for frame in start_frame..end_frame {
            bitmap[frame / 64] |= 1u64 << (frame % 64);
        }
    }

    // Mark the first 1 MB as used (legacy BIOS area)
    let low_end = (0x10_0000u64.min(top_phys).saturating_sub(base_phys)) / FRAME_SIZE;
    for frame in 0..low_end as usize {
        bitmap[frame / 64] |= 1u64 << (frame % 64);
    }

    // Count free frames
    let mut free_count: u64 = 0;
    for i in 0..total_frames {
        if bitmap[i / 64] & (1u64 << (i % 64)) == 0 {
            free_count += 1;
        }
    }
    let used_count = total_frames as u64 - free_count;

    TOTAL_FRAMES.store(total_frames as u64, Ordering::SeqCst);
    USED_FRAMES.store(used_count, Ordering::SeqCst);

    crate::serial_println!(
        "[FRAME] Allocator ready: {} total frames, {} free ({} MB), {} used",
        total_frames,
        free_count,
        free_count * 4 / 1024,
        used_count
    );

    *FRAME_ALLOC.lock() = Some(FrameAllocator {
        bitmap,
        base_phys,
        total_frames,
        next_hint: 0,
    });
}

/// Allocate a single physical 4 KB frame.
/// Returns the page-aligned physical address, or `None` if OOM.
pub fn alloc_frame() -> Option<u64> {
    FRAME_ALLOC.lock().as_mut()?.alloc()
}

/// Allocate `count` physically contiguous frames, first-fit over the bitmap.
pub fn alloc_contiguous(count: usize) -> Option<u64> {
    FRAME_ALLOC.lock().as_mut()?.alloc_contiguous(count)
}

/// Free a physical frame previously returned by `alloc_frame`.
pub fn free_frame(phys: u64) {
    if let Some(alloc) = FRAME_ALLOC.lock().as_mut() {
        alloc.free(phys);
    }
}

/// Free `count` consecutive frames starting at `phys`.
pub fn free_range(phys: u64, count: usize) {
    if let Some(alloc) = FRAME_ALLOC.lock().as_mut() {
        for i in 0..count {
            alloc.free(phys + i as u64 * FRAME_SIZE);
        }
    }
}

/// Allocate a zeroed physical frame (convenience wrapper).
pub fn alloc_frame_zeroed() -> Option<u64> {
    let phys = alloc_frame()?;
    let virt = crate::memory::phys_to_virt(phys);
    unsafe {
        core::ptr::write_bytes(virt as *mut u8, 0, FRAME_SIZE as usize);
    }
    Some(phys)
}

/// Return (total, used) frame counts.
pub fn stats() -> (u64, u64) {
    (
        TOTAL_FRAMES.load(Ordering::Relaxed),
        USED_FRAMES.load(Ordering::Relaxed),
    )
}

/// Total bytes tracked by the allocator
pub fn total_bytes() -> u64 {
    TOTAL_FRAMES.load(Ordering::Relaxed) * FRAME_SIZE
}

/// Free bytes remaining
pub fn free_bytes() -> u64 {
    let (total, used) = stats();
    (total - used) * FRAME_SIZE
}

/// Check whether a frame is currently marked allocated (diagnostics)
pub fn is_allocated(phys: u64) -> bool {
    let guard = FRAME_ALLOC.lock();
    if let Some(alloc) = guard.as_ref() {
        if phys < alloc.base_phys {
            return false;
        }
        let idx = ((phys - alloc.base_phys) / FRAME_SIZE) as usize;
        if idx >= alloc.total_frames {
            return false;
        }
        !alloc.is_free(idx)
    } else {
        false
    }
}

/// Run self-tests on the frame allocator. Returns (passed, failed).
pub fn self_test() -> (usize, usize) {
    let mut passed = 0usize;
    let mut failed = 0usize;

    // Test 1: Basic allocation returns a page-aligned address
    match alloc_frame() {
        Some(phys) => {
            if phys & 0xFFF == 0 {
                passed += 1;
            } else {
                crate::serial_println!("[FRAME-TEST] alloc NOT page-aligned ({:#x}): FAIL", phys);
                failed += 1;
            }
            free_frame(phys);
        }
        None => {
            crate::serial_println!("[FRAME-TEST] alloc returned None: FAIL");
            failed += 1;
        }
    }

    // Test 2: Zeroed allocation
    match alloc_frame_zeroed() {
        Some(phys) => {
            let virt = crate::memory::phys_to_virt(phys);
            let page = unsafe { core::slice::from_raw_parts(virt as *const u8, 4096) };
            if page.iter().all(|&b| b == 0) {
                passed += 1;
            } else {
                crate::serial_println!("[FRAME-TEST] alloc_zeroed NOT zeroed: FAIL");
                failed += 1;
            }
            free_frame(phys);
        }
        None => {
            crate::serial_println!("[FRAME-TEST] alloc_zeroed returned None: FAIL");
            failed += 1;
        }
    }

    // Test 3: Contiguous allocation is contiguous and aligned
    match alloc_contiguous(4) {
        Some(first) => {
            if first & 0xFFF == 0 && is_allocated(first + 3 * FRAME_SIZE) {
                passed += 1;
            } else {
                crate::serial_println!("[FRAME-TEST] alloc_contiguous bad run at {:#x}: FAIL", first);
                failed += 1;
            }
            free_range(first, 4);
        }
        None => {
            crate::serial_println!("[FRAME-TEST] alloc_contiguous returned None: FAIL");
            failed += 1;
        }
    }

    // Test 4: Stats tracking is consistent
    let (_, used_before) = stats();
    if let Some(f) = alloc_frame() {
        let (_, used_after) = stats();
        if used_after == used_before + 1 {
            passed += 1;
        } else {
            crate::serial_println!(
                "[FRAME-TEST] stats before={} after={}: FAIL",
                used_before,
                used_after
            );
            failed += 1;
        }
        free_frame(f);
    } else {
        failed += 1;
    }

    (passed, failed)
}
