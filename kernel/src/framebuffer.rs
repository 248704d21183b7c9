//! Linear framebuffer
//!
//! The framebuffer is a dumb write-only device: we record what Limine hands
//! us and expose the geometry. Rendering belongs to user space; the only
//! kernel-side operation is clearing it at boot.

use core::sync::atomic::{AtomicU64, Ordering};

static FB_ADDR: AtomicU64 = AtomicU64::new(0);
static FB_WIDTH: AtomicU64 = AtomicU64::new(0);
static FB_HEIGHT: AtomicU64 = AtomicU64::new(0);
static FB_PITCH: AtomicU64 = AtomicU64::new(0);
static FB_BPP: AtomicU64 = AtomicU64::new(0);

/// Framebuffer geometry
#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u16,
}

/// Record the Limine-provided framebuffer
pub fn init(addr: *mut u8, width: u64, height: u64, pitch: u64, bpp: u16) {
    FB_ADDR.store(addr as u64, Ordering::SeqCst);
    FB_WIDTH.store(width, Ordering::SeqCst);
    FB_HEIGHT.store(height, Ordering::SeqCst);
    FB_PITCH.store(pitch, Ordering::SeqCst);
    FB_BPP.store(bpp as u64, Ordering::SeqCst);
}

/// Whether a framebuffer was provided at boot
pub fn is_available() -> bool {
    FB_ADDR.load(Ordering::Relaxed) != 0
}

/// Current framebuffer geometry, if any
pub fn info() -> Option<FramebufferInfo> {
    let addr = FB_ADDR.load(Ordering::Relaxed);
    if addr == 0 {
        return None;
    }
    Some(FramebufferInfo {
        addr,
        width: FB_WIDTH.load(Ordering::Relaxed),
        height: FB_HEIGHT.load(Ordering::Relaxed),
        pitch: FB_PITCH.load(Ordering::Relaxed),
        bpp: FB_BPP.load(Ordering::Relaxed) as u16,
    })
}

/// Fill the whole framebuffer with a solid color
pub fn clear(color: u32) {
    let Some(fb) = info() else { return };
    if fb.bpp != 32 {
        return;
    }

    for y in 0..fb.height {
        let row = (fb.addr + y * fb.pitch) as *mut u32;
        for x in 0..fb.width {
            unsafe {
                core::ptr::write_volatile(row.add(x as usize), color);
            }
        }
    }
}
