//! Timer subsystem
//!
//! Programs PIT channel 0 as the scheduler tick source and keeps the
//! global tick counter. One tick = 1 ms (TIMER_HZ = 1000).

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::instructions::port::Port;

/// Timer frequency in Hz
pub const TIMER_HZ: u64 = 1000;

/// PIT input clock (Hz)
const PIT_FREQUENCY: u64 = 1_193_182;

/// Global tick counter, incremented by the timer IRQ
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 for periodic interrupts at TIMER_HZ
pub fn init() {
    let divisor = (PIT_FREQUENCY / TIMER_HZ) as u16;

    unsafe {
        // Channel 0, lobyte/hibyte, rate generator
        Port::<u8>::new(0x43).write(0x36u8);
        Port::<u8>::new(0x40).write((divisor & 0xFF) as u8);
        Port::<u8>::new(0x40).write((divisor >> 8) as u8);
    }

    crate::log!("[TIME] PIT programmed for {} Hz (divisor {})", TIMER_HZ, divisor);
}

/// Called by the timer interrupt handler
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TIMER_HZ
}
