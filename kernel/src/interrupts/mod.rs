//! Interrupt Handling Subsystem
//!
//! IDT setup, PIC initialization and the SYSCALL entry path.

mod handlers;
mod pic;
pub mod syscall;

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;

lazy_static! {
    /// Interrupt Descriptor Table
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions
        idt.breakpoint.set_handler_fn(handlers::breakpoint_handler);
        idt.double_fault.set_handler_fn(handlers::double_fault_handler);
        idt.page_fault.set_handler_fn(handlers::page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(handlers::general_protection_fault_handler);
        idt.invalid_opcode.set_handler_fn(handlers::invalid_opcode_handler);
        idt.divide_error.set_handler_fn(handlers::divide_error_handler);

        // Hardware interrupts
        idt[pic::InterruptIndex::Timer.as_usize()]
            .set_handler_fn(handlers::timer_interrupt_handler);
        idt[pic::InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(handlers::keyboard_interrupt_handler);
        idt[pic::InterruptIndex::AtaPrimary.as_usize()]
            .set_handler_fn(handlers::ata_primary_handler);
        idt[pic::InterruptIndex::AtaSecondary.as_usize()]
            .set_handler_fn(handlers::ata_secondary_handler);

        idt
    };
}

/// Load the IDT, initialize the PIC and the SYSCALL MSRs
pub fn init() {
    IDT.load();

    unsafe {
        pic::PICS.lock().initialize();
    }

    syscall::init();

    x86_64::instructions::interrupts::enable();

    crate::log_debug!("[INT] IDT loaded, PIC initialized, SYSCALL ready, interrupts enabled");
}

/// Disable interrupts and run a closure
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// Allow the timer handler to drive the scheduler once bootstrapping is done
pub fn set_bootstrap_ready(ready: bool) {
    handlers::set_bootstrap_ready(ready);
}
