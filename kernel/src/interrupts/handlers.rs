//! Interrupt Handlers
//!
//! CPU exception handlers print diagnostic state and halt; the kernel does
//! not recover from exceptions taken in kernel mode. Hardware IRQ handlers
//! only acknowledge, enqueue and wake. Nothing in here schedules; the
//! timer handler just raises need_resched for the next safe checkpoint.

use super::pic::{self, PICS};
use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

/// Breakpoint exception handler
pub extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::log_warn!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

/// Double fault handler (unrecoverable)
pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Page fault handler
pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read();

    crate::log_error!(
        "EXCEPTION: PAGE FAULT\n\
        Accessed Address: {:?}\n\
        Error Code: {:?}\n\
        {:#?}",
        addr,
        error_code,
        stack_frame
    );

    panic!("Page fault at {:?}", addr);
}

/// General protection fault handler
pub extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\n\
        Error Code: {}\n\
        {:#?}",
        error_code, stack_frame
    );
}

/// Invalid opcode handler
pub extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
}

/// Divide by zero handler
pub extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: DIVIDE BY ZERO\n{:#?}", stack_frame);
}

static BOOTSTRAP_READY: AtomicBool = AtomicBool::new(false);

/// Allow the timer handler to touch the scheduler once bootstrapping is done
pub fn set_bootstrap_ready(ready: bool) {
    BOOTSTRAP_READY.store(ready, Ordering::SeqCst);
}

/// Timer interrupt handler
pub extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::time::tick();

    if BOOTSTRAP_READY.load(Ordering::Relaxed) {
        crate::scheduler::timer_tick();
    }

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(pic::InterruptIndex::Timer.as_u8());
    }
}

/// Keyboard interrupt handler
pub extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    let mut port = Port::new(0x60);
    let scancode: u8 = unsafe { port.read() };

    crate::keyboard::handle_scancode(scancode);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(pic::InterruptIndex::Keyboard.as_u8());
    }
}

/// IDE primary channel handler (IRQ14)
pub extern "x86-interrupt" fn ata_primary_handler(_stack_frame: InterruptStackFrame) {
    crate::drivers::ata::handle_irq(0);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(pic::InterruptIndex::AtaPrimary.as_u8());
    }
}

/// IDE secondary channel handler (IRQ15)
pub extern "x86-interrupt" fn ata_secondary_handler(_stack_frame: InterruptStackFrame) {
    crate::drivers::ata::handle_irq(1);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(pic::InterruptIndex::AtaSecondary.as_u8());
    }
}
