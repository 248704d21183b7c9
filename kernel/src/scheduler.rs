//! Round-robin scheduler
//!
//! One hardware thread, cooperative preemption: the timer IRQ only burns
//! the running process's time slice and raises `need_resched`; the actual
//! switch happens at the next safe checkpoint (syscall return, blocking
//! wait, or the idle loop). The switch itself saves callee-saved registers
//! on the outgoing kernel stack and resumes the incoming process at its own
//! yield point.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::process::{self, ProcessState, PROC_MAX};

/// Time slice in timer ticks
const QUANTUM: u32 = 10;

/// Set once the kernel enters its dispatch loop; before that, everything
/// runs synchronously on the boot path (the block driver keys off this).
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Ticks left in the current slice
static TICKS_LEFT: AtomicU32 = AtomicU32::new(QUANTUM);

/// Reschedule requested; checked at the next safe point
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Whether the dispatch loop has started
pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Mark the scheduler live. Called right before the boot path becomes the
/// idle loop.
pub fn start() {
    RUNNING.store(true, Ordering::SeqCst);
    crate::interrupts::set_bootstrap_ready(true);
    crate::log!("[SCHED] Dispatch started");
}

/// Timer IRQ hook: account the slice, request a reschedule when it runs out
pub fn timer_tick() {
    if !is_running() {
        return;
    }
    let left = TICKS_LEFT.load(Ordering::Relaxed);
    if left <= 1 {
        NEED_RESCHED.store(true, Ordering::Relaxed);
    } else {
        TICKS_LEFT.store(left - 1, Ordering::Relaxed);
    }
}

/// Consume a pending reschedule request
pub fn take_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::Relaxed)
}

/// Save callee-saved state of the outgoing process, stash its stack
/// pointer, adopt the incoming one and pop its state. Returning from this
/// function IS the resumption of the incoming process at its own last
/// switch (or at `first_return` for a process that has never run).
#[unsafe(naked)]
unsafe extern "C" fn context_switch(_save_rsp_into: *mut u64, _next_rsp: u64) {
    core::arch::naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    );
}

/// Pick the next READY slot after `cur`, round-robin over the table.
/// Slot 0 (idle) is the fallback and is only chosen when nothing else can
/// run.
fn pick_next(table: &alloc::vec::Vec<Option<crate::process::Process>>, cur: usize) -> Option<usize> {
    for off in 1..PROC_MAX {
        let slot = (cur + off) % PROC_MAX;
        if slot == 0 {
            continue;
        }
        if table[slot]
            .as_ref()
            .map_or(false, |p| p.state == ProcessState::Ready)
        {
            return Some(slot);
        }
    }
    None
}

/// Yield the CPU. Safe from any kernel context with a valid current
/// process; returns when this process is scheduled again.
pub fn yield_now() {
    // The whole selection runs with interrupts masked; the switch flips
    // stacks, and the incoming process re-enables interrupts on its own
    // path out.
    crate::interrupts::without_interrupts(|| {
        let cur = process::current_slot();

        let (prev_save, next_rsp, next_slot) = {
            let choice = process::with_table(|table| {
                let next_slot = match pick_next(table, cur) {
                    Some(s) => Some(s),
                    None => {
                        // Nothing else is runnable. If the current process
                        // can keep going, do so; if it blocked or died,
                        // fall back to the idle task.
                        let cur_runnable = table[cur]
                            .as_ref()
                            .map_or(false, |p| p.state == ProcessState::Running);
                        if cur_runnable || cur == 0 {
                            None
                        } else {
                            Some(0)
                        }
                    }
                };

                let next_slot = next_slot?;

                // Update states
                if let Some(p) = table[cur].as_mut() {
                    if p.state == ProcessState::Running {
                        p.state = ProcessState::Ready;
                    }
                }
                let next = table[next_slot].as_mut().unwrap();
                next.state = ProcessState::Running;

                // Raw pointer into the fixed-size table: slots never move
                // (the Vec is sized once at init and never grows).
                let prev_save = match table[cur].as_mut() {
                    Some(p) => &mut p.saved_rsp as *mut u64,
                    None => return None, // current slot already reaped
                };
                let next = table[next_slot].as_ref().unwrap();

                Some((
                    prev_save,
                    next.saved_rsp,
                    next_slot,
                    next.kstack_top,
                    next.fs_base,
                    next.space.as_ref().map(|s| s.cr3()),
                ))
            });

            let Some((prev_save, next_rsp, next_slot, kstack_top, fs_base, cr3)) = choice
            else {
                return;
            };

            // Install the incoming process's execution environment before
            // the stacks change hands.
            process::set_current_slot(next_slot);
            crate::gdt::set_kernel_stack(kstack_top);
            unsafe {
                crate::interrupts::syscall::CURRENT_KSTACK_TOP = kstack_top;
            }
            write_fs_base(fs_base);
            unsafe {
                match cr3 {
                    Some(root) => crate::memory::paging::switch_to(root),
                    None => crate::memory::paging::switch_to(crate::memory::paging::kernel_cr3()),
                }
            }

            TICKS_LEFT.store(QUANTUM, Ordering::Relaxed);

            (prev_save, next_rsp, next_slot)
        };

        let _ = next_slot;
        unsafe {
            context_switch(prev_save, next_rsp);
        }
        // We're back: some other process yielded to us.
    });
}

/// Write the FS base MSR (thread-local storage base)
fn write_fs_base(base: u64) {
    const IA32_FS_BASE: u32 = 0xC000_0100;
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") IA32_FS_BASE,
            in("eax") base as u32,
            in("edx") (base >> 32) as u32,
        );
    }
}

/// Read the FS base MSR
pub fn read_fs_base() -> u64 {
    const IA32_FS_BASE: u32 = 0xC000_0100;
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") IA32_FS_BASE,
            out("eax") lo,
            out("edx") hi,
        );
    }
    ((hi as u64) << 32) | lo as u64
}
