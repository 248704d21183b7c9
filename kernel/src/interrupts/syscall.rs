//! SYSCALL/SYSRET entry path
//!
//! Configures the STAR/LSTAR/SFMASK MSRs and provides the naked entry stub.
//! On entry the stub switches to the current process's kernel stack, pushes
//! the caller's full register frame and calls the dispatcher; the same frame
//! layout is what fork copies onto a child stack and what `first_return`
//! pops when a process runs for the very first time.

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

/// Saved user register state, in kernel-stack layout.
///
/// Field order mirrors the push sequence in `syscall_entry`; `rip` and
/// `rflags` hold the values SYSCALL left in rcx/r11.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rbx: u64,
    /// Syscall number on entry, return value on exit
    pub rax: u64,
    /// User RIP (rcx at entry)
    pub rip: u64,
    /// User RFLAGS (r11 at entry)
    pub rflags: u64,
    /// User RSP
    pub rsp: u64,
}

impl SyscallFrame {
    pub const SIZE: usize = core::mem::size_of::<SyscallFrame>();
}

/// Kernel stack top for the running process. The scheduler rewrites this on
/// every context switch, in lockstep with TSS.RSP0.
#[no_mangle]
pub static mut CURRENT_KSTACK_TOP: u64 = 0;

/// Scratch slot for the user RSP during entry. Safe because SFMASK clears IF
/// on SYSCALL and the value is consumed before interrupts are re-enabled.
#[no_mangle]
static mut USER_RSP_SCRATCH: u64 = 0;

/// Configure the SYSCALL/SYSRET MSRs. Must run after the GDT is loaded.
pub fn init() {
    unsafe {
        // Enable SYSCALL/SYSRET in EFER
        let efer = Efer::read();
        Efer::write(efer | EferFlags::SYSTEM_CALL_EXTENSIONS);

        // STAR: bits 47:32 = kernel CS base (0x08); bits 63:48 = sysret base.
        // SYSRET64 loads CS = base+16, SS = base+8, so base 0x10 yields
        // CS = 0x20 (user code) and SS = 0x18 (user data).
        let star_value: u64 = (0x10u64 << 48) | (0x08u64 << 32);
        core::arch::asm!(
            "wrmsr",
            in("ecx") 0xC000_0081u32, // IA32_STAR
            in("eax") star_value as u32,
            in("edx") (star_value >> 32) as u32,
        );

        // LSTAR: syscall entry point
        LStar::write(VirtAddr::new(syscall_entry as *const () as u64));

        // SFMASK: RFLAGS bits cleared on entry. IF stays off until the
        // dispatcher has switched off the scratch slot.
        SFMask::write(
            RFlags::INTERRUPT_FLAG
                | RFlags::DIRECTION_FLAG
                | RFlags::TRAP_FLAG
                | RFlags::ALIGNMENT_CHECK,
        );
    }

    crate::log_debug!("[SYSCALL] STAR/LSTAR/SFMASK configured");
}

/// SYSCALL entry stub.
///
/// On entry: rax = number, rdi/rsi/rdx/r10/r8/r9 = args, rcx = user RIP,
/// r11 = user RFLAGS, rsp = user stack. Interrupts are off (SFMASK).
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Stash the user stack and switch to the process kernel stack
        "mov [rip + {scratch}], rsp",
        "mov rsp, [rip + {kstack}]",

        // Build the SyscallFrame (see struct layout)
        "push qword ptr [rip + {scratch}]", // user rsp
        "push r11",                          // user rflags
        "push rcx",                          // user rip
        "push rax",
        "push rbx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push r8",
        "push r9",
        "push r10",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Dispatch with a pointer to the frame
        "mov rdi, rsp",
        "call {dispatch}",

        // Unwind the frame and return to Ring 3. The dispatcher comes back
        // with interrupts off, so popping into the user rsp is safe.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rbx",
        "pop rax",
        "pop rcx",
        "pop r11",
        "pop rsp",
        "sysretq",

        scratch = sym USER_RSP_SCRATCH,
        kstack = sym CURRENT_KSTACK_TOP,
        dispatch = sym crate::syscall::dispatch,
    );
}

/// First entry into user mode for a freshly built process.
///
/// The scheduler's context switch `ret`s here with rsp pointing at a
/// SyscallFrame prepared by exec (synthetic) or fork (copied from the
/// parent, rax forced to 0). Popping it and executing SYSRET completes the
/// ring transition.
#[unsafe(naked)]
pub unsafe extern "C" fn first_return() {
    core::arch::naked_asm!(
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rbx",
        "pop rax",
        "pop rcx",
        "pop r11",
        "pop rsp",
        "sysretq",
    );
}
