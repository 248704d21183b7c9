//! Process table
//!
//! Fixed-size slot array. A slot is FREE when it holds `None`; every live
//! process owns its address space, a heap-allocated kernel stack and the
//! saved stack pointer the context switch resumes from. Slot 0 is the
//! kernel idle task and never exits.
//!
//! The table lock is only ever taken with interrupts masked: the scheduler
//! and the wake paths run from both thread and IRQ context.

use crate::interrupts::syscall::SyscallFrame;
use crate::memory::AddressSpace;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

/// Process ID type
pub type Pid = u32;

/// Size of the process table
pub const PROC_MAX: usize = 64;

/// Per-process kernel stack size
pub const KSTACK_SIZE: usize = 32 * 1024;

/// Process state; FREE is an empty slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// Process control block
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub exit_code: i32,
    /// User address space; `None` for the kernel idle task
    pub space: Option<AddressSpace>,
    /// Kernel stack backing store
    kstack: Vec<u8>,
    /// Top of the kernel stack (goes into TSS.RSP0 on switch)
    pub kstack_top: u64,
    /// Stack pointer saved by the last context switch away from this process
    pub saved_rsp: u64,
    /// Thread-local base (FS), restored on switch
    pub fs_base: u64,
    /// Start of the program break region (end of loaded image)
    pub brk_start: u64,
    /// Current program break
    pub brk: u64,
    /// Anonymous-mmap bump pointer
    pub mmap_brk: u64,
    pub cwd: String,
    /// Blocked in wait: Some(0) = any child, Some(pid) = that child
    pub waiting_for: Option<Pid>,
}

static TABLE: Mutex<Vec<Option<Process>>> = Mutex::new(Vec::new());
static CURRENT_SLOT: AtomicUsize = AtomicUsize::new(0);
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Run a closure against the locked table, interrupts masked.
/// All table access funnels through here; see the module invariant.
pub(crate) fn with_table<F, R>(f: F) -> R
where
    F: FnOnce(&mut Vec<Option<Process>>) -> R,
{
    crate::interrupts::without_interrupts(|| {
        let mut table = TABLE.lock();
        f(&mut table)
    })
}

/// Initialize the table and install the idle task in slot 0
pub fn init() {
    with_table(|table| {
        table.clear();
        for _ in 0..PROC_MAX {
            table.push(None);
        }

        // The idle task runs on the boot stack; its kstack fields are only
        // placeholders because it never enters user mode.
        let kstack = alloc::vec![0u8; 4096];
        let kstack_top = kstack.as_ptr() as u64 + kstack.len() as u64;
        table[0] = Some(Process {
            pid: 0,
            ppid: 0,
            name: String::from("idle"),
            state: ProcessState::Running,
            exit_code: 0,
            space: None,
            kstack,
            kstack_top,
            saved_rsp: 0,
            fs_base: 0,
            brk_start: 0,
            brk: 0,
            mmap_brk: 0,
            cwd: String::from("/"),
            waiting_for: None,
        });
    });

    CURRENT_SLOT.store(0, Ordering::SeqCst);
    crate::log!("[PROC] Process table ready ({} slots)", PROC_MAX);
}

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

/// Slot index of the running process
pub fn current_slot() -> usize {
    CURRENT_SLOT.load(Ordering::Relaxed)
}

pub(crate) fn set_current_slot(slot: usize) {
    CURRENT_SLOT.store(slot, Ordering::SeqCst);
}

/// Pid of the running process
pub fn current_pid() -> Pid {
    let slot = current_slot();
    with_table(|t| t[slot].as_ref().map(|p| p.pid).unwrap_or(0))
}

/// Find the slot holding `pid`
pub fn slot_of(pid: Pid) -> Option<usize> {
    with_table(|t| {
        t.iter()
            .position(|s| s.as_ref().map_or(false, |p| p.pid == pid))
    })
}

/// Wake a blocked process
pub fn wake(pid: Pid) {
    with_table(|t| {
        for slot in t.iter_mut().flatten() {
            if slot.pid == pid && slot.state == ProcessState::Blocked {
                slot.state = ProcessState::Ready;
                return;
            }
        }
    });
}

/// Mark the current process Blocked (the caller yields afterwards)
pub fn block_current() {
    let slot = current_slot();
    if slot == 0 {
        return; // the idle task never blocks; its wait loops poll instead
    }
    with_table(|t| {
        if let Some(p) = t[slot].as_mut() {
            p.state = ProcessState::Blocked;
        }
    });
}

/// Revert a block that never slept (e.g. timeout abort paths)
pub fn unblock_current() {
    let slot = current_slot();
    with_table(|t| {
        if let Some(p) = t[slot].as_mut() {
            if p.state == ProcessState::Blocked {
                p.state = ProcessState::Running;
            }
        }
    });
}

/// Current working directory of the running process
pub fn current_cwd() -> String {
    let slot = current_slot();
    with_table(|t| {
        t[slot]
            .as_ref()
            .map(|p| p.cwd.clone())
            .unwrap_or_else(|| String::from("/"))
    })
}

pub fn set_current_cwd(cwd: String) {
    let slot = current_slot();
    with_table(|t| {
        if let Some(p) = t[slot].as_mut() {
            p.cwd = cwd;
        }
    });
}

/// Build a fresh kernel stack image for a process that has never run:
/// the register frame at the top, then the address of `first_return`, then
/// the six callee-saved slots the context switch pops.
///
/// Returns (kstack_top, saved_rsp).
pub fn build_initial_kstack(kstack: &mut [u8], frame: &SyscallFrame) -> (u64, u64) {
    let base = kstack.as_mut_ptr() as u64;
    let top = (base + kstack.len() as u64) & !0xF;

    unsafe {
        let frame_addr = top - SyscallFrame::SIZE as u64;
        core::ptr::write(frame_addr as *mut SyscallFrame, *frame);

        let mut sp = frame_addr;
        sp -= 8;
        core::ptr::write(
            sp as *mut u64,
            crate::interrupts::syscall::first_return as *const () as u64,
        );
        for _ in 0..6 {
            sp -= 8;
            core::ptr::write(sp as *mut u64, 0u64);
        }

        (top, sp)
    }
}

/// Find a FREE slot
fn free_slot(table: &Vec<Option<Process>>) -> Option<usize> {
    (1..PROC_MAX).find(|&i| table[i].is_none())
}

/// Create a process from a prepared address space and register frame;
/// used by exec for the first program and by the spawn path.
pub fn spawn(
    name: &str,
    ppid: Pid,
    space: AddressSpace,
    frame: &SyscallFrame,
    brk_start: u64,
    cwd: String,
) -> Result<Pid, i64> {
    let mut kstack = alloc::vec![0u8; KSTACK_SIZE];
    let (kstack_top, saved_rsp) = build_initial_kstack(&mut kstack, frame);
    let pid = alloc_pid();

    with_table(|table| {
        let slot = free_slot(table).ok_or(crate::syscall::errno::EAGAIN)?;
        table[slot] = Some(Process {
            pid,
            ppid,
            name: String::from(name),
            state: ProcessState::Ready,
            exit_code: 0,
            space: Some(space),
            kstack,
            kstack_top,
            saved_rsp,
            fs_base: 0,
            brk_start,
            brk: brk_start,
            mmap_brk: crate::memory::paging::UserLayout::MMAP_BASE,
            cwd,
            waiting_for: None,
        });
        Ok(pid)
    })
}

/// Fork the current process.
///
/// Deep-copies the user address space, gives the child a fresh kernel
/// stack, and copies the parent's saved register frame onto it with the
/// return-value slot forced to 0. When the child is first scheduled, the
/// arranged frame is popped and the ring transition resumes user mode with
/// the parent's registers.
pub fn fork(frame: &SyscallFrame) -> i64 {
    let parent_slot = current_slot();

    // Snapshot what we need from the parent, then clone outside the lock:
    // the deep copy is O(mapped pages) and must not run with the table
    // locked and interrupts off the whole time.
    let (parent_pid, cwd, fs_base, brk_start, brk, mmap_brk, name) = {
        let snapshot = with_table(|t| {
            t[parent_slot].as_ref().map(|p| {
                (
                    p.pid,
                    p.cwd.clone(),
                    p.fs_base,
                    p.brk_start,
                    p.brk,
                    p.mmap_brk,
                    p.name.clone(),
                )
            })
        });
        match snapshot {
            Some(s) => s,
            None => return crate::syscall::errno::EAGAIN,
        }
    };

    let child_space = {
        let cloned = with_table(|t| {
            t[parent_slot]
                .as_ref()
                .and_then(|p| p.space.as_ref().map(|s| s as *const AddressSpace))
        });
        // The parent cannot go away: it is the caller.
        match cloned {
            Some(space_ptr) => match unsafe { (*space_ptr).clone_user() } {
                Some(s) => s,
                None => return crate::syscall::errno::ENOMEM,
            },
            None => return crate::syscall::errno::EINVAL,
        }
    };

    let mut child_frame = *frame;
    child_frame.rax = 0; // fork returns 0 in the child

    let mut kstack = alloc::vec![0u8; KSTACK_SIZE];
    let (kstack_top, saved_rsp) = build_initial_kstack(&mut kstack, &child_frame);
    let pid = alloc_pid();

    let inserted = with_table(|table| {
        let slot = match free_slot(table) {
            Some(s) => s,
            None => return false,
        };
        table[slot] = Some(Process {
            pid,
            ppid: parent_pid,
            name,
            state: ProcessState::Ready,
            exit_code: 0,
            space: Some(child_space),
            kstack,
            kstack_top,
            saved_rsp,
            fs_base,
            brk_start,
            brk,
            mmap_brk,
            cwd,
            waiting_for: None,
        });
        true
    });

    if !inserted {
        return crate::syscall::errno::EAGAIN;
    }

    crate::log_debug!("[PROC] fork: {} -> {}", parent_pid, pid);
    pid as i64
}

/// Terminate the current process: mark it ZOMBIE, close its descriptors,
/// wake a parent blocked in wait. The caller must yield afterwards and
/// never returns to user mode.
pub fn exit_current(code: i32) {
    let slot = current_slot();
    let pid = current_pid();

    crate::vfs::close_all_for_pid(pid);
    crate::pipe::close_all_for_pid(pid);

    with_table(|t| {
        let ppid = match t[slot].as_mut() {
            Some(p) => {
                p.state = ProcessState::Zombie;
                p.exit_code = code;
                p.ppid
            }
            None => return,
        };

        // Wake the parent if it waits on us (or on any child)
        for parent in t.iter_mut().flatten() {
            if parent.pid == ppid && parent.state == ProcessState::Blocked {
                match parent.waiting_for {
                    Some(0) => {
                        parent.state = ProcessState::Ready;
                        parent.waiting_for = None;
                    }
                    Some(w) if w == pid => {
                        parent.state = ProcessState::Ready;
                        parent.waiting_for = None;
                    }
                    _ => {}
                }
            }
        }
    });

    crate::log_debug!("[PROC] Process {} exited with code {}", pid, code);
}

/// Outcome of a single wait poll
pub enum WaitPoll {
    /// (pid, exit_code) of a reaped zombie child
    Reaped(Pid, i32),
    /// Children exist but none is a zombie yet
    NotReady,
    /// No matching child at all
    NoChild,
}

/// Poll for a zombie child of the current process; `target` 0 means any
/// child. Reaping frees the slot (kernel stack and address space drop).
///
/// With `block_if_not_ready`, the caller is marked Blocked in the same
/// critical section that observed "no zombie yet", so a child exiting
/// in between cannot slip past the wakeup (the caller yields afterwards).
pub fn wait_poll(target: Pid, block_if_not_ready: bool) -> WaitPoll {
    let self_pid = current_pid();
    let self_slot = current_slot();

    with_table(|t| {
        let mut have_child = false;

        for i in 1..PROC_MAX {
            let matches = match &t[i] {
                Some(p) if p.ppid == self_pid => {
                    if target == 0 || p.pid == target {
                        have_child = true;
                        p.state == ProcessState::Zombie
                    } else {
                        false
                    }
                }
                _ => false,
            };

            if matches {
                let p = t[i].take().unwrap();
                return WaitPoll::Reaped(p.pid, p.exit_code);
            }
        }

        if have_child {
            if block_if_not_ready {
                if let Some(p) = t[self_slot].as_mut() {
                    p.state = ProcessState::Blocked;
                    p.waiting_for = Some(target);
                }
            }
            WaitPoll::NotReady
        } else {
            WaitPoll::NoChild
        }
    })
}

/// Count of live (non-FREE) slots
pub fn count() -> usize {
    with_table(|t| t.iter().filter(|s| s.is_some()).count())
}
