//! System call dispatch
//!
//! Entered from the SYSCALL stub with the caller's full register frame.
//! The number is bounds-checked against the table range, arguments come
//! from the frame registers, pointer arguments are validated before any
//! dereference, and errors return as negative Linux errno values in rax —
//! handlers produce the final integer, nothing is translated on the way
//! out.

pub mod linux;

use crate::interrupts::syscall::SyscallFrame;
use crate::process;
use crate::usercopy::{self, UserSlice};
use alloc::string::String;
use alloc::vec::Vec;
use linux::nr;

/// Error codes (Linux-compatible, negated at the call site)
pub mod errno {
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const ESRCH: i64 = -3;
    pub const EINTR: i64 = -4;
    pub const EIO: i64 = -5;
    pub const ENXIO: i64 = -6;
    pub const ENOEXEC: i64 = -8;
    pub const EBADF: i64 = -9;
    pub const ECHILD: i64 = -10;
    pub const EAGAIN: i64 = -11;
    pub const ENOMEM: i64 = -12;
    pub const EACCES: i64 = -13;
    pub const EFAULT: i64 = -14;
    pub const EBUSY: i64 = -16;
    pub const EEXIST: i64 = -17;
    pub const ENODEV: i64 = -19;
    pub const ENOTDIR: i64 = -20;
    pub const EISDIR: i64 = -21;
    pub const EINVAL: i64 = -22;
    pub const EMFILE: i64 = -24;
    pub const ENOTTY: i64 = -25;
    pub const ENOSPC: i64 = -28;
    pub const EPIPE: i64 = -32;
    pub const ERANGE: i64 = -34;
    pub const EDEADLK: i64 = -35;
    pub const ENOSYS: i64 = -38;
    pub const ENOTEMPTY: i64 = -39;
}

/// Size of the dispatch table: numbers at or above this are rejected
const SYSCALL_TABLE_SIZE: u64 = 512;

/// Longest path accepted from user space
const PATH_MAX: usize = 256;

/// Per-call cap on the kernel bounce buffer for read/write; a short
/// transfer is legal, the caller just comes back for the rest.
const IO_CHUNK_MAX: usize = 128 * 1024;

/// Announce the syscall interface
pub fn init() {
    crate::log!("[SYSCALL] Linux-compatible syscall interface ready");
}

/// Syscall dispatcher, called by the entry stub with interrupts masked.
/// Re-enables them for the handler body (blocking syscalls must see timer
/// and device IRQs) and masks them again before the stub unwinds the frame.
pub extern "C" fn dispatch(frame: &mut SyscallFrame) {
    x86_64::instructions::interrupts::enable();

    let ret = handle(frame);
    frame.rax = ret as u64;

    // Safe preemption checkpoint: a timer tick may have expired our slice
    // while we were in the handler.
    if crate::scheduler::take_need_resched() {
        crate::scheduler::yield_now();
    }

    x86_64::instructions::interrupts::disable();
}

/// Table-driven dispatch on the frame's syscall number
fn handle(frame: &mut SyscallFrame) -> i64 {
    let num = frame.rax;
    let (a1, a2, a3, a4, a5, a6) = (
        frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9,
    );

    if num >= SYSCALL_TABLE_SIZE {
        return errno::ENOSYS;
    }

    match num {
        // ====== File I/O ======
        nr::READ => sys_read(a1 as i32, a2, a3 as usize),
        nr::WRITE => sys_write(a1 as i32, a2, a3 as usize),
        nr::OPEN => sys_open(a1, a2 as u32),
        nr::CLOSE => sys_close(a1 as i32),
        nr::STAT | nr::LSTAT => sys_stat(a1, a2),
        nr::FSTAT => sys_fstat(a1 as i32, a2),
        nr::LSEEK => sys_lseek(a1 as i32, a2 as i64, a3 as u32),
        nr::IOCTL => sys_ioctl(a1 as i32, a2, a3),
        nr::ACCESS => sys_access(a1, a2 as u32),
        nr::PIPE => sys_pipe(a1),
        nr::PIPE2 => sys_pipe(a1),
        nr::DUP => sys_dup(a1 as i32),
        nr::DUP2 => sys_dup2(a1 as i32, a2 as i32),
        nr::FCNTL => sys_fcntl(a1 as i32, a2 as u32, a3),
        nr::GETDENTS | nr::GETDENTS64 => sys_getdents64(a1 as i32, a2, a3 as usize),
        nr::GETCWD => sys_getcwd(a1, a2 as usize),
        nr::CHDIR => sys_chdir(a1),
        nr::MKDIR => sys_mkdir(a1),
        nr::RMDIR => sys_rmdir(a1),
        nr::UNLINK => sys_unlink(a1),
        nr::READLINK => errno::EINVAL, // no symbolic links

        // ====== Memory ======
        nr::MMAP => linux::sys_mmap(a1, a2, a3, a4, a5 as i64, a6),
        nr::MPROTECT => linux::sys_mprotect(a1, a2, a3),
        nr::MUNMAP => linux::sys_munmap(a1, a2),
        nr::BRK => linux::sys_brk(a1),

        // ====== Processes ======
        nr::GETPID => linux::sys_getpid(),
        nr::GETPPID => linux::sys_getppid(),
        nr::GETTID => linux::sys_gettid(),
        nr::GETUID | nr::GETEUID => linux::sys_getuid(),
        nr::GETGID | nr::GETEGID => linux::sys_getgid(),
        nr::FORK | nr::VFORK => process::fork(frame),
        nr::EXECVE => sys_execve(a1, a2, frame),
        nr::EXIT | nr::EXIT_GROUP => sys_exit(a1 as i32),
        nr::WAIT4 => sys_wait4(a1 as i64, a2, a3 as u32),

        // ====== Misc ======
        nr::UNAME => linux::sys_uname(a1),
        nr::ARCH_PRCTL => linux::sys_arch_prctl(a1, a2),
        nr::SET_TID_ADDRESS => linux::sys_gettid(),
        nr::FUTEX => sys_futex(a1, a2 as u32, a3 as u32),
        nr::CLOCK_GETTIME => linux::sys_clock_gettime(a1 as u32, a2),
        nr::NANOSLEEP => linux::sys_nanosleep(a1, a2),
        nr::SCHED_YIELD => {
            crate::scheduler::yield_now();
            0
        }

        _ => {
            crate::log_debug!("[SYSCALL] Unimplemented syscall {}", num);
            errno::ENOSYS
        }
    }
}

/// Read a NUL-terminated path from user space
fn read_path(ptr: u64) -> Result<String, i64> {
    usercopy::copy_string_from_user(ptr, PATH_MAX).map_err(|e| e.to_errno())
}

/// Normalize a user path against the caller's working directory
fn absolute(path: &str) -> String {
    crate::vfs::normalize(path, &process::current_cwd())
}

// ============================================================================
// File I/O
// ============================================================================

/// Blocking read from the keyboard queue (fd 0)
fn read_stdin(buf: &mut [u8]) -> i64 {
    let pid = process::current_pid();

    loop {
        let mut n = 0usize;
        while n < buf.len() {
            match crate::keyboard::pop_byte() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            return n as i64;
        }

        // Queue empty: register as waiter and block. Registration and the
        // state change happen with interrupts masked so a keystroke cannot
        // slip between them.
        crate::interrupts::without_interrupts(|| {
            if crate::keyboard::register_waiter(pid) {
                process::block_current();
            }
        });
        crate::scheduler::yield_now();
    }
}

fn sys_read(fd: i32, buf_ptr: u64, count: usize) -> i64 {
    if count == 0 {
        return 0;
    }
    let count = count.min(IO_CHUNK_MAX);
    let user = match UserSlice::rw(buf_ptr, count) {
        Ok(u) => u,
        Err(e) => return e.to_errno(),
    };

    let mut buf = alloc::vec![0u8; count];

    let n = if fd == 0 {
        read_stdin(&mut buf)
    } else if fd == 1 || fd == 2 {
        return errno::EBADF;
    } else if crate::pipe::is_pipe_fd(fd) {
        crate::pipe::read(fd, &mut buf)
    } else {
        match crate::vfs::read(fd, &mut buf, process::current_pid()) {
            Ok(n) => n as i64,
            Err(e) => e.to_errno(),
        }
    };

    if n > 0 {
        if user.write_from(&buf[..n as usize]).is_err() {
            return errno::EFAULT;
        }
    }
    n
}

fn sys_write(fd: i32, buf_ptr: u64, count: usize) -> i64 {
    if count == 0 {
        return 0;
    }
    let count = count.min(IO_CHUNK_MAX);
    let user = match UserSlice::ro(buf_ptr, count) {
        Ok(u) => u,
        Err(e) => return e.to_errno(),
    };
    let buf = user.read_to_vec();

    if fd == 1 || fd == 2 {
        crate::serial::write_bytes(&buf);
        return count as i64;
    }
    if fd == 0 {
        return errno::EBADF;
    }
    if crate::pipe::is_pipe_fd(fd) {
        return crate::pipe::write(fd, &buf);
    }

    match crate::vfs::write(fd, &buf, process::current_pid()) {
        Ok(n) => n as i64,
        Err(e) => e.to_errno(),
    }
}

fn sys_open(path_ptr: u64, flags: u32) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let abs = absolute(&path);
    match crate::vfs::open(&abs, crate::vfs::OpenFlags(flags), process::current_pid()) {
        Ok(fd) => fd as i64,
        Err(e) => e.to_errno(),
    }
}

fn sys_close(fd: i32) -> i64 {
    if fd >= 0 && fd <= 2 {
        return 0; // the standard descriptors stay open
    }
    if crate::pipe::is_pipe_fd(fd) {
        return crate::pipe::close(fd);
    }
    match crate::vfs::close(fd, process::current_pid()) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_lseek(fd: i32, offset: i64, whence: u32) -> i64 {
    match crate::vfs::lseek(fd, offset, whence, process::current_pid()) {
        Ok(pos) => pos as i64,
        Err(e) => e.to_errno(),
    }
}

fn sys_stat(path_ptr: u64, statbuf: u64) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let st = match crate::vfs::stat(&absolute(&path)) {
        Ok(s) => s,
        Err(e) => return e.to_errno(),
    };

    match usercopy::write_struct_to_user(statbuf, &linux::stat_from_vfs(&st)) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_fstat(fd: i32, statbuf: u64) -> i64 {
    let stat = if (0..=2).contains(&fd) {
        // Standard descriptors present as a character device
        linux::LinuxStat {
            st_mode: linux::stat_mode::S_IFCHR | 0o666,
            st_blksize: 4096,
            ..linux::LinuxStat::default()
        }
    } else {
        match crate::vfs::fstat(fd, process::current_pid()) {
            Ok(s) => linux::stat_from_vfs(&s),
            Err(e) => return e.to_errno(),
        }
    };

    match usercopy::write_struct_to_user(statbuf, &stat) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_access(path_ptr: u64, _mode: u32) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    // All users are root; existence is the only check
    match crate::vfs::stat(&absolute(&path)) {
        Ok(_) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_pipe(pipefd_ptr: u64) -> i64 {
    let user = match UserSlice::rw(pipefd_ptr, 8) {
        Ok(u) => u,
        Err(e) => return e.to_errno(),
    };

    let (read_fd, write_fd) = crate::pipe::create(process::current_pid());
    let mut raw = [0u8; 8];
    raw[0..4].copy_from_slice(&read_fd.to_le_bytes());
    raw[4..8].copy_from_slice(&write_fd.to_le_bytes());
    if user.write_from(&raw).is_err() {
        return errno::EFAULT;
    }
    0
}

fn sys_dup(fd: i32) -> i64 {
    match crate::vfs::dup(fd, process::current_pid()) {
        Ok(new_fd) => new_fd as i64,
        Err(e) => e.to_errno(),
    }
}

fn sys_dup2(old_fd: i32, new_fd: i32) -> i64 {
    match crate::vfs::dup2(old_fd, new_fd, process::current_pid()) {
        Ok(fd) => fd as i64,
        Err(e) => e.to_errno(),
    }
}

fn sys_fcntl(fd: i32, cmd: u32, _arg: u64) -> i64 {
    const F_DUPFD: u32 = 0;
    const F_GETFD: u32 = 1;
    const F_SETFD: u32 = 2;
    const F_GETFL: u32 = 3;
    const F_SETFL: u32 = 4;

    match cmd {
        F_DUPFD => sys_dup(fd),
        F_GETFD | F_SETFD | F_GETFL | F_SETFL => 0,
        _ => errno::EINVAL,
    }
}

fn sys_ioctl(fd: i32, request: u64, arg: u64) -> i64 {
    const TCGETS: u64 = 0x5401;
    const TCSETS: u64 = 0x5402;
    const TIOCGWINSZ: u64 = 0x5413;

    if !(0..=2).contains(&fd) {
        return errno::ENOTTY;
    }

    match request {
        TCGETS | TCSETS => 0,
        TIOCGWINSZ => {
            let winsize: [u16; 4] = [25, 80, 0, 0];
            match usercopy::write_struct_to_user(arg, &winsize) {
                Ok(()) => 0,
                Err(e) => e.to_errno(),
            }
        }
        _ => 0,
    }
}

// ============================================================================
// Directories
// ============================================================================

fn sys_mkdir(path_ptr: u64) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    match crate::vfs::mkdir(&absolute(&path)) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_rmdir(path_ptr: u64) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    match crate::vfs::rmdir(&absolute(&path)) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_unlink(path_ptr: u64) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    match crate::vfs::unlink(&absolute(&path)) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn sys_getcwd(buf: u64, size: usize) -> i64 {
    let cwd = process::current_cwd();
    let needed = cwd.len() + 1;
    if size < needed {
        return errno::ERANGE;
    }

    let user = match UserSlice::rw(buf, needed) {
        Ok(u) => u,
        Err(e) => return e.to_errno(),
    };

    let mut bytes = Vec::with_capacity(needed);
    bytes.extend_from_slice(cwd.as_bytes());
    bytes.push(0);
    if user.write_from(&bytes).is_err() {
        return errno::EFAULT;
    }

    needed as i64
}

fn sys_chdir(path_ptr: u64) -> i64 {
    let path = match read_path(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let abs = absolute(&path);

    match crate::vfs::stat(&abs) {
        Ok(st) if st.kind == crate::vfs::FileKind::Directory => {
            process::set_current_cwd(abs);
            0
        }
        Ok(_) => errno::ENOTDIR,
        Err(e) => e.to_errno(),
    }
}

/// Directory-entry type tags for getdents64
mod dtype {
    pub const DT_DIR: u8 = 4;
    pub const DT_REG: u8 = 8;
}

/// Fixed part of a linux_dirent64 record (through d_type)
const DIRENT_HEADER: usize = 19;

/// getdents64: emit packed records until the next one would overflow the
/// caller's buffer; the directory cursor resumes there on the next call.
fn sys_getdents64(fd: i32, dirp: u64, count: usize) -> i64 {
    let user = match UserSlice::rw(dirp, count) {
        Ok(u) => u,
        Err(e) => return e.to_errno(),
    };
    let pid = process::current_pid();

    let mut packed: Vec<u8> = Vec::new();
    let mut emitted = 0usize;

    loop {
        let entry = match crate::vfs::next_dirent(fd, pid) {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => return e.to_errno(),
        };

        let name = entry.name.as_bytes();
        let reclen = (DIRENT_HEADER + name.len() + 1 + 7) & !7;

        if packed.len() + reclen > count {
            // Doesn't fit: rewind the cursor so the next call resumes here
            crate::vfs::unwind_dirent(fd, pid);
            if emitted == 0 {
                return errno::EINVAL; // buffer can't hold even one record
            }
            break;
        }

        let base = packed.len();
        packed.resize(base + reclen, 0);
        packed[base..base + 8].copy_from_slice(&entry.ino.to_le_bytes());
        let d_off = (emitted + 1) as u64;
        packed[base + 8..base + 16].copy_from_slice(&d_off.to_le_bytes());
        packed[base + 16..base + 18].copy_from_slice(&(reclen as u16).to_le_bytes());
        packed[base + 18] = match entry.kind {
            crate::vfs::FileKind::Directory => dtype::DT_DIR,
            crate::vfs::FileKind::File => dtype::DT_REG,
        };
        packed[base + DIRENT_HEADER..base + DIRENT_HEADER + name.len()].copy_from_slice(name);
        // NUL terminator is already there from the resize

        emitted += 1;
    }

    if !packed.is_empty() && user.write_from(&packed).is_err() {
        return errno::EFAULT;
    }

    packed.len() as i64
}

// ============================================================================
// Processes
// ============================================================================

fn sys_exit(code: i32) -> ! {
    process::exit_current(code);
    loop {
        // The zombie is never rescheduled; this yield is the final one.
        crate::scheduler::yield_now();
    }
}

fn sys_execve(pathname: u64, argv_ptr: u64, frame: &mut SyscallFrame) -> i64 {
    let path = match read_path(pathname) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let abs = absolute(&path);

    // argv: user array of string pointers, NULL-terminated
    let mut args: Vec<String> = Vec::new();
    if argv_ptr != 0 {
        for i in 0..64u64 {
            let slot: u64 = match usercopy::read_struct_from_user(argv_ptr + i * 8) {
                Ok(p) => p,
                Err(e) => return e.to_errno(),
            };
            if slot == 0 {
                break;
            }
            match usercopy::copy_string_from_user(slot, PATH_MAX) {
                Ok(s) => args.push(s),
                Err(e) => return e.to_errno(),
            }
        }
    }
    if args.is_empty() {
        args.push(abs.clone());
    }

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    crate::exec::execve(&abs, &arg_refs, frame)
}

/// wait4: pid -1 (or 0) waits for any child; WNOHANG polls.
/// Status packs as (exit_code & 0xFF) << 8.
fn sys_wait4(pid: i64, wstatus: u64, options: u32) -> i64 {
    const WNOHANG: u32 = 1;

    let target: process::Pid = if pid > 0 { pid as u32 } else { 0 };
    let nohang = options & WNOHANG != 0;

    loop {
        match process::wait_poll(target, !nohang) {
            process::WaitPoll::Reaped(child, code) => {
                if wstatus != 0 {
                    let status: i32 = (code & 0xFF) << 8;
                    if let Err(e) = usercopy::write_struct_to_user(wstatus, &status) {
                        return e.to_errno();
                    }
                }
                return child as i64;
            }
            process::WaitPoll::NoChild => return errno::ECHILD,
            process::WaitPoll::NotReady => {
                if nohang {
                    return 0;
                }
                // wait_poll left us Blocked; the exiting child wakes us
                crate::scheduler::yield_now();
            }
        }
    }
}

/// futex stub: enough for trivial single-threaded locking
fn sys_futex(addr: u64, op: u32, val: u32) -> i64 {
    const FUTEX_WAIT: u32 = 0;
    const FUTEX_WAKE: u32 = 1;
    const FUTEX_PRIVATE_FLAG: u32 = 128;

    match op & !FUTEX_PRIVATE_FLAG {
        FUTEX_WAIT => {
            let current: u32 = match usercopy::read_struct_from_user(addr) {
                Ok(v) => v,
                Err(e) => return e.to_errno(),
            };
            if current != val {
                return errno::EAGAIN;
            }
            crate::scheduler::yield_now();
            0
        }
        FUTEX_WAKE => 0,
        _ => errno::ENOSYS,
    }
}
