//! Linux ABI definitions and the memory / identity / time syscalls
//!
//! Syscall numbers follow the x86_64 table; structures are byte-compatible
//! with what statically linked Linux binaries expect.

use crate::memory::paging::{PageFlags, UserLayout, PAGE_SIZE};
use crate::process;
use crate::syscall::errno;
use crate::usercopy;

/// Linux syscall numbers (x86_64 ABI), the subset this kernel dispatches
pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const STAT: u64 = 4;
    pub const FSTAT: u64 = 5;
    pub const LSTAT: u64 = 6;
    pub const LSEEK: u64 = 8;
    pub const MMAP: u64 = 9;
    pub const MPROTECT: u64 = 10;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const IOCTL: u64 = 16;
    pub const ACCESS: u64 = 21;
    pub const PIPE: u64 = 22;
    pub const SCHED_YIELD: u64 = 24;
    pub const DUP: u64 = 32;
    pub const DUP2: u64 = 33;
    pub const NANOSLEEP: u64 = 35;
    pub const GETPID: u64 = 39;
    pub const FORK: u64 = 57;
    pub const VFORK: u64 = 58;
    pub const EXECVE: u64 = 59;
    pub const EXIT: u64 = 60;
    pub const WAIT4: u64 = 61;
    pub const UNAME: u64 = 63;
    pub const FCNTL: u64 = 72;
    pub const GETDENTS: u64 = 78;
    pub const GETCWD: u64 = 79;
    pub const CHDIR: u64 = 80;
    pub const MKDIR: u64 = 83;
    pub const RMDIR: u64 = 84;
    pub const UNLINK: u64 = 87;
    pub const READLINK: u64 = 89;
    pub const GETUID: u64 = 102;
    pub const GETGID: u64 = 104;
    pub const GETEUID: u64 = 107;
    pub const GETEGID: u64 = 108;
    pub const GETPPID: u64 = 110;
    pub const ARCH_PRCTL: u64 = 158;
    pub const GETTID: u64 = 186;
    pub const FUTEX: u64 = 202;
    pub const GETDENTS64: u64 = 217;
    pub const SET_TID_ADDRESS: u64 = 218;
    pub const CLOCK_GETTIME: u64 = 228;
    pub const EXIT_GROUP: u64 = 231;
    pub const PIPE2: u64 = 293;
}

/// mmap flags
pub mod mmap_flags {
    pub const MAP_PRIVATE: u64 = 0x02;
    pub const MAP_FIXED: u64 = 0x10;
    pub const MAP_ANONYMOUS: u64 = 0x20;
}

/// mmap protection flags
pub mod prot_flags {
    pub const PROT_READ: u64 = 0x1;
    pub const PROT_WRITE: u64 = 0x2;
    pub const PROT_EXEC: u64 = 0x4;
}

// ============================================================================
// Memory management
// ============================================================================

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

fn prot_to_flags(prot: u64) -> PageFlags {
    use prot_flags::*;
    let mut bits = PageFlags::PRESENT | PageFlags::USER;
    if prot & PROT_WRITE != 0 {
        bits |= PageFlags::WRITABLE;
    }
    if prot & PROT_EXEC == 0 {
        bits |= PageFlags::NO_EXECUTE;
    }
    PageFlags::new(bits)
}

/// brk: grow (or query) the program break a page at a time. A request that
/// cannot be satisfied leaves the break untouched and returns the old one.
pub fn sys_brk(addr: u64) -> i64 {
    let slot = process::current_slot();

    process::with_table(|t| {
        let p = match t[slot].as_mut() {
            Some(p) => p,
            None => return errno::EINVAL,
        };
        let old_brk = p.brk;

        if addr == 0 || addr == old_brk {
            return old_brk as i64;
        }
        if addr < p.brk_start || addr >= UserLayout::MMAP_BASE {
            return old_brk as i64;
        }

        let space = match p.space.as_mut() {
            Some(s) => s,
            None => return errno::EINVAL,
        };

        if addr > old_brk {
            // Extend page by page; on OOM undo this call's allocations
            let first_new = page_align_up(old_brk);
            let last_needed = page_align_up(addr);
            let mut va = first_new;

            while va < last_needed {
                if space.translate(va).is_none() {
                    let phys = match crate::memory::frame::alloc_frame_zeroed() {
                        Some(f) => f,
                        None => {
                            // Roll back everything this call mapped
                            let mut undo = first_new;
                            while undo < va {
                                if let Some(f) = space.unmap_page(undo) {
                                    crate::memory::frame::free_frame(f);
                                }
                                undo += PAGE_SIZE as u64;
                            }
                            return old_brk as i64;
                        }
                    };
                    if space.map_page(va, phys, PageFlags::USER_DATA).is_none() {
                        crate::memory::frame::free_frame(phys);
                        return old_brk as i64;
                    }
                }
                va += PAGE_SIZE as u64;
            }
        } else {
            // Shrink: release whole pages past the new break
            let keep_until = page_align_up(addr);
            let old_end = page_align_up(old_brk);
            let mut va = keep_until;
            while va < old_end {
                if let Some(f) = space.unmap_page(va) {
                    crate::memory::frame::free_frame(f);
                }
                va += PAGE_SIZE as u64;
            }
        }

        p.brk = addr;
        addr as i64
    })
}

/// mmap: anonymous private mappings carved from the per-process mmap break
pub fn sys_mmap(addr: u64, length: u64, prot: u64, flags: u64, fd: i64, _offset: u64) -> i64 {
    use mmap_flags::*;

    if length == 0 {
        return errno::EINVAL;
    }
    if (flags & MAP_ANONYMOUS) == 0 && fd >= 0 {
        return errno::ENOSYS; // no file-backed mappings
    }

    let aligned = page_align_up(length);
    let page_flags = prot_to_flags(prot);
    let slot = process::current_slot();

    process::with_table(|t| {
        let p = match t[slot].as_mut() {
            Some(p) => p,
            None => return errno::EINVAL,
        };

        let base = if (flags & MAP_FIXED) != 0 && addr != 0 {
            addr & !(PAGE_SIZE as u64 - 1)
        } else {
            let b = p.mmap_brk;
            p.mmap_brk += aligned;
            b
        };

        let space = match p.space.as_mut() {
            Some(s) => s,
            None => return errno::EINVAL,
        };

        let mut va = base;
        while va < base + aligned {
            if space.translate(va).is_none() {
                let phys = match crate::memory::frame::alloc_frame_zeroed() {
                    Some(f) => f,
                    None => {
                        let mut undo = base;
                        while undo < va {
                            if let Some(f) = space.unmap_page(undo) {
                                crate::memory::frame::free_frame(f);
                            }
                            undo += PAGE_SIZE as u64;
                        }
                        return errno::ENOMEM;
                    }
                };
                if space.map_page(va, phys, page_flags).is_none() {
                    crate::memory::frame::free_frame(phys);
                    return errno::ENOMEM;
                }
            }
            va += PAGE_SIZE as u64;
        }

        base as i64
    })
}

/// munmap: release a user range
pub fn sys_munmap(addr: u64, length: u64) -> i64 {
    if addr == 0 || length == 0 || addr % PAGE_SIZE as u64 != 0 {
        return errno::EINVAL;
    }
    if !crate::memory::is_user_address(addr) {
        return errno::EINVAL;
    }

    let aligned = page_align_up(length);
    let slot = process::current_slot();

    process::with_table(|t| {
        let p = match t[slot].as_mut() {
            Some(p) => p,
            None => return errno::EINVAL,
        };
        let space = match p.space.as_mut() {
            Some(s) => s,
            None => return errno::EINVAL,
        };

        let mut va = addr;
        while va < addr + aligned {
            if let Some(f) = space.unmap_page(va) {
                crate::memory::frame::free_frame(f);
            }
            va += PAGE_SIZE as u64;
        }
        0
    })
}

/// mprotect: rewrite leaf flags over a mapped range
pub fn sys_mprotect(addr: u64, length: u64, prot: u64) -> i64 {
    if addr % PAGE_SIZE as u64 != 0 {
        return errno::EINVAL;
    }
    if !crate::memory::is_user_address(addr) {
        return errno::EFAULT;
    }

    let aligned = page_align_up(length);
    let page_flags = prot_to_flags(prot);
    let slot = process::current_slot();

    process::with_table(|t| {
        let p = match t[slot].as_mut() {
            Some(p) => p,
            None => return errno::EINVAL,
        };
        let space = match p.space.as_mut() {
            Some(s) => s,
            None => return errno::EINVAL,
        };

        let mut va = addr;
        while va < addr + aligned {
            if let Some(phys) = space.translate(va) {
                let page_phys = phys & !(PAGE_SIZE as u64 - 1);
                space.map_page(va, page_phys, page_flags);
            }
            va += PAGE_SIZE as u64;
        }
        0
    })
}

// ============================================================================
// Identity
// ============================================================================

pub fn sys_getpid() -> i64 {
    process::current_pid() as i64
}

pub fn sys_getppid() -> i64 {
    let slot = process::current_slot();
    process::with_table(|t| t[slot].as_ref().map(|p| p.ppid as i64).unwrap_or(0))
}

/// Single-threaded processes: tid == pid
pub fn sys_gettid() -> i64 {
    sys_getpid()
}

/// Everyone is root
pub fn sys_getuid() -> i64 {
    0
}

pub fn sys_getgid() -> i64 {
    0
}

// ============================================================================
// arch_prctl
// ============================================================================

pub mod arch_prctl_codes {
    pub const ARCH_SET_GS: u64 = 0x1001;
    pub const ARCH_SET_FS: u64 = 0x1002;
    pub const ARCH_GET_FS: u64 = 0x1003;
    pub const ARCH_GET_GS: u64 = 0x1004;
}

/// Set or read the thread-local base. The value is stored in the process
/// slot (restored on every context switch) and written straight to the MSR.
pub fn sys_arch_prctl(code: u64, addr: u64) -> i64 {
    use arch_prctl_codes::*;

    match code {
        ARCH_SET_FS => {
            let slot = process::current_slot();
            process::with_table(|t| {
                if let Some(p) = t[slot].as_mut() {
                    p.fs_base = addr;
                }
            });
            unsafe {
                core::arch::asm!(
                    "wrmsr",
                    in("ecx") 0xC000_0100u32, // IA32_FS_BASE
                    in("eax") addr as u32,
                    in("edx") (addr >> 32) as u32,
                );
            }
            0
        }
        ARCH_GET_FS => {
            let val = crate::scheduler::read_fs_base();
            match usercopy::write_struct_to_user(addr, &val) {
                Ok(()) => 0,
                Err(e) => e.to_errno(),
            }
        }
        ARCH_SET_GS | ARCH_GET_GS => errno::EINVAL,
        _ => errno::EINVAL,
    }
}

// ============================================================================
// uname
// ============================================================================

/// utsname structure
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Utsname {
    pub sysname: [u8; 65],
    pub nodename: [u8; 65],
    pub release: [u8; 65],
    pub version: [u8; 65],
    pub machine: [u8; 65],
    pub domainname: [u8; 65],
}

fn copy_str_to_array(arr: &mut [u8; 65], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(64);
    arr[..len].copy_from_slice(&bytes[..len]);
}

pub fn sys_uname(buf: u64) -> i64 {
    let mut uname = Utsname {
        sysname: [0; 65],
        nodename: [0; 65],
        release: [0; 65],
        version: [0; 65],
        machine: [0; 65],
        domainname: [0; 65],
    };

    copy_str_to_array(&mut uname.sysname, "CobaltOS");
    copy_str_to_array(&mut uname.nodename, "cobalt");
    copy_str_to_array(&mut uname.release, "0.3.0");
    copy_str_to_array(&mut uname.version, "#1 CobaltOS");
    copy_str_to_array(&mut uname.machine, "x86_64");
    copy_str_to_array(&mut uname.domainname, "(none)");

    match usercopy::write_struct_to_user(buf, &uname) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

// ============================================================================
// Time
// ============================================================================

/// timespec structure
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

pub fn sys_clock_gettime(_clock_id: u32, tp: u64) -> i64 {
    let ms = crate::time::uptime_ms();
    let ts = Timespec {
        tv_sec: (ms / 1000) as i64,
        tv_nsec: ((ms % 1000) * 1_000_000) as i64,
    };

    match usercopy::write_struct_to_user(tp, &ts) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// nanosleep: yield until the deadline passes
pub fn sys_nanosleep(req: u64, rem: u64) -> i64 {
    let ts: Timespec = match usercopy::read_struct_from_user(req) {
        Ok(t) => t,
        Err(e) => return e.to_errno(),
    };
    if ts.tv_sec < 0 || ts.tv_nsec < 0 {
        return errno::EINVAL;
    }

    let ms = ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000;
    let deadline = crate::time::ticks() + ms * crate::time::TIMER_HZ / 1000;

    while crate::time::ticks() < deadline {
        crate::scheduler::yield_now();
    }

    if rem != 0 {
        let zero = Timespec::default();
        usercopy::write_struct_to_user(rem, &zero).ok();
    }

    0
}

// ============================================================================
// stat
// ============================================================================

/// Linux x86_64 stat structure
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct LinuxStat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_nlink: u64,
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub _pad0: u32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
    pub st_atime: i64,
    pub st_atime_nsec: i64,
    pub st_mtime: i64,
    pub st_mtime_nsec: i64,
    pub st_ctime: i64,
    pub st_ctime_nsec: i64,
    pub _unused: [i64; 3],
}

/// File type bits for st_mode
pub mod stat_mode {
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
}

/// Build a LinuxStat from VFS metadata
pub fn stat_from_vfs(st: &crate::vfs::Stat) -> LinuxStat {
    let mode = match st.kind {
        crate::vfs::FileKind::Directory => stat_mode::S_IFDIR | 0o755,
        crate::vfs::FileKind::File => stat_mode::S_IFREG | 0o644,
    };

    LinuxStat {
        st_ino: st.ino,
        st_nlink: 1,
        st_mode: mode,
        st_size: st.size as i64,
        st_blksize: 4096,
        st_blocks: (st.size as i64 + 511) / 512,
        ..LinuxStat::default()
    }
}
