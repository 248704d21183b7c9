//! Program loading
//!
//! Builds user address spaces from ELF images: maps LOAD segments, the user
//! stack, and lays out argv. `execve` replaces the current process image in
//! place; `spawn_program` creates the first process from a boot module.

use crate::elf::{self, LoadedElf, PF_W, PF_X};
use crate::interrupts::syscall::SyscallFrame;
use crate::memory::paging::{AddressSpace, PageFlags, UserLayout, PAGE_SIZE};
use crate::process;
use alloc::string::String;
use alloc::vec::Vec;

/// Initial RFLAGS for user mode: IF set, reserved bit 1 set
const USER_RFLAGS: u64 = 0x202;

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Copy bytes into a not-yet-active address space through the direct map
fn write_user(space: &AddressSpace, vaddr: u64, data: &[u8]) -> Result<(), i64> {
    let hhdm = crate::memory::hhdm_offset();
    let mut done = 0usize;

    while done < data.len() {
        let va = vaddr + done as u64;
        let in_page = (va % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - in_page).min(data.len() - done);

        let phys = space.translate(va).ok_or(crate::syscall::errno::EFAULT)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                data[done..].as_ptr(),
                (phys + hhdm) as *mut u8,
                chunk,
            );
        }
        done += chunk;
    }

    Ok(())
}

/// Map one LOAD segment into `space`, allocating fresh frames
fn map_segment(space: &mut AddressSpace, seg: &crate::elf::LoadedSegment) -> Result<(), i64> {
    let start = seg.vaddr & !(PAGE_SIZE as u64 - 1);
    let end = page_align_up(seg.vaddr + seg.data.len() as u64);

    let flags = if seg.flags & PF_X != 0 {
        PageFlags::USER_CODE
    } else if seg.flags & PF_W != 0 {
        PageFlags::USER_DATA
    } else {
        PageFlags::USER_RODATA
    };

    let mut va = start;
    while va < end {
        // Segments may share a page at their boundary; keep an existing
        // mapping rather than leaking its frame.
        if space.translate(va).is_none() {
            let phys = crate::memory::frame::alloc_frame_zeroed()
                .ok_or(crate::syscall::errno::ENOMEM)?;
            space
                .map_page(va, phys, flags)
                .ok_or(crate::syscall::errno::ENOMEM)?;
        }
        va += PAGE_SIZE as u64;
    }

    write_user(space, seg.vaddr, &seg.data)?;
    Ok(())
}

/// Build a complete address space for an ELF image: segments plus the user
/// stack region. Returns the space and the first break address.
fn build_space(image: &LoadedElf) -> Result<(AddressSpace, u64), i64> {
    let mut space = AddressSpace::new_with_kernel().ok_or(crate::syscall::errno::ENOMEM)?;

    for seg in &image.segments {
        map_segment(&mut space, seg)?;
    }

    // User stack
    let stack_bottom = UserLayout::STACK_TOP - UserLayout::STACK_SIZE;
    let mut va = stack_bottom;
    while va < UserLayout::STACK_TOP {
        let phys =
            crate::memory::frame::alloc_frame_zeroed().ok_or(crate::syscall::errno::ENOMEM)?;
        space
            .map_page(va, phys, PageFlags::USER_DATA)
            .ok_or(crate::syscall::errno::ENOMEM)?;
        va += PAGE_SIZE as u64;
    }

    Ok((space, page_align_up(image.max_vaddr)))
}

/// Lay out argv on the user stack:
/// string bytes at the top, then (16-aligned) a NULL terminator, the argv
/// pointers from last to first, and argc at the final stack pointer.
fn build_argv_stack(space: &AddressSpace, argv: &[&str]) -> Result<u64, i64> {
    let mut sp = UserLayout::STACK_TOP;
    let mut ptrs: Vec<u64> = Vec::with_capacity(argv.len());

    for arg in argv {
        sp -= arg.len() as u64 + 1;
        write_user(space, sp, arg.as_bytes())?;
        write_user(space, sp + arg.len() as u64, &[0u8])?;
        ptrs.push(sp);
    }

    sp &= !0xF;

    // argc + pointers + NULL is pushed below; pad so the final rsp stays
    // 16-byte aligned at entry.
    if (ptrs.len() + 2) % 2 == 1 {
        sp -= 8;
    }

    sp -= 8;
    write_user(space, sp, &0u64.to_le_bytes())?; // argv[argc] = NULL

    for &ptr in ptrs.iter().rev() {
        sp -= 8;
        write_user(space, sp, &ptr.to_le_bytes())?;
    }

    sp -= 8;
    write_user(space, sp, &(argv.len() as u64).to_le_bytes())?;

    Ok(sp)
}

/// A register frame that enters user mode at `entry` with stack `rsp`
fn initial_frame(entry: u64, rsp: u64) -> SyscallFrame {
    SyscallFrame {
        rip: entry,
        rflags: USER_RFLAGS,
        rsp,
        ..SyscallFrame::default()
    }
}

/// Create a new process from an in-memory ELF image (boot modules).
pub fn spawn_program(name: &str, image_bytes: &[u8], argv: &[&str]) -> Result<process::Pid, i64> {
    if !elf::is_elf(image_bytes) {
        return Err(crate::syscall::errno::ENOEXEC);
    }
    let image = elf::load_from_bytes(image_bytes).map_err(|e| e.to_errno())?;

    let (space, brk_start) = build_space(&image)?;
    let user_sp = build_argv_stack(&space, argv)?;
    let frame = initial_frame(image.entry_point, user_sp);

    let pid = process::spawn(name, 0, space, &frame, brk_start, String::from("/"))?;
    crate::log!("[EXEC] Spawned '{}' as pid {} (entry {:#x})", name, pid, image.entry_point);
    Ok(pid)
}

/// Replace the current process image (POSIX semantics).
///
/// On success the saved user frame is rewritten so the syscall return lands
/// at the new entry point; the old address space is destroyed. On any
/// failure before the switch the current image stays untouched.
pub fn execve(path: &str, argv: &[&str], frame: &mut SyscallFrame) -> i64 {
    let pid = process::current_pid();

    let bytes = match crate::vfs::read_file(path, pid) {
        Ok(b) => b,
        Err(e) => return e.to_errno(),
    };
    if !elf::is_elf(&bytes) {
        return crate::syscall::errno::ENOEXEC;
    }
    let image = match elf::load_from_bytes(&bytes) {
        Ok(i) => i,
        Err(e) => return e.to_errno(),
    };

    let (space, brk_start) = match build_space(&image) {
        Ok(pair) => pair,
        Err(e) => return e,
    };
    let user_sp = match build_argv_stack(&space, argv) {
        Ok(sp) => sp,
        Err(e) => return e,
    };

    // Point of no return: adopt the new space, then drop the old one.
    // CR3 must move off the old root before its frames are released.
    unsafe {
        space.activate();
    }

    let slot = process::current_slot();
    let old_space = process::with_table(|t| {
        let p = t[slot].as_mut().unwrap();
        let old = p.space.take();
        p.space = Some(space);
        p.brk_start = brk_start;
        p.brk = brk_start;
        p.mmap_brk = UserLayout::MMAP_BASE;
        p.fs_base = 0;
        p.name = String::from(crate::vfs::basename(path));
        old
    });
    drop(old_space);

    *frame = initial_frame(image.entry_point, user_sp);

    crate::log_debug!("[EXEC] pid {} now running {} (entry {:#x})", pid, path, image.entry_point);
    0
}
