//! CobaltOS kernel
//!
//! A small x86_64 kernel: preemptive multitasking of ELF user programs,
//! a Linux-compatible syscall interface, a Unix-style VFS with ramfs and
//! ext2 backends, and a DMA-capable IDE block driver. Boots via the Limine
//! protocol on UEFI/BIOS systems.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
extern crate alloc;

// Core infrastructure
mod framebuffer;
mod gdt;
mod keyboard;
mod logger;
mod serial;
mod time;

// Subsystems
mod drivers;
mod elf;
mod exec;
mod interrupts;
mod memory;
mod pipe;
mod process;
mod scheduler;
mod syscall;
mod usercopy;
mod vfs;

use core::alloc::Layout;
use core::panic::PanicInfo;
use limine::request::{
    FramebufferRequest, HhdmRequest, MemoryMapRequest, ModuleRequest, RequestsEndMarker,
    RequestsStartMarker,
};
use limine::BaseRevision;

// ============================================================================
// Limine protocol requests
// ============================================================================

/// Limine requests start marker
#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

/// Limine base revision - ensures protocol compatibility
#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Framebuffer for the write-only display device
#[used]
#[unsafe(link_section = ".requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Physical memory map
#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Higher half direct map offset
#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// Boot modules; module 0 is the initial user program
#[used]
#[unsafe(link_section = ".requests")]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

/// Limine requests end marker
#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

// ============================================================================
// Kernel entry point
// ============================================================================

/// Kernel entry, called by the Limine bootloader.
///
/// Initialization order matters: PMM and paging before anything that
/// allocates frames, segments and interrupts before the scheduler, the
/// block device before the root mount, and the first user process last.
#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    if !BASE_REVISION.is_supported() {
        halt_loop();
    }

    // Phase 1: serial console for early output
    serial::init();
    serial_println!("CobaltOS kernel v0.3.0");

    // Phase 2: record the framebuffer (write-only device, no renderer)
    if let Some(fb_response) = FRAMEBUFFER_REQUEST.get_response() {
        if let Some(fb) = fb_response.framebuffers().next() {
            framebuffer::init(fb.addr(), fb.width(), fb.height(), fb.pitch(), fb.bpp());
            serial_println!("Framebuffer: {}x{} @ {:p}", fb.width(), fb.height(), fb.addr());
        }
    }

    // Phase 3: memory. Scan the map, carve out the heap, then hand the
    // remaining usable regions to the frame allocator.
    let mmap_response = MEMORY_MAP_REQUEST
        .get_response()
        .unwrap_or_else(|| halt_fatal("no memory map from bootloader"));
    let hhdm_offset = HHDM_REQUEST
        .get_response()
        .map(|r| r.offset())
        .unwrap_or_else(|| halt_fatal("no HHDM from bootloader"));

    serial_println!("HHDM offset: {:#x}", hhdm_offset);
    serial_println!("Memory map entries: {}", mmap_response.entries().len());

    let mut total_phys: u64 = 0;
    let mut kernel_end: u64 = 0;
    for entry in mmap_response.entries() {
        total_phys += entry.length;
        if entry.entry_type == limine::memory_map::EntryType::EXECUTABLE_AND_MODULES
            || entry.entry_type == limine::memory_map::EntryType::BOOTLOADER_RECLAIMABLE
        {
            let end = entry.base + entry.length;
            if end > kernel_end {
                kernel_end = end;
            }
        }
    }
    memory::set_total_physical_memory(total_phys);
    serial_println!("[MEM] Total physical memory: {} MB", total_phys / 1024 / 1024);

    let heap_size = memory::compute_heap_size(total_phys);
    let align_up = |addr: u64| (addr + 0xFFF) & !0xFFF;
    let min_heap_base = align_up(core::cmp::max(0x10_0000, kernel_end));

    let mut heap_phys: Option<u64> = None;
    for entry in mmap_response.entries() {
        if entry.entry_type != limine::memory_map::EntryType::USABLE {
            continue;
        }
        let start = core::cmp::max(align_up(entry.base), min_heap_base);
        if entry.base + entry.length >= start + heap_size as u64 {
            heap_phys = Some(start);
            break;
        }
    }
    let heap_phys = heap_phys.unwrap_or_else(|| halt_fatal("no region large enough for the heap"));
    memory::init(hhdm_offset, heap_phys, heap_size);

    // Frame allocator over the usable regions, heap carved out
    let mut regions = alloc::vec::Vec::new();
    for entry in mmap_response.entries() {
        if entry.entry_type == limine::memory_map::EntryType::USABLE {
            regions.push(memory::frame::PhysRegion {
                base: entry.base,
                length: entry.length,
            });
        }
    }
    memory::frame::init(&regions, heap_phys, heap_size as u64);
    memory::paging::init();

    // Phase 4: segments, interrupts, syscall entry
    gdt::init();
    interrupts::init();
    syscall::init();

    // Phase 5: processes, scheduler tick source
    process::init();
    time::init();

    // Phase 6: block device
    let bm_base = drivers::pci::find_ide_controller()
        .map(|c| c.bus_master_base)
        .unwrap_or(0);
    drivers::ata::init(bm_base);

    // Phase 7: VFS, filesystem registration, root mount
    vfs::init();
    vfs::register_driver(&vfs::ext2::DRIVER);

    let mut root_mounted = false;
    for drive in 0..4 {
        let present = drivers::ata::drive_info(drive)
            .map(|d| d.present && !d.atapi)
            .unwrap_or(false);
        if !present {
            continue;
        }
        if vfs::ext2::probe(drive, 0) {
            match vfs::mount_device("ext2", device_path(drive), "/") {
                Ok(()) => {
                    root_mounted = true;
                    break;
                }
                Err(e) => {
                    log_warn!("[VFS] ext2 root mount on drive {} failed: {:?}", drive, e);
                }
            }
        }
    }
    if !root_mounted {
        // No disk: an empty ramfs serves as the root
        vfs::mount_at("/", alloc::sync::Arc::new(vfs::ramfs::RamFs::new())).ok();
        log_warn!("[VFS] No ext2 volume found, root is ramfs");
    }

    // Phase 8: boot-time self tests
    let (passed, failed) = memory::frame::self_test();
    if failed > 0 {
        log_error!("[BOOT] Frame allocator self-test: {} passed, {} FAILED", passed, failed);
    } else {
        log_debug!("[BOOT] Frame allocator self-test: {} passed", passed);
    }
    vfs_smoke_test();

    // Phase 9: first user process from boot module 0
    let mut spawned = false;
    if let Some(module_response) = MODULE_REQUEST.get_response() {
        let modules = module_response.modules();
        serial_println!("[BOOT] {} boot module(s)", modules.len());

        if let Some(module) = modules.first() {
            let path = module.path().to_str().unwrap_or("module0");
            let data =
                unsafe { core::slice::from_raw_parts(module.addr(), module.size() as usize) };
            serial_println!("[BOOT] Module 0: {} ({} bytes)", path, data.len());

            match exec::spawn_program("init", data, &[path]) {
                Ok(pid) => {
                    log!("[BOOT] init is pid {}", pid);
                    spawned = true;
                }
                Err(e) => log_error!("[BOOT] Failed to load init: errno {}", e),
            }
        }
    }
    if !spawned {
        log_warn!("[BOOT] No init program; staying in the idle loop");
    }

    // Phase 10: enter the dispatch loop. From here on the kernel runs only
    // in response to interrupts and system calls; this boot path becomes
    // the idle task.
    scheduler::start();
    loop {
        scheduler::yield_now();
        x86_64::instructions::hlt();
    }
}

/// Write/read-back round trip through the VFS on the ramfs /dev mount
fn vfs_smoke_test() {
    use vfs::OpenFlags;

    let flags = OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT);
    let fd = match vfs::open("/dev/selftest", flags, 0) {
        Ok(fd) => fd,
        Err(e) => {
            log_error!("[BOOT] VFS self-test: open failed: {:?}", e);
            return;
        }
    };

    let payload = b"cobalt";
    let mut ok = vfs::write(fd, payload, 0).map_or(false, |n| n == payload.len());

    vfs::lseek(fd, 0, 0, 0).ok();
    let mut back = [0u8; 8];
    ok &= vfs::read(fd, &mut back, 0).map_or(false, |n| {
        n == payload.len() && &back[..n] == payload
    });

    vfs::close(fd, 0).ok();
    vfs::unlink("/dev/selftest").ok();

    if ok {
        log_debug!("[BOOT] VFS self-test: PASS");
    } else {
        log_error!("[BOOT] VFS self-test: FAIL");
    }
}

/// Ramfs device node for a drive index
fn device_path(drive: usize) -> &'static str {
    match drive {
        0 => "/dev/hda",
        1 => "/dev/hdb",
        2 => "/dev/hdc",
        _ => "/dev/hdd",
    }
}

// ============================================================================
// Core functions
// ============================================================================

/// Halt the CPU in an infinite loop
fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Fatal boot error: report and halt
fn halt_fatal(msg: &str) -> ! {
    serial_println!("[BOOT] FATAL: {}", msg);
    halt_loop();
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    serial_println!("\n!!! ALLOC ERROR !!!");
    serial_println!("layout: size={}, align={}", layout.size(), layout.align());
    halt_loop();
}

/// Panic handler: print diagnostic state and halt. The kernel never
/// recovers from exceptions taken in kernel mode.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("\n!!! KERNEL PANIC !!!");
    serial_println!("{}", info);
    halt_loop();
}
