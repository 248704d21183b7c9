//! ATA/IDE driver with bus-master DMA
//!
//! Two legacy channels, up to four drives. Once the scheduler is running,
//! transfers that fit in the channel's bounce page go through bus-master
//! DMA: the caller blocks and the IRQ handler wakes it. Everything else
//! (early boot, non-DMA drives, oversized chunks) falls back to PIO a
//! sector at a time.
//!
//! Invariant: a channel is `Pending` iff some process sits in its `waiter`
//! slot.

use alloc::string::String;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// Sector size in bytes
pub const SECTOR_SIZE: usize = 512;

/// Bounce buffer is one page: at most 8 sectors per DMA transfer
const DMA_MAX_SECTORS: usize = 4096 / SECTOR_SIZE;

/// Transfer retries before giving up
const MAX_RETRIES: u32 = 3;

/// DMA completion timeout in timer ticks (~5 s)
const DMA_TIMEOUT_TICKS: u64 = 5 * crate::time::TIMER_HZ;

/// ATA commands
mod cmd {
    pub const READ_SECTORS: u8 = 0x20;
    pub const READ_SECTORS_EXT: u8 = 0x24;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const WRITE_SECTORS: u8 = 0x30;
    pub const WRITE_SECTORS_EXT: u8 = 0x34;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const IDENTIFY_PACKET: u8 = 0xA1;
    pub const READ_DMA: u8 = 0xC8;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const CACHE_FLUSH: u8 = 0xE7;
    pub const CACHE_FLUSH_EXT: u8 = 0xEA;
    pub const IDENTIFY: u8 = 0xEC;
}

/// Status register bits
mod status {
    pub const ERR: u8 = 1 << 0;
    pub const DRQ: u8 = 1 << 3;
    pub const DF: u8 = 1 << 5;
    pub const BSY: u8 = 1 << 7;
}

/// Bus-master register offsets (per channel)
mod bm {
    pub const COMMAND: u16 = 0;
    pub const STATUS: u16 = 2;
    pub const PRDT: u16 = 4;

    pub const CMD_START: u8 = 1 << 0;
    pub const CMD_READ: u8 = 1 << 3; // direction: device -> memory
    pub const STATUS_ERR: u8 = 1 << 1;
    pub const STATUS_IRQ: u8 = 1 << 2;
}

/// Legacy I/O port bases
const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CTRL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CTRL: u16 = 0x376;

/// Driver errors; `to_errno` maps them at the filesystem boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskError {
    NoDevice,
    /// Optical drive: detected but I/O is refused
    Unsupported,
    Io,
    Timeout,
    BadBuffer,
}

impl DiskError {
    pub fn to_errno(self) -> i64 {
        match self {
            DiskError::NoDevice | DiskError::Unsupported => crate::syscall::errno::ENODEV,
            DiskError::BadBuffer => crate::syscall::errno::EINVAL,
            DiskError::Io | DiskError::Timeout => crate::syscall::errno::EIO,
        }
    }
}

/// Identify results for one drive
#[derive(Clone, Debug, Default)]
pub struct DriveInfo {
    pub present: bool,
    pub atapi: bool,
    pub lba48: bool,
    pub dma: bool,
    pub sectors: u64,
    pub model: String,
    pub serial: String,
}

/// Channel transfer state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelState {
    Idle,
    Pending,
}

/// One IDE channel (two drives each)
struct Channel {
    io_base: u16,
    ctrl_base: u16,
    /// Bus-master register block for this channel (0 = no DMA)
    bm_base: u16,
    state: ChannelState,
    /// Process blocked on the in-flight DMA transfer
    waiter: Option<u32>,
    /// Status captured by the IRQ handler
    irq_status: u8,
    /// Physical address of the PRD table (one page)
    prdt_phys: u64,
    /// Physical address of the bounce buffer (one page)
    bounce_phys: u64,
}

impl Channel {
    const fn new(io_base: u16, ctrl_base: u16) -> Self {
        Self {
            io_base,
            ctrl_base,
            bm_base: 0,
            state: ChannelState::Idle,
            waiter: None,
            irq_status: 0,
            prdt_phys: 0,
            bounce_phys: 0,
        }
    }
}

static CHANNELS: [Mutex<Channel>; 2] = [
    Mutex::new(Channel::new(PRIMARY_IO, PRIMARY_CTRL)),
    Mutex::new(Channel::new(SECONDARY_IO, SECONDARY_CTRL)),
];

static DRIVES: Mutex<[Option<DriveInfo>; 4]> = Mutex::new([None, None, None, None]);

fn channel_of(drive: usize) -> usize {
    drive / 2
}

fn is_slave(drive: usize) -> bool {
    drive % 2 == 1
}

// ---------------------------------------------------------------------------
// Port helpers
// ---------------------------------------------------------------------------

fn inb(port: u16) -> u8 {
    unsafe { Port::<u8>::new(port).read() }
}

fn outb(port: u16, value: u8) {
    unsafe { Port::<u8>::new(port).write(value) }
}

fn inw(port: u16) -> u16 {
    unsafe { Port::<u16>::new(port).read() }
}

fn outw(port: u16, value: u16) {
    unsafe { Port::<u16>::new(port).write(value) }
}

fn outl(port: u16, value: u32) {
    unsafe { Port::<u32>::new(port).write(value) }
}

/// ~400ns settle delay: four alternate-status reads
fn io_delay(ctrl_base: u16) {
    for _ in 0..4 {
        let _ = inb(ctrl_base);
    }
}

/// Busy-poll until BSY clears. Interrupts stay enabled; this is the
/// early-boot wait as well as the PIO wait.
fn wait_ready(io_base: u16) -> Result<(), DiskError> {
    for _ in 0..1_000_000 {
        let st = inb(io_base + 7);

        if st == 0xFF {
            return Err(DiskError::NoDevice);
        }
        if st & status::BSY == 0 {
            if st & (status::ERR | status::DF) != 0 {
                return Err(DiskError::Io);
            }
            return Ok(());
        }

        core::hint::spin_loop();
    }

    Err(DiskError::Timeout)
}

/// Busy-poll until the device requests data
fn wait_drq(io_base: u16) -> Result<(), DiskError> {
    for _ in 0..1_000_000 {
        let st = inb(io_base + 7);

        if st & (status::ERR | status::DF) != 0 {
            return Err(DiskError::Io);
        }
        if st & status::BSY == 0 && st & status::DRQ != 0 {
            return Ok(());
        }

        core::hint::spin_loop();
    }

    Err(DiskError::Timeout)
}

fn soft_reset(ctrl_base: u16) {
    outb(ctrl_base, 0x04);
    for _ in 0..1000 {
        core::hint::spin_loop();
    }
    outb(ctrl_base, 0x00);
    for _ in 0..10000 {
        core::hint::spin_loop();
    }
}

fn select_drive(io_base: u16, ctrl_base: u16, slave: bool) {
    outb(io_base + 6, if slave { 0xB0 } else { 0xA0 });
    io_delay(ctrl_base);
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Decode an IDENTIFY string field: words are big-endian byte pairs,
/// right-padded with spaces.
fn identify_string(data: &[u16], first: usize, last: usize) -> String {
    let mut s = String::new();
    for i in first..last {
        let word = data[i];
        for b in [(word >> 8) as u8, (word & 0xFF) as u8] {
            if (0x20..0x7F).contains(&b) {
                s.push(b as char);
            }
        }
    }
    s.trim_end().into()
}

/// IDENTIFY one drive position
fn identify_drive(io_base: u16, ctrl_base: u16, slave: bool) -> Option<DriveInfo> {
    select_drive(io_base, ctrl_base, slave);

    // Clear sector count and LBA registers
    outb(io_base + 2, 0);
    outb(io_base + 3, 0);
    outb(io_base + 4, 0);
    outb(io_base + 5, 0);

    outb(io_base + 7, cmd::IDENTIFY);

    if inb(io_base + 7) == 0 {
        return None; // nothing there
    }

    // ATAPI devices abort IDENTIFY and leave their signature in LBA mid/high
    let mut atapi = false;
    if wait_ready(io_base).is_err() {
        let sig_mid = inb(io_base + 4);
        let sig_high = inb(io_base + 5);

        if sig_mid == 0x14 && sig_high == 0xEB {
            atapi = true;
            outb(io_base + 7, cmd::IDENTIFY_PACKET);
            if wait_ready(io_base).is_err() {
                return None;
            }
        } else {
            return None;
        }
    }

    if wait_drq(io_base).is_err() {
        return None;
    }

    let mut data = [0u16; 256];
    for word in data.iter_mut() {
        *word = inw(io_base);
    }

    let lba48 = data[83] & (1 << 10) != 0;
    let dma = data[49] & (1 << 8) != 0;

    let sectors = if lba48 {
        (data[100] as u64)
            | ((data[101] as u64) << 16)
            | ((data[102] as u64) << 32)
            | ((data[103] as u64) << 48)
    } else {
        (data[60] as u64) | ((data[61] as u64) << 16)
    };

    Some(DriveInfo {
        present: true,
        atapi,
        lba48,
        dma,
        sectors,
        model: identify_string(&data, 27, 47),
        serial: identify_string(&data, 10, 20),
    })
}

/// Probe both channels and set up DMA structures.
///
/// `bus_master_base` comes from the IDE controller's BAR4 (0 disables DMA).
pub fn init(bus_master_base: u16) {
    crate::log!("[ATA] Probing IDE channels...");

    for ch_idx in 0..2usize {
        let (io_base, ctrl_base) = crate::interrupts::without_interrupts(|| {
            let mut ch = CHANNELS[ch_idx].lock();

            if bus_master_base != 0 {
                ch.bm_base = bus_master_base + (ch_idx as u16) * 8;

                // PRD table and bounce buffer each take one physical page.
                // The PRD address field is 32-bit, so the frames must sit
                // below 4G; the first-fit allocator hands out low frames
                // first.
                if let (Some(prdt), Some(bounce)) = (
                    crate::memory::frame::alloc_frame_zeroed(),
                    crate::memory::frame::alloc_frame_zeroed(),
                ) {
                    if prdt < 0x1_0000_0000 && bounce < 0x1_0000_0000 {
                        ch.prdt_phys = prdt;
                        ch.bounce_phys = bounce;
                    } else {
                        crate::log_warn!("[ATA] DMA buffers above 4G, channel {} PIO only", ch_idx);
                        crate::memory::frame::free_frame(prdt);
                        crate::memory::frame::free_frame(bounce);
                        ch.bm_base = 0;
                    }
                }
            }

            (ch.io_base, ch.ctrl_base)
        });

        soft_reset(ctrl_base);

        for slave in [false, true] {
            let drive_idx = ch_idx * 2 + slave as usize;
            if let Some(info) = identify_drive(io_base, ctrl_base, slave) {
                crate::log!(
                    "[ATA] hd{}: {} ({} sectors, lba48={}, dma={}{})",
                    (b'a' + drive_idx as u8) as char,
                    info.model,
                    info.sectors,
                    info.lba48,
                    info.dma,
                    if info.atapi { ", optical: I/O refused" } else { "" }
                );
                DRIVES.lock()[drive_idx] = Some(info);
            }
        }

        // Clear any stale device control state, enable INTRQ
        outb(ctrl_base, 0x00);
    }

    let count = DRIVES.lock().iter().filter(|d| d.is_some()).count();
    crate::log!("[ATA] Found {} drive(s)", count);
}

/// Info for a probed drive
pub fn drive_info(drive: usize) -> Option<DriveInfo> {
    DRIVES.lock().get(drive)?.clone()
}

/// Number of drives that answered IDENTIFY
pub fn drive_count() -> usize {
    DRIVES.lock().iter().filter(|d| d.is_some()).count()
}

// ---------------------------------------------------------------------------
// IRQ path
// ---------------------------------------------------------------------------

/// IDE channel IRQ: acknowledge the device and the bus master, then wake
/// whoever is blocked on the transfer.
pub fn handle_irq(ch_idx: usize) {
    let mut ch = CHANNELS[ch_idx].lock();

    // Reading the status register clears the device's INTRQ line
    let st = inb(ch.io_base + 7);

    if ch.bm_base != 0 {
        let bm_st = inb(ch.bm_base + bm::STATUS);
        // Clear the interrupt (and any error) bit, stop the engine
        outb(ch.bm_base + bm::STATUS, bm_st | bm::STATUS_IRQ | bm::STATUS_ERR);
        outb(ch.bm_base + bm::COMMAND, 0);
    }

    if ch.state == ChannelState::Pending {
        ch.irq_status = st;
        ch.state = ChannelState::Idle;
        if let Some(pid) = ch.waiter.take() {
            crate::process::wake(pid);
        }
    }
}

// ---------------------------------------------------------------------------
// DMA path
// ---------------------------------------------------------------------------

/// Program the drive registers for an LBA transfer
fn program_lba(io_base: u16, lba48: bool, slave: bool, lba: u64, nsect: usize) {
    if lba48 {
        outb(io_base + 6, 0x40 | ((slave as u8) << 4));
        outb(io_base + 2, (nsect >> 8) as u8);
        outb(io_base + 3, (lba >> 24) as u8);
        outb(io_base + 4, (lba >> 32) as u8);
        outb(io_base + 5, (lba >> 40) as u8);
        outb(io_base + 2, nsect as u8);
        outb(io_base + 3, lba as u8);
        outb(io_base + 4, (lba >> 8) as u8);
        outb(io_base + 5, (lba >> 16) as u8);
    } else {
        outb(
            io_base + 6,
            0xE0 | ((slave as u8) << 4) | ((lba >> 24) as u8 & 0x0F),
        );
        outb(io_base + 2, nsect as u8);
        outb(io_base + 3, lba as u8);
        outb(io_base + 4, (lba >> 8) as u8);
        outb(io_base + 5, (lba >> 16) as u8);
    }
}

/// One DMA transfer of at most DMA_MAX_SECTORS. Blocks the calling process
/// until the channel IRQ fires or the timeout lapses.
///
/// `buf` is raw because the same path serves reads (written through) and
/// writes (only read from); the callers in `transfer` pick the correct
/// mutability at the boundary.
fn dma_transfer(
    ch_idx: usize,
    slave: bool,
    lba48: bool,
    lba: u64,
    nsect: usize,
    buf: *mut u8,
    is_write: bool,
) -> Result<(), DiskError> {
    let bytes = nsect * SECTOR_SIZE;
    let pid = crate::process::current_pid();

    // The channel lock is only ever taken with interrupts masked; the IRQ
    // handler takes it too, and a spinlock held across an interrupt would
    // deadlock a single CPU.
    let (io_base, bounce_virt) = crate::interrupts::without_interrupts(|| -> Result<(u16, u64), DiskError> {
        let mut ch = CHANNELS[ch_idx].lock();
        let bounce_virt = crate::memory::phys_to_virt(ch.bounce_phys);

        // Fill the bounce buffer for writes
        if is_write {
            unsafe {
                core::ptr::copy_nonoverlapping(buf as *const u8, bounce_virt as *mut u8, bytes);
            }
        }

        // Single PRD entry: bounce page, byte count, end-of-table
        let prdt_virt = crate::memory::phys_to_virt(ch.prdt_phys);
        unsafe {
            core::ptr::write_volatile(prdt_virt as *mut u32, ch.bounce_phys as u32);
            core::ptr::write_volatile((prdt_virt + 4) as *mut u16, bytes as u16);
            core::ptr::write_volatile((prdt_virt + 6) as *mut u16, 0x8000);
        }

        outl(ch.bm_base + bm::PRDT, ch.prdt_phys as u32);
        // Clear stale error/interrupt bits
        let bm_st = inb(ch.bm_base + bm::STATUS);
        outb(ch.bm_base + bm::STATUS, bm_st | bm::STATUS_IRQ | bm::STATUS_ERR);

        select_drive(ch.io_base, ch.ctrl_base, slave);
        wait_ready(ch.io_base)?;
        program_lba(ch.io_base, lba48, slave, lba, nsect);

        ch.state = ChannelState::Pending;
        ch.waiter = Some(pid);

        let command = match (lba48, is_write) {
            (false, false) => cmd::READ_DMA,
            (false, true) => cmd::WRITE_DMA,
            (true, false) => cmd::READ_DMA_EXT,
            (true, true) => cmd::WRITE_DMA_EXT,
        };
        outb(ch.io_base + 7, command);

        // Direction bit is from the bus master's point of view
        let dir = if is_write { 0 } else { bm::CMD_READ };
        outb(ch.bm_base + bm::COMMAND, bm::CMD_START | dir);

        Ok((ch.io_base, bounce_virt))
    })?;

    // Block until the IRQ flips the channel back to Idle
    let deadline = crate::time::ticks() + DMA_TIMEOUT_TICKS;
    loop {
        let still_pending = crate::interrupts::without_interrupts(|| {
            let mut ch = CHANNELS[ch_idx].lock();
            if ch.state == ChannelState::Pending {
                ch.waiter = Some(pid);
                crate::process::block_current();
                true
            } else {
                false
            }
        });

        if !still_pending {
            break;
        }

        if crate::time::ticks() > deadline {
            // Abort: stop the engine, drop the waiter
            crate::interrupts::without_interrupts(|| {
                let mut ch = CHANNELS[ch_idx].lock();
                if ch.bm_base != 0 {
                    outb(ch.bm_base + bm::COMMAND, 0);
                }
                ch.state = ChannelState::Idle;
                ch.waiter = None;
            });
            crate::process::unblock_current();
            crate::log_error!("[ATA] DMA timeout on channel {}", ch_idx);
            return Err(DiskError::Timeout);
        }

        crate::scheduler::yield_now();
    }

    let irq_status =
        crate::interrupts::without_interrupts(|| CHANNELS[ch_idx].lock().irq_status);
    if irq_status & (status::ERR | status::DF) != 0 {
        crate::log_warn!("[ATA] DMA error, status {:#04x}", irq_status);
        let _ = inb(io_base + 1); // error register, diagnostic only
        return Err(DiskError::Io);
    }

    if !is_write {
        unsafe {
            core::ptr::copy_nonoverlapping(bounce_virt as *const u8, buf, bytes);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// PIO path
// ---------------------------------------------------------------------------

/// One-sector PIO transfer; `buf` points at SECTOR_SIZE bytes
fn pio_sector(
    ch_idx: usize,
    slave: bool,
    lba48: bool,
    lba: u64,
    buf: *mut u8,
    is_write: bool,
) -> Result<(), DiskError> {
    let (io_base, ctrl_base) = crate::interrupts::without_interrupts(|| {
        let ch = CHANNELS[ch_idx].lock();
        (ch.io_base, ch.ctrl_base)
    });

    select_drive(io_base, ctrl_base, slave);
    wait_ready(io_base)?;
    program_lba(io_base, lba48, slave, lba, 1);

    let command = match (lba48, is_write) {
        (false, false) => cmd::READ_SECTORS,
        (false, true) => cmd::WRITE_SECTORS,
        (true, false) => cmd::READ_SECTORS_EXT,
        (true, true) => cmd::WRITE_SECTORS_EXT,
    };
    outb(io_base + 7, command);

    wait_drq(io_base)?;

    if is_write {
        let src = unsafe { core::slice::from_raw_parts(buf as *const u8, SECTOR_SIZE) };
        for i in 0..SECTOR_SIZE / 2 {
            let word = (src[i * 2] as u16) | ((src[i * 2 + 1] as u16) << 8);
            outw(io_base, word);
        }
        outb(
            io_base + 7,
            if lba48 { cmd::CACHE_FLUSH_EXT } else { cmd::CACHE_FLUSH },
        );
        wait_ready(io_base)?;
    } else {
        let dst = unsafe { core::slice::from_raw_parts_mut(buf, SECTOR_SIZE) };
        for i in 0..SECTOR_SIZE / 2 {
            let word = inw(io_base);
            dst[i * 2] = (word & 0xFF) as u8;
            dst[i * 2 + 1] = (word >> 8) as u8;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Shared read/write core. `buf` is a raw pointer so one path can serve
/// both directions; the public wrappers establish the real mutability.
fn transfer(
    drive: usize,
    lba: u64,
    count: usize,
    buf: *mut u8,
    buf_len: usize,
    is_write: bool,
) -> Result<(), DiskError> {
    if count == 0 {
        return Ok(());
    }
    if buf_len < count * SECTOR_SIZE {
        return Err(DiskError::BadBuffer);
    }

    let info = DRIVES
        .lock()
        .get(drive)
        .and_then(|d| d.clone())
        .ok_or(DiskError::NoDevice)?;
    if info.atapi {
        return Err(DiskError::Unsupported);
    }
    if lba + count as u64 > info.sectors {
        return Err(DiskError::BadBuffer);
    }

    let ch_idx = channel_of(drive);
    let slave = is_slave(drive);
    let dma_ok = info.dma
        && crate::scheduler::is_running()
        && crate::interrupts::without_interrupts(|| CHANNELS[ch_idx].lock().bm_base != 0);

    let mut done = 0usize;
    while done < count {
        let remaining = count - done;
        let chunk_lba = lba + done as u64;

        let chunk_ptr = unsafe { buf.add(done * SECTOR_SIZE) };

        if dma_ok {
            let nsect = remaining.min(DMA_MAX_SECTORS);

            let mut last_err = DiskError::Io;
            let mut ok = false;
            for _attempt in 0..MAX_RETRIES {
                match dma_transfer(ch_idx, slave, info.lba48, chunk_lba, nsect, chunk_ptr, is_write)
                {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(e) => last_err = e,
                }
            }
            if !ok {
                return Err(last_err);
            }
            done += nsect;
        } else {
            let mut last_err = DiskError::Io;
            let mut ok = false;
            for _attempt in 0..MAX_RETRIES {
                match pio_sector(ch_idx, slave, info.lba48, chunk_lba, chunk_ptr, is_write) {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(e) => last_err = e,
                }
            }
            if !ok {
                return Err(last_err);
            }
            done += 1;
        }
    }

    Ok(())
}

/// Read `count` sectors starting at `lba` into `buf`
pub fn read(drive: usize, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), DiskError> {
    transfer(drive, lba, count, buf.as_mut_ptr(), buf.len(), false)
}

/// Write `count` sectors starting at `lba` from `buf`
pub fn write(drive: usize, lba: u64, count: usize, buf: &[u8]) -> Result<(), DiskError> {
    // The pointer is never written through on the write path.
    transfer(drive, lba, count, buf.as_ptr() as *mut u8, buf.len(), true)
}
