//! Virtual File System
//!
//! Mount table with longest-prefix routing, textual path normalization,
//! the global fd table (entries tagged with their owner process) and the
//! per-filesystem operation trait that ramfs and ext2 implement.

pub mod block_cache;
pub mod ext2;
pub mod ramfs;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

/// File descriptor type
pub type Fd = i32;

/// Backend-opaque file handle (ramfs node index, ext2 inode number)
pub type Handle = u64;

/// Maximum simultaneously open VFS descriptors. Fds 0-2 never land here,
/// and pipe descriptors live above this range.
pub const VFS_MAX_FD: usize = 64;

/// Maximum number of mounts
pub const MAX_MOUNTS: usize = 8;

/// File open flags (Linux numbering)
#[derive(Clone, Copy, Debug)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 1;
    pub const O_RDWR: u32 = 2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_DIRECTORY: u32 = 0o200000;

    pub fn readable(&self) -> bool {
        (self.0 & 3) != Self::O_WRONLY
    }

    pub fn writable(&self) -> bool {
        (self.0 & 3) != Self::O_RDONLY
    }

    pub fn create(&self) -> bool {
        (self.0 & Self::O_CREAT) != 0
    }

    pub fn truncate(&self) -> bool {
        (self.0 & Self::O_TRUNC) != 0
    }

    pub fn append(&self) -> bool {
        (self.0 & Self::O_APPEND) != 0
    }

    pub fn directory(&self) -> bool {
        (self.0 & Self::O_DIRECTORY) != 0
    }
}

/// File kind as the VFS sees it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Metadata returned by `stat`
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub ino: u64,
    pub kind: FileKind,
    pub size: u64,
}

/// One directory entry from `readdir`
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
}

/// VFS error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfsError {
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    InvalidPath,
    NoSpace,
    IoError,
    NotSupported,
    BadFd,
    TooManyOpenFiles,
    Busy,
}

impl VfsError {
    pub fn to_errno(self) -> i64 {
        use crate::syscall::errno::*;
        match self {
            VfsError::NotFound => ENOENT,
            VfsError::AlreadyExists => EEXIST,
            VfsError::NotDirectory => ENOTDIR,
            VfsError::IsDirectory => EISDIR,
            VfsError::NotEmpty => ENOTEMPTY,
            VfsError::InvalidPath => EINVAL,
            VfsError::NoSpace => ENOSPC,
            VfsError::IoError => EIO,
            VfsError::NotSupported => ENOSYS,
            VfsError::BadFd => EBADF,
            VfsError::TooManyOpenFiles => EMFILE,
            VfsError::Busy => EBUSY,
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

/// Per-filesystem operations. One implementation per backend; the mount
/// entry pairs it with the mount path.
pub trait FileSystem: Send + Sync {
    fn fs_name(&self) -> &'static str;

    /// Open an existing file or directory; returns (handle, is_dir)
    fn open(&self, path: &str) -> VfsResult<(Handle, bool)>;

    /// Create a regular file (parent must exist)
    fn create(&self, path: &str) -> VfsResult<Handle>;

    fn close(&self, handle: Handle) -> VfsResult<()>;

    fn read(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> VfsResult<usize>;

    fn write(&self, handle: Handle, offset: u64, buf: &[u8]) -> VfsResult<usize>;

    /// Truncate to zero length
    fn truncate(&self, handle: Handle) -> VfsResult<()>;

    /// Current size of an open file
    fn size(&self, handle: Handle) -> VfsResult<u64>;

    fn mkdir(&self, path: &str) -> VfsResult<()>;

    fn unlink(&self, path: &str) -> VfsResult<()>;

    fn rmdir(&self, path: &str) -> VfsResult<()>;

    fn stat(&self, path: &str) -> VfsResult<Stat>;

    /// The `index`-th live entry of an open directory, or None past the end
    fn readdir(&self, handle: Handle, index: usize) -> VfsResult<Option<DirEntry>>;

    /// Push dirty state to the backing store
    fn flush(&self, handle: Handle) -> VfsResult<()> {
        let _ = handle;
        Ok(())
    }
}

/// A filesystem type that can be mounted from a block device
pub trait FsDriver: Send + Sync {
    fn driver_name(&self) -> &'static str;

    /// Mount from a drive + partition start sector
    fn mount(&self, drive: usize, part_lba: u64) -> VfsResult<Arc<dyn FileSystem>>;

    /// Release a mounted instance; metadata is already on disk because
    /// mutations flush eagerly, so dropping the instance suffices.
    fn unmount(&self, fs: Arc<dyn FileSystem>) -> VfsResult<()> {
        drop(fs);
        Ok(())
    }
}

/// Mount entry
struct Mount {
    path: String,
    fs: Arc<dyn FileSystem>,
}

static MOUNTS: RwLock<Vec<Mount>> = RwLock::new(Vec::new());

/// Registered filesystem drivers (for `mount` by type name)
static FS_DRIVERS: Mutex<Vec<&'static dyn FsDriver>> = Mutex::new(Vec::new());

/// An open file in the global fd table
struct OpenFile {
    owner: u32,
    fs: Arc<dyn FileSystem>,
    handle: Handle,
    offset: u64,
    flags: OpenFlags,
    is_dir: bool,
}

/// Global fd table. Slot index == fd; slots 0-2 stay empty because the
/// standard descriptors bypass the VFS.
static FD_TABLE: Mutex<Vec<Option<OpenFile>>> = Mutex::new(Vec::new());

/// Initialize the VFS: fd table, ramfs at /dev with device placeholders
pub fn init() {
    {
        let mut table = FD_TABLE.lock();
        table.clear();
        for _ in 0..VFS_MAX_FD {
            table.push(None);
        }
    }

    // /dev lives in ramfs: zero-byte placeholders so `mount` can resolve
    // a source string like /dev/hda to a drive index.
    let dev = Arc::new(ramfs::RamFs::new());
    for node in ["hda", "hdb", "hdc", "hdd", "console", "fb0"] {
        dev.create(&alloc::format!("/{}", node)).ok();
    }
    mount_at("/dev", dev).ok();

    crate::log!("[VFS] Initialized, /dev mounted (ramfs)");
}

/// Register a mountable filesystem driver
pub fn register_driver(driver: &'static dyn FsDriver) {
    FS_DRIVERS.lock().push(driver);
    crate::log_debug!("[VFS] Registered filesystem driver: {}", driver.driver_name());
}

/// Attach a filesystem instance at `path`
pub fn mount_at(path: &str, fs: Arc<dyn FileSystem>) -> VfsResult<()> {
    let mut mounts = MOUNTS.write();

    if mounts.len() >= MAX_MOUNTS {
        return Err(VfsError::NoSpace);
    }
    if mounts.iter().any(|m| m.path == path) {
        return Err(VfsError::Busy);
    }

    crate::log!("[VFS] Mounted {} at {}", fs.fs_name(), path);
    mounts.push(Mount {
        path: path.to_string(),
        fs,
    });

    Ok(())
}

/// Mount a registered filesystem type from a device path
/// (`/dev/hda`..`/dev/hdd` select drives 0..3).
pub fn mount_device(fs_type: &str, source: &str, target: &str) -> VfsResult<()> {
    let drive = drive_from_source(source).ok_or(VfsError::NotFound)?;

    let driver = {
        let drivers = FS_DRIVERS.lock();
        drivers
            .iter()
            .copied()
            .find(|d| d.driver_name() == fs_type)
            .ok_or(VfsError::NotSupported)?
    };

    let fs = driver.mount(drive, 0)?;
    mount_at(target, fs)
}

/// Detach the filesystem mounted at `target`. Fails while any fd still
/// references it.
pub fn unmount(target: &str) -> VfsResult<()> {
    let mut mounts = MOUNTS.write();
    let idx = mounts
        .iter()
        .position(|m| m.path == target)
        .ok_or(VfsError::NotFound)?;

    {
        let table = FD_TABLE.lock();
        let fs = &mounts[idx].fs;
        for slot in table.iter().flatten() {
            if Arc::ptr_eq(&slot.fs, fs) {
                return Err(VfsError::Busy);
            }
        }
    }

    let m = mounts.remove(idx);
    crate::log!("[VFS] Unmounted {} from {}", m.fs.fs_name(), m.path);
    Ok(())
}

/// Resolve /dev/hdX to a drive index
fn drive_from_source(source: &str) -> Option<usize> {
    let name = source.strip_prefix("/dev/hd")?;
    let letter = name.bytes().next()?;
    if (b'a'..=b'd').contains(&letter) {
        Some((letter - b'a') as usize)
    } else {
        None
    }
}

/// Longest-prefix mount lookup. Returns the filesystem and the path
/// relative to the mount point (always absolute within that fs).
fn find_mount(path: &str) -> VfsResult<(Arc<dyn FileSystem>, String)> {
    let mounts = MOUNTS.read();

    let mut best: Option<(&Mount, usize)> = None;
    for m in mounts.iter() {
        let matches = if m.path == "/" {
            true
        } else {
            path == m.path || path.starts_with(&alloc::format!("{}/", m.path))
        };
        if matches {
            let len = m.path.len();
            if best.map_or(true, |(_, l)| len > l) {
                best = Some((m, len));
            }
        }
    }

    let (m, _) = best.ok_or(VfsError::NotFound)?;
    let rel = if m.path == "/" {
        path.to_string()
    } else {
        let stripped = &path[m.path.len()..];
        if stripped.is_empty() {
            "/".to_string()
        } else {
            stripped.to_string()
        }
    };

    Ok((m.fs.clone(), rel))
}

/// Collapse a path to absolute canonical form: resolve against `cwd` when
/// relative, squeeze `//`, drop `.`, and apply `..` textually.
pub fn normalize(path: &str, cwd: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else if cwd == "/" || cwd.is_empty() {
        alloc::format!("/{}", path)
    } else {
        alloc::format!("{}/{}", cwd, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    if parts.is_empty() {
        "/".to_string()
    } else {
        alloc::format!("/{}", parts.join("/"))
    }
}

/// Parent directory of an absolute path
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

/// Final component of a path
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

fn alloc_fd(table: &mut Vec<Option<OpenFile>>) -> VfsResult<Fd> {
    for fd in 3..VFS_MAX_FD {
        if table[fd].is_none() {
            return Ok(fd as Fd);
        }
    }
    Err(VfsError::TooManyOpenFiles)
}

fn check_fd(fd: Fd, pid: u32, table: &Vec<Option<OpenFile>>) -> VfsResult<()> {
    let idx = fd as usize;
    if fd < 3 || idx >= VFS_MAX_FD {
        return Err(VfsError::BadFd);
    }
    match &table[idx] {
        Some(f) if f.owner == pid => Ok(()),
        _ => Err(VfsError::BadFd),
    }
}

/// Open (or create) `path` for process `pid`. The path must already be
/// normalized to absolute form.
pub fn open(path: &str, flags: OpenFlags, pid: u32) -> VfsResult<Fd> {
    let (fs, rel) = find_mount(path)?;

    let (handle, is_dir) = match fs.open(&rel) {
        Ok(pair) => pair,
        Err(VfsError::NotFound) if flags.create() => (fs.create(&rel)?, false),
        Err(e) => return Err(e),
    };

    if is_dir && !flags.directory() {
        fs.close(handle).ok();
        return Err(VfsError::IsDirectory);
    }
    if !is_dir && flags.directory() {
        fs.close(handle).ok();
        return Err(VfsError::NotDirectory);
    }

    if !is_dir && flags.truncate() && flags.writable() {
        fs.truncate(handle)?;
    }

    let offset = if !is_dir && flags.append() {
        fs.size(handle)?
    } else {
        0
    };

    let mut table = FD_TABLE.lock();
    let fd = match alloc_fd(&mut table) {
        Ok(fd) => fd,
        Err(e) => {
            fs.close(handle).ok();
            return Err(e);
        }
    };

    table[fd as usize] = Some(OpenFile {
        owner: pid,
        fs,
        handle,
        offset,
        flags,
        is_dir,
    });

    Ok(fd)
}

/// Read from an open fd at its current offset
pub fn read(fd: Fd, buf: &mut [u8], pid: u32) -> VfsResult<usize> {
    let (fs, handle, offset) = {
        let table = FD_TABLE.lock();
        check_fd(fd, pid, &table)?;
        let f = table[fd as usize].as_ref().unwrap();
        if f.is_dir {
            return Err(VfsError::IsDirectory);
        }
        if !f.flags.readable() {
            return Err(VfsError::BadFd);
        }
        (f.fs.clone(), f.handle, f.offset)
    };

    let n = fs.read(handle, offset, buf)?;

    let mut table = FD_TABLE.lock();
    if let Some(f) = table[fd as usize].as_mut() {
        f.offset = offset + n as u64;
    }

    Ok(n)
}

/// Write to an open fd at its current offset (end of file with O_APPEND)
pub fn write(fd: Fd, buf: &[u8], pid: u32) -> VfsResult<usize> {
    let (fs, handle, offset, append) = {
        let table = FD_TABLE.lock();
        check_fd(fd, pid, &table)?;
        let f = table[fd as usize].as_ref().unwrap();
        if f.is_dir {
            return Err(VfsError::IsDirectory);
        }
        if !f.flags.writable() {
            return Err(VfsError::BadFd);
        }
        (f.fs.clone(), f.handle, f.offset, f.flags.append())
    };

    let write_offset = if append { fs.size(handle)? } else { offset };
    let n = fs.write(handle, write_offset, buf)?;

    let mut table = FD_TABLE.lock();
    if let Some(f) = table[fd as usize].as_mut() {
        f.offset = write_offset + n as u64;
    }

    Ok(n)
}

/// Close an fd
pub fn close(fd: Fd, pid: u32) -> VfsResult<()> {
    let entry = {
        let mut table = FD_TABLE.lock();
        check_fd(fd, pid, &table)?;
        table[fd as usize].take()
    };

    if let Some(f) = entry {
        f.fs.flush(f.handle).ok();
        f.fs.close(f.handle)?;
    }
    Ok(())
}

/// Duplicate an fd into the lowest free slot
pub fn dup(fd: Fd, pid: u32) -> VfsResult<Fd> {
    let mut table = FD_TABLE.lock();
    check_fd(fd, pid, &table)?;
    let new_fd = alloc_fd(&mut table)?;

    let src = table[fd as usize].as_ref().unwrap();
    let copy = OpenFile {
        owner: src.owner,
        fs: src.fs.clone(),
        handle: src.handle,
        offset: src.offset,
        flags: src.flags,
        is_dir: src.is_dir,
    };
    table[new_fd as usize] = Some(copy);
    Ok(new_fd)
}

/// Duplicate an fd onto a specific number, closing the target if open
pub fn dup2(old_fd: Fd, new_fd: Fd, pid: u32) -> VfsResult<Fd> {
    if old_fd == new_fd {
        let table = FD_TABLE.lock();
        check_fd(old_fd, pid, &table)?;
        return Ok(new_fd);
    }
    let idx = new_fd as usize;
    if new_fd < 3 || idx >= VFS_MAX_FD {
        return Err(VfsError::BadFd);
    }

    let mut table = FD_TABLE.lock();
    check_fd(old_fd, pid, &table)?;

    let closed = table[idx].take();
    drop(table);
    if let Some(f) = closed {
        f.fs.flush(f.handle).ok();
        f.fs.close(f.handle).ok();
    }

    let mut table = FD_TABLE.lock();
    let src = table[old_fd as usize].as_ref().ok_or(VfsError::BadFd)?;
    let copy = OpenFile {
        owner: src.owner,
        fs: src.fs.clone(),
        handle: src.handle,
        offset: src.offset,
        flags: src.flags,
        is_dir: src.is_dir,
    };
    table[idx] = Some(copy);
    Ok(new_fd)
}

/// Close every fd owned by `pid`; called on process exit
pub fn close_all_for_pid(pid: u32) {
    let mut owned = Vec::new();
    {
        let mut table = FD_TABLE.lock();
        for slot in table.iter_mut() {
            if slot.as_ref().map_or(false, |f| f.owner == pid) {
                owned.push(slot.take().unwrap());
            }
        }
    }
    for f in owned {
        f.fs.flush(f.handle).ok();
        f.fs.close(f.handle).ok();
    }
}

/// lseek
pub fn lseek(fd: Fd, offset: i64, whence: u32, pid: u32) -> VfsResult<u64> {
    const SEEK_SET: u32 = 0;
    const SEEK_CUR: u32 = 1;
    const SEEK_END: u32 = 2;

    let (fs, handle, cur) = {
        let table = FD_TABLE.lock();
        check_fd(fd, pid, &table)?;
        let f = table[fd as usize].as_ref().unwrap();
        (f.fs.clone(), f.handle, f.offset)
    };

    let base = match whence {
        SEEK_SET => 0i64,
        SEEK_CUR => cur as i64,
        SEEK_END => fs.size(handle)? as i64,
        _ => return Err(VfsError::InvalidPath),
    };

    let new_offset = base.checked_add(offset).ok_or(VfsError::InvalidPath)?;
    if new_offset < 0 {
        return Err(VfsError::InvalidPath);
    }

    let mut table = FD_TABLE.lock();
    check_fd(fd, pid, &table)?;
    let f = table[fd as usize].as_mut().unwrap();
    f.offset = new_offset as u64;
    Ok(f.offset)
}

/// stat by path (must be normalized)
pub fn stat(path: &str) -> VfsResult<Stat> {
    let (fs, rel) = find_mount(path)?;
    fs.stat(&rel)
}

/// fstat on an open descriptor
pub fn fstat(fd: Fd, pid: u32) -> VfsResult<Stat> {
    let table = FD_TABLE.lock();
    check_fd(fd, pid, &table)?;
    let f = table[fd as usize].as_ref().unwrap();
    let size = if f.is_dir { 0 } else { f.fs.size(f.handle)? };
    Ok(Stat {
        ino: f.handle,
        kind: if f.is_dir {
            FileKind::Directory
        } else {
            FileKind::File
        },
        size,
    })
}

/// mkdir
pub fn mkdir(path: &str) -> VfsResult<()> {
    let (fs, rel) = find_mount(path)?;
    fs.mkdir(&rel)
}

/// unlink a file
pub fn unlink(path: &str) -> VfsResult<()> {
    let (fs, rel) = find_mount(path)?;
    fs.unlink(&rel)
}

/// rmdir an empty directory
pub fn rmdir(path: &str) -> VfsResult<()> {
    let (fs, rel) = find_mount(path)?;
    fs.rmdir(&rel)
}

/// Next directory entry of an open directory fd, advancing its cursor.
/// The fd's offset is the index of the next entry to emit.
pub fn next_dirent(fd: Fd, pid: u32) -> VfsResult<Option<DirEntry>> {
    let (fs, handle, index) = {
        let table = FD_TABLE.lock();
        check_fd(fd, pid, &table)?;
        let f = table[fd as usize].as_ref().unwrap();
        if !f.is_dir {
            return Err(VfsError::NotDirectory);
        }
        (f.fs.clone(), f.handle, f.offset as usize)
    };

    let entry = fs.readdir(handle, index)?;

    if entry.is_some() {
        let mut table = FD_TABLE.lock();
        if let Some(f) = table[fd as usize].as_mut() {
            f.offset += 1;
        }
    }

    Ok(entry)
}

/// Step the directory cursor back one entry (a record that did not fit)
pub fn unwind_dirent(fd: Fd, pid: u32) {
    let mut table = FD_TABLE.lock();
    if check_fd(fd, pid, &table).is_ok() {
        if let Some(f) = table[fd as usize].as_mut() {
            f.offset = f.offset.saturating_sub(1);
        }
    }
}

/// Read a whole file into a buffer (kernel-internal convenience)
pub fn read_file(path: &str, pid: u32) -> VfsResult<Vec<u8>> {
    let fd = open(path, OpenFlags(OpenFlags::O_RDONLY), pid)?;
    let size = {
        let table = FD_TABLE.lock();
        let f = table[fd as usize].as_ref().ok_or(VfsError::BadFd)?;
        f.fs.size(f.handle)?
    };

    let mut buf = alloc::vec![0u8; size as usize];
    let mut done = 0usize;
    while done < buf.len() {
        let n = read(fd, &mut buf[done..], pid)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    buf.truncate(done);

    close(fd, pid)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_absolute() {
        assert_eq!(normalize("/a/b/c", "/"), "/a/b/c");
        assert_eq!(normalize("/a//b///c", "/"), "/a/b/c");
        assert_eq!(normalize("/a/./b/.", "/"), "/a/b");
        assert_eq!(normalize("/a/b/..", "/"), "/a");
        assert_eq!(normalize("/../..", "/"), "/");
        assert_eq!(normalize("/", "/"), "/");
    }

    #[test]
    fn normalize_relative() {
        assert_eq!(normalize("b", "/a"), "/a/b");
        assert_eq!(normalize("../c", "/a/b"), "/a/c");
        assert_eq!(normalize(".", "/a/b"), "/a/b");
        assert_eq!(normalize("x/y", "/"), "/x/y");
    }

    #[test]
    fn parents_and_basenames() {
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/a"), "a");
    }
}
