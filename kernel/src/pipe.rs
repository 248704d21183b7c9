//! Pipes
//!
//! Unidirectional in-kernel ring buffers. Pipe descriptors live in their
//! own numeric range above the VFS fd table, so read/write/close probe the
//! pipe pool before touching the VFS.

use alloc::collections::BTreeMap;
use spin::Mutex;

/// Ring capacity per pipe
const PIPE_BUF_SIZE: usize = 4096;

/// Pipe fds start here; the VFS table ends at VFS_MAX_FD
const PIPE_FD_BASE: i32 = crate::vfs::VFS_MAX_FD as i32;

/// Circular byte buffer
struct Ring {
    buf: [u8; PIPE_BUF_SIZE],
    head: usize,
    tail: usize,
    len: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            buf: [0; PIPE_BUF_SIZE],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(PIPE_BUF_SIZE - self.len);
        for &b in &data[..n] {
            self.buf[self.tail] = b;
            self.tail = (self.tail + 1) % PIPE_BUF_SIZE;
        }
        self.len += n;
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for slot in out[..n].iter_mut() {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % PIPE_BUF_SIZE;
        }
        self.len -= n;
        n
    }
}

struct Pipe {
    ring: Ring,
    read_open: bool,
    write_open: bool,
}

struct PipePool {
    pipes: BTreeMap<usize, Pipe>,
    /// fd -> (pipe id, is write end, owner pid)
    fd_map: BTreeMap<i32, (usize, bool, u32)>,
    next_id: usize,
    next_fd: i32,
}

impl PipePool {
    const fn new() -> Self {
        Self {
            pipes: BTreeMap::new(),
            fd_map: BTreeMap::new(),
            next_id: 1,
            next_fd: PIPE_FD_BASE,
        }
    }
}

static POOL: Mutex<PipePool> = Mutex::new(PipePool::new());

/// Create a pipe owned by `pid`. Returns (read_fd, write_fd).
pub fn create(pid: u32) -> (i32, i32) {
    let mut pool = POOL.lock();
    let id = pool.next_id;
    pool.next_id += 1;

    let read_fd = pool.next_fd;
    let write_fd = pool.next_fd + 1;
    pool.next_fd += 2;

    pool.pipes.insert(
        id,
        Pipe {
            ring: Ring::new(),
            read_open: true,
            write_open: true,
        },
    );
    pool.fd_map.insert(read_fd, (id, false, pid));
    pool.fd_map.insert(write_fd, (id, true, pid));

    crate::log_debug!("[PIPE] pid {} created pipe {} (fds {}/{})", pid, id, read_fd, write_fd);
    (read_fd, write_fd)
}

/// Does this fd belong to the pipe pool?
pub fn is_pipe_fd(fd: i32) -> bool {
    fd >= PIPE_FD_BASE && POOL.lock().fd_map.contains_key(&fd)
}

/// Write to a pipe's write end. Blocks (yielding) while the ring is full
/// and a reader still exists.
pub fn write(fd: i32, data: &[u8]) -> i64 {
    if data.is_empty() {
        return 0;
    }

    loop {
        {
            let mut pool = POOL.lock();
            let &(id, is_write, _) = match pool.fd_map.get(&fd) {
                Some(entry) => entry,
                None => return crate::syscall::errno::EBADF,
            };
            if !is_write {
                return crate::syscall::errno::EBADF;
            }
            let pipe = match pool.pipes.get_mut(&id) {
                Some(p) => p,
                None => return crate::syscall::errno::EBADF,
            };
            if !pipe.read_open {
                return crate::syscall::errno::EPIPE;
            }

            let n = pipe.ring.push(data);
            if n > 0 {
                return n as i64;
            }
            // Ring full: drop the lock and let the reader run
        }

        crate::scheduler::yield_now();
    }
}

/// Read from a pipe's read end. Blocks (yielding) while the ring is empty
/// and the write end is still open; EOF (0) once it closes.
pub fn read(fd: i32, buf: &mut [u8]) -> i64 {
    if buf.is_empty() {
        return 0;
    }

    loop {
        {
            let mut pool = POOL.lock();
            let &(id, is_write, _) = match pool.fd_map.get(&fd) {
                Some(entry) => entry,
                None => return crate::syscall::errno::EBADF,
            };
            if is_write {
                return crate::syscall::errno::EBADF;
            }
            let pipe = match pool.pipes.get_mut(&id) {
                Some(p) => p,
                None => return crate::syscall::errno::EBADF,
            };

            let n = pipe.ring.pop(buf);
            if n > 0 {
                return n as i64;
            }
            if !pipe.write_open {
                return 0; // EOF
            }
            // Empty but a writer remains: wait our turn
        }

        crate::scheduler::yield_now();
    }
}

/// Close one pipe end; the pipe is destroyed when both ends are closed
pub fn close(fd: i32) -> i64 {
    let mut pool = POOL.lock();
    let (id, is_write, _) = match pool.fd_map.remove(&fd) {
        Some(entry) => entry,
        None => return crate::syscall::errno::EBADF,
    };

    if let Some(pipe) = pool.pipes.get_mut(&id) {
        if is_write {
            pipe.write_open = false;
        } else {
            pipe.read_open = false;
        }
        if !pipe.read_open && !pipe.write_open {
            pool.pipes.remove(&id);
            crate::log_debug!("[PIPE] Destroyed pipe {}", id);
        }
    }
    0
}

/// Close every pipe end owned by `pid`; called on process exit
pub fn close_all_for_pid(pid: u32) {
    let fds: alloc::vec::Vec<i32> = {
        let pool = POOL.lock();
        pool.fd_map
            .iter()
            .filter(|(_, &(_, _, owner))| owner == pid)
            .map(|(&fd, _)| fd)
            .collect()
    };
    for fd in fds {
        close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_push_pop() {
        let mut r = Ring::new();
        assert_eq!(r.push(b"hello\n"), 6);
        let mut out = [0u8; 16];
        assert_eq!(r.pop(&mut out), 6);
        assert_eq!(&out[..6], b"hello\n");
        assert_eq!(r.pop(&mut out), 0);
    }

    #[test]
    fn ring_wraps_around() {
        let mut r = Ring::new();
        let chunk = [7u8; PIPE_BUF_SIZE - 10];
        assert_eq!(r.push(&chunk), chunk.len());
        let mut out = alloc::vec![0u8; chunk.len()];
        assert_eq!(r.pop(&mut out), chunk.len());

        // head/tail now sit near the end; the next push must wrap
        assert_eq!(r.push(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12][..]), 12);
        let mut out2 = [0u8; 12];
        assert_eq!(r.pop(&mut out2), 12);
        assert_eq!(out2[0], 1);
        assert_eq!(out2[11], 12);
    }

    #[test]
    fn ring_respects_capacity() {
        let mut r = Ring::new();
        let big = alloc::vec![0xAAu8; PIPE_BUF_SIZE + 100];
        assert_eq!(r.push(&big), PIPE_BUF_SIZE);
        assert_eq!(r.push(b"x"), 0);
    }
}
