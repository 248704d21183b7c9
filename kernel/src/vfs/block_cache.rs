//! Block buffer pool
//!
//! Fixed pool of reusable block-sized scratch buffers for the ext2 backend,
//! so metadata walks don't hammer the heap. This is not a content cache:
//! disk I/O stays synchronous and every buffer is filled by its user, so no
//! coherency question arises.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Number of pooled buffers
const POOL_SIZE: usize = 16;

/// Largest ext2 block size we serve from the pool
pub const MAX_BLOCK_SIZE: usize = 4096;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A scratch buffer borrowed from the pool; returned on drop
pub struct BlockBuf {
    buf: Vec<u8>,
    len: usize,
}

impl BlockBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl core::ops::Deref for BlockBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl core::ops::DerefMut for BlockBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for BlockBuf {
    fn drop(&mut self) {
        let mut pool = POOL.lock();
        if pool.len() < POOL_SIZE {
            pool.push(core::mem::take(&mut self.buf));
        }
    }
}

/// Borrow a zeroed buffer of `len` bytes (len <= MAX_BLOCK_SIZE)
pub fn get(len: usize) -> BlockBuf {
    debug_assert!(len <= MAX_BLOCK_SIZE);

    let buf = {
        let mut pool = POOL.lock();
        pool.pop()
    };

    let mut buf = buf.unwrap_or_else(|| vec![0u8; MAX_BLOCK_SIZE]);
    if buf.len() < MAX_BLOCK_SIZE {
        buf.resize(MAX_BLOCK_SIZE, 0);
    }
    buf[..len].fill(0);

    BlockBuf { buf, len }
}
