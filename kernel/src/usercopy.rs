//! Safe user/kernel memory copy
//!
//! Every pointer a syscall receives goes through here before the kernel
//! dereferences it: page-table presence and the user bit are checked for the
//! whole range, then data moves through an explicit copy. Raw user pointers
//! never escape this module.

use alloc::string::String;
use alloc::vec::Vec;
use core::mem::size_of;

/// Errors from user-memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyError {
    NullPointer,
    NotUserSpace,
    Overflow,
    /// Page not mapped or lacking the required permission
    PageFault,
    InvalidLength,
}

impl UserCopyError {
    /// Convert to a syscall errno
    pub fn to_errno(self) -> i64 {
        match self {
            Self::InvalidLength => crate::syscall::errno::EINVAL,
            _ => crate::syscall::errno::EFAULT,
        }
    }
}

/// A validated user-space memory range
pub struct UserSlice {
    ptr: u64,
    len: usize,
    writable: bool,
}

impl UserSlice {
    /// Validate a read-only user range
    pub fn ro(ptr: u64, len: usize) -> Result<Self, UserCopyError> {
        validate(ptr, len, false)?;
        Ok(Self {
            ptr,
            len,
            writable: false,
        })
    }

    /// Validate a writable user range
    pub fn rw(ptr: u64, len: usize) -> Result<Self, UserCopyError> {
        validate(ptr, len, true)?;
        Ok(Self {
            ptr,
            len,
            writable: true,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the range into a kernel buffer
    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; self.len];
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr as *const u8, buf.as_mut_ptr(), self.len);
        }
        buf
    }

    /// Copy from the range into `buf`, up to min(len, buf.len())
    pub fn read_to(&self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len);
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr as *const u8, buf.as_mut_ptr(), n);
        }
        n
    }

    /// Copy `buf` out to the range, up to min(len, buf.len())
    pub fn write_from(&self, buf: &[u8]) -> Result<usize, UserCopyError> {
        if !self.writable {
            return Err(UserCopyError::PageFault);
        }
        let n = buf.len().min(self.len);
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr as *mut u8, n);
        }
        Ok(n)
    }
}

fn validate(ptr: u64, len: usize, write: bool) -> Result<(), UserCopyError> {
    if ptr == 0 && len == 0 {
        return Ok(());
    }
    if ptr == 0 {
        return Err(UserCopyError::NullPointer);
    }

    let end = ptr.checked_add(len as u64).ok_or(UserCopyError::Overflow)?;

    if !crate::memory::is_user_address(ptr) || !crate::memory::is_user_address(end) {
        return Err(UserCopyError::NotUserSpace);
    }

    if !crate::memory::validate_user_ptr(ptr, len, write) {
        return Err(UserCopyError::PageFault);
    }

    Ok(())
}

/// Copy data from user space into a kernel buffer
pub fn copy_from_user(dst: &mut [u8], src_ptr: u64) -> Result<(), UserCopyError> {
    if dst.is_empty() {
        return Ok(());
    }
    validate(src_ptr, dst.len(), false)?;
    unsafe {
        core::ptr::copy_nonoverlapping(src_ptr as *const u8, dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

/// Copy a kernel buffer out to user space
pub fn copy_to_user(dst_ptr: u64, src: &[u8]) -> Result<(), UserCopyError> {
    if src.is_empty() {
        return Ok(());
    }
    validate(dst_ptr, src.len(), true)?;
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst_ptr as *mut u8, src.len());
    }
    Ok(())
}

/// Read a NUL-terminated string from user space (at most `max_len` bytes)
pub fn copy_string_from_user(ptr: u64, max_len: usize) -> Result<String, UserCopyError> {
    if ptr == 0 {
        return Err(UserCopyError::NullPointer);
    }
    if !crate::memory::is_user_address(ptr) {
        return Err(UserCopyError::NotUserSpace);
    }

    let mut bytes = Vec::new();
    for i in 0..max_len as u64 {
        let addr = ptr.checked_add(i).ok_or(UserCopyError::Overflow)?;
        if !crate::memory::validate_user_ptr(addr, 1, false) {
            return Err(UserCopyError::PageFault);
        }
        let b = unsafe { *(addr as *const u8) };
        if b == 0 {
            break;
        }
        bytes.push(b);
    }

    String::from_utf8(bytes).map_err(|_| UserCopyError::InvalidLength)
}

/// Read a fixed-size `Copy` struct from user space
pub fn read_struct_from_user<T: Copy>(ptr: u64) -> Result<T, UserCopyError> {
    validate(ptr, size_of::<T>(), false)?;
    if ptr == 0 {
        return Err(UserCopyError::NullPointer);
    }
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

/// Write a fixed-size `Copy` struct to user space
pub fn write_struct_to_user<T: Copy>(ptr: u64, value: &T) -> Result<(), UserCopyError> {
    validate(ptr, size_of::<T>(), true)?;
    if ptr == 0 {
        return Err(UserCopyError::NullPointer);
    }
    unsafe {
        core::ptr::write_unaligned(ptr as *mut T, *value);
    }
    Ok(())
}
