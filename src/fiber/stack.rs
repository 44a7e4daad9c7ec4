//! Stack allocation for fibers.
//!
//! Stacks are anonymous `mmap` regions (via `libc`, the same FFI crate the
//! rest of this module tree leans on) rather than `Vec<u8>`, so that a guard
//! page can be carved out at the low address on platforms that support it:
//! a stack overflow faults instead of silently corrupting an adjacent
//! allocation.

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Default stack size for a spawned fiber, chosen to comfortably host a few
/// dozen stack frames of ordinary Rust code plus one guard page.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Minimum stack size accepted by [`Stack::new`]. Below this there isn't
/// enough room for [`super::context::Context`] to even perform its first
/// switch.
pub const MIN_STACK_SIZE: usize = 4096;

pub struct Stack {
    ptr: NonNull<u8>,
    len: usize,
    mapped_len: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocates a new stack of (at least) `size` bytes with a guard page.
    pub fn new(size: usize) -> Result<Self> {
        let page = page_size();
        let size = size.max(MIN_STACK_SIZE);
        let usable = round_up(size, page);
        let mapped_len = usable + page;

        // Safety: `mmap` with MAP_ANONYMOUS never reads `addr`'s contents;
        // we only inspect the returned pointer below.
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(Error::from(std::io::Error::last_os_error()));
        }

        // Safety: `map` was just validated as non-failing and `mapped_len`
        // is exactly the mapping's size.
        unsafe {
            let guard = map as *mut u8;
            if libc::mprotect(guard.cast(), page, libc::PROT_NONE) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(map, mapped_len);
                return Err(Error::from(err));
            }
        }

        let ptr = unsafe { (map as *mut u8).add(page) };
        Ok(Self {
            // Safety: `mmap` never returns null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len: usable,
            mapped_len,
        })
    }

    /// Pointer to the lowest usable (non-guard) byte of the stack.
    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable length of the stack, excluding the guard page.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let page = page_size();
        // Safety: this is the same mapping `new` obtained, the guard page
        // included; nothing else can hold a reference once `Stack` is
        // dropped because a fiber that owns its stack is never live in
        // EXEC past its own destruction (see Fiber::drop).
        unsafe {
            let guard = self.ptr.as_ptr().sub(page);
            libc::munmap(guard.cast(), self.mapped_len);
        }
    }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

fn page_size() -> usize {
    // Safety: trivially safe; sysconf with _SC_PAGESIZE never fails in
    // practice on the platforms this crate targets.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_size() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        assert!(stack.len() >= DEFAULT_STACK_SIZE);
        assert!(!stack.base().is_null());
    }

    #[test]
    fn rounds_up_tiny_sizes() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.len() >= MIN_STACK_SIZE);
    }
}
