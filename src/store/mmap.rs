//! Anonymous memory mappings
//!
//! Every slab is one private anonymous read/write mapping requested
//! directly from the OS and handed back on teardown. Nothing here touches
//! the process heap.

use crate::error::{Error, Result};
use std::io;
use std::ptr::NonNull;
use tracing::warn;

/// Requests a private anonymous read/write mapping of exactly `len` bytes.
/// The returned memory is zero-filled.
pub(crate) fn map_anon(len: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(Error::AllocFailed(io::Error::last_os_error()));
    }

    // SAFETY: mmap returned something other than MAP_FAILED, which is
    // never null for a MAP_ANONYMOUS request.
    Ok(unsafe { NonNull::new_unchecked(addr.cast()) })
}

/// Returns a mapping obtained from [`map_anon`] to the OS.
///
/// # Safety
///
/// `addr` and `len` must describe exactly one live mapping previously
/// returned by [`map_anon`], and no reference into it may outlive this
/// call.
pub(crate) unsafe fn unmap(addr: NonNull<u8>, len: usize) {
    if libc::munmap(addr.as_ptr().cast(), len) != 0 {
        warn!(
            addr = addr.as_ptr() as usize,
            len,
            error = %io::Error::last_os_error(),
            "munmap failed, mapping leaked"
        );
    }
}
