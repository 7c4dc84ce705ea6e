//! Low-level address-space mapping.
//!
//! Four operations form the OS boundary: reserve a range with no access
//! rights, commit a reserved range to read-write memory (anonymously or from
//! a file descriptor), and release a range. Reservation and commit are
//! separate steps so that chunks can claim gigabytes of address space while
//! only the metadata page and carved spans are ever backed by memory.
//!
//! Everything here is POSIX (`PROT_NONE` reservations, `MAP_FIXED` commits,
//! `MAP_SHARED` fd commits); there is no Windows port.

use core::ffi::c_void;
use core::ptr::NonNull;
use std::os::fd::RawFd;

use thiserror::Error;

/// A failed mapping call, with the `errno` it produced.
#[derive(Debug, Clone, Copy, Error)]
#[error("{op} failed (errno {errno})")]
pub struct MapError {
    op: &'static str,
    errno: i32,
}

impl MapError {
    fn last(op: &'static str) -> Self {
        Self {
            op,
            errno: errno::errno().0,
        }
    }

    /// The `errno` reported by the OS.
    pub fn errno(&self) -> i32 {
        self.errno
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        // Implemented below.
    } else {
        compile_error!("magalloc only supports unix targets");
    }
}

/// Returns the system page size.
pub fn page_size() -> Result<usize, MapError> {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret < 0 {
        return Err(MapError::last("sysconf(_SC_PAGESIZE)"));
    }

    Ok(ret as usize)
}

/// Reserves `size` bytes of address space with no access rights.
///
/// The reservation carries no memory; it only claims the range. Callers
/// commit sub-ranges with [`allocate_region`] / [`allocate_fd_region`] and
/// may release unused slack with [`release_region`]. The returned base is
/// never null.
pub fn reserve_region(size: usize) -> Result<NonNull<u8>, MapError> {
    let ret = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(MapError::last("mmap(PROT_NONE)"));
    }

    // mmap never returns the zero page for a NULL hint.
    NonNull::new(ret as *mut u8).ok_or(MapError {
        op: "mmap(PROT_NONE)",
        errno: 0,
    })
}

/// Commits a previously reserved range to zero-filled read-write memory.
///
/// Pages may be demand-faulted on first touch. Committing is idempotent per
/// page: re-mapping an already committed page discards its contents.
///
/// # Safety
///
/// `[base, base + size)` must lie within a range obtained from
/// [`reserve_region`] and still owned by the caller.
pub unsafe fn allocate_region(base: *mut u8, size: usize) -> Result<(), MapError> {
    let ret = unsafe {
        libc::mmap(
            base as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(MapError::last("mmap(MAP_FIXED)"));
    }

    Ok(())
}

/// Commits a previously reserved range with shared memory from `fd` at
/// `offset`. Writes through the mapping reach the file.
///
/// # Safety
///
/// Same ownership requirement as [`allocate_region`]; additionally the file
/// must be at least `offset + size` bytes long, or first touch raises
/// `SIGBUS`.
pub unsafe fn allocate_fd_region(
    fd: RawFd,
    offset: u64,
    base: *mut u8,
    size: usize,
) -> Result<(), MapError> {
    let ret = unsafe {
        libc::mmap(
            base as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(MapError::last("mmap(MAP_FIXED|MAP_SHARED)"));
    }

    Ok(())
}

/// Returns `[base, base + size)` to the OS. `size == 0` is a no-op success.
///
/// # Safety
///
/// The range must have been obtained from [`reserve_region`] and must not be
/// accessed again.
pub unsafe fn release_region(base: *mut u8, size: usize) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }

    let ret = unsafe { libc::munmap(base as *mut c_void, size) };
    if ret != 0 {
        return Err(MapError::last("munmap"));
    }

    Ok(())
}
