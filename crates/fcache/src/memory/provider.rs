//! Memory provider: the abstract interface to the host's virtual memory.
//!
//! Runtime address-space mapping is consumed through this abstraction
//! rather than implemented inline. [`MmapMemoryProvider`] is a real Unix
//! implementation, used by default and by the test harness; any other
//! host could supply its own [`MemoryProvider`].

use crate::error::FcacheError;

/// Page protection requested for a reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Readable and executable, not writable. The steady state for units
    /// that are not currently being mutated (the "X" side of W^X).
    ReadExecute,
    /// Readable, writable, and executable. Held only while the owning
    /// thread is writing fragment headers, free-list links, or shifted
    /// code into the unit (the "W" side of W^X).
    ReadWriteExecute,
}

/// Abstract provider of reserved, committed, and protected virtual memory.
///
/// Reserve a range (optionally committing a prefix), extend the
/// committed prefix, unmap, and change protection. Implementations must
/// return addresses reachable from the
/// translator's code region: for a real DBT runtime this typically means
/// "within a branch-displacement's reach of existing code"; this crate
/// does not itself enforce reachability, leaving that to the provider.
pub trait MemoryProvider: Send + Sync {
    /// Reserves `reserved_size` bytes of address space and commits the
    /// first `initial_commit_size` bytes as RWX.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::OutOfReservation`] if the host cannot
    /// satisfy the reservation.
    fn reserve(
        &self,
        reserved_size: usize,
        initial_commit_size: usize,
    ) -> Result<*mut u8, FcacheError>;

    /// Commits `delta` additional bytes immediately after the current
    /// committed end `end`, without moving `start`.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::OutOfReservation`] if the extension cannot
    /// be satisfied (e.g. it would cross the reservation's end).
    fn extend_commitment(&self, end: *mut u8, delta: usize) -> Result<(), FcacheError>;

    /// Releases `size` bytes starting at `start` back to the host.
    fn unmap(&self, start: *mut u8, size: usize);

    /// Changes the page protection of `[start, start + size)`.
    fn set_protection(&self, start: *mut u8, size: usize, prot: Protection);
}

/// A `MemoryProvider` backed by anonymous `mmap` on Unix hosts.
///
/// Reserves with `PROT_NONE` and upgrades the committed prefix to RWX.
/// `extend_commitment` reprotects the newly committed range; the
/// reservation itself is never moved or shrunk, so `end` never needs to
/// cross `munmap`/re-`mmap`.
#[derive(Debug, Default)]
pub struct MmapMemoryProvider;

impl MmapMemoryProvider {
    /// Creates a new mmap-backed provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl MemoryProvider for MmapMemoryProvider {
    fn reserve(
        &self,
        reserved_size: usize,
        initial_commit_size: usize,
    ) -> Result<*mut u8, FcacheError> {
        // SAFETY: mmap with MAP_ANONYMOUS|MAP_PRIVATE and a null hint never
        // reads or writes caller memory; we only inspect the returned
        // pointer and errno-equivalent sentinel.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FcacheError::OutOfReservation {
                requested: reserved_size,
            });
        }
        if initial_commit_size > 0 {
            // SAFETY: `ptr` was just reserved by the mmap above and covers
            // at least `reserved_size >= initial_commit_size` bytes.
            let rc = unsafe {
                libc::mprotect(
                    ptr,
                    initial_commit_size,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                )
            };
            if rc != 0 {
                // SAFETY: releasing the same range just reserved above.
                unsafe {
                    libc::munmap(ptr, reserved_size);
                }
                return Err(FcacheError::OutOfReservation {
                    requested: reserved_size,
                });
            }
        }
        Ok(ptr.cast::<u8>())
    }

    fn extend_commitment(&self, end: *mut u8, delta: usize) -> Result<(), FcacheError> {
        if delta == 0 {
            return Ok(());
        }
        // SAFETY: caller guarantees `end` is the current committed end of a
        // reservation made by `reserve`, and that `end + delta` does not
        // cross the reservation's end (enforced by `Unit::extend_commit`).
        let rc = unsafe {
            libc::mprotect(
                end.cast::<libc::c_void>(),
                delta,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(FcacheError::OutOfReservation { requested: delta })
        }
    }

    fn unmap(&self, start: *mut u8, size: usize) {
        // SAFETY: caller guarantees `start..start+size` is a range
        // previously returned by `reserve` and not already unmapped.
        unsafe {
            libc::munmap(start.cast::<libc::c_void>(), size);
        }
    }

    fn set_protection(&self, start: *mut u8, size: usize, prot: Protection) {
        let flags = match prot {
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };
        // SAFETY: caller guarantees `start..start+size` is committed
        // memory owned by a live `Unit`.
        unsafe {
            libc::mprotect(start.cast::<libc::c_void>(), size, flags);
        }
    }
}
