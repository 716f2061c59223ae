//! Low-level Linux syscall wrappers for the omegabox sandbox.
//!
//! This crate provides thin wrappers around Linux-specific syscalls that are
//! not available (or not usable in a fork-without-exec context) through
//! rustix or libc. For standard syscalls, use rustix or nix.
//!
//! ## Modules
//!
//! - **pidfd** - Stable process handles (`pidfd_open`, `pidfd_send_signal`)
//! - **scm_rights** - File-descriptor passing over `AF_UNIX` sockets
//! - **seccomp** - Pre-compiled BPF program loading and user notification
//! - **siginfo** - `SIGSYS` siginfo decoding
//! - **signals** / **syscalls** - Number-to-name tables for verdict reporting
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod pidfd;
pub mod scm_rights;
pub mod seccomp;
pub mod siginfo;
pub mod signals;
pub mod syscalls;

use rustix::io::Errno;

#[inline]
pub fn last_errno() -> Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}

/// Scope guard that snapshots `errno` at construction and restores it on drop.
///
/// Syscall failure paths must report the *originating* errno even after
/// intermediate logging calls, which are free to clobber it. Wrap only the
/// logging in one of these:
///
/// ```ignore
/// if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
///     {
///         let _errno = ErrnoSaver::new();
///         tracing::error!("failed to chdir");
///     }
///     return Err(last_errno());
/// }
/// ```
pub struct ErrnoSaver {
    saved: libc::c_int,
}

impl ErrnoSaver {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        // SAFETY: __errno_location always returns a valid thread-local pointer.
        Self {
            saved: unsafe { *libc::__errno_location() },
        }
    }
}

impl Drop for ErrnoSaver {
    fn drop(&mut self) {
        // SAFETY: as above.
        unsafe { *libc::__errno_location() = self.saved };
    }
}

/// Retry an `-1`/`errno` syscall expression while it fails with `EINTR`.
#[macro_export]
macro_rules! retry_eintr {
    ($e:expr) => {{
        loop {
            let ret = $e;
            if ret != -1 || $crate::last_errno() != rustix::io::Errno::INTR {
                break ret;
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_errno(value: libc::c_int) {
        unsafe { *libc::__errno_location() = value };
    }

    #[test]
    fn errno_saver_restores() {
        set_errno(libc::ENXIO);
        {
            let _saved = ErrnoSaver::new();
            set_errno(libc::EBADF);
        }
        assert_eq!(last_errno(), Errno::NXIO);
    }

    #[test]
    fn retry_eintr_passes_through_success() {
        let ret = retry_eintr!(unsafe { libc::getpid() } as i64);
        assert!(ret > 0);
    }
}
