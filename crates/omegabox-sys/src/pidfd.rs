//! Stable process handles via `pidfd`.
//!
//! A pidfd is a file descriptor referring to a process, immune to pid reuse.
//! It becomes readable when the process exits, which makes it pollable next
//! to ordinary fds. The supervisor hands one to the out-of-container
//! observer so the observer can outlive pid-namespace translation.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;

/// Open a pidfd for `pid` in the caller's pid namespace.
pub fn pidfd_open(pid: libc::pid_t) -> Result<OwnedFd, Errno> {
    // SAFETY: plain syscall; the kernel validates the arguments.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) };
    if ret < 0 {
        Err(last_errno())
    } else {
        // SAFETY: on success the return value is a fresh file descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
    }
}

/// Send `sig` to the process referred to by `pidfd`.
pub fn pidfd_send_signal(pidfd: BorrowedFd<'_>, sig: libc::c_int) -> Result<(), Errno> {
    // SAFETY: plain syscall; a null siginfo means "as if from kill(2)".
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            sig,
            std::ptr::null::<libc::siginfo_t>(),
            0u32,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn open_self() {
        let pid = unsafe { libc::getpid() };
        let fd = pidfd_open(pid).unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn signal_zero_probes_liveness() {
        let pid = unsafe { libc::getpid() };
        let fd = pidfd_open(pid).unwrap();
        pidfd_send_signal(fd.as_fd(), 0).unwrap();
    }
}
