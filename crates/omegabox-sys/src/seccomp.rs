//! Seccomp-BPF program loading and user notification.
//!
//! The sandbox does not compile its own policies; it loads pre-compiled BPF
//! programs (raw `sock_filter` arrays, as emitted by a policy compiler) and
//! installs them in the pre-exec child. When the supervisor wants to learn
//! which syscall a policy killed the target for, the filter is installed
//! with `SECCOMP_FILTER_FLAG_NEW_LISTENER` and the resulting listener fd is
//! handed to an out-of-container observer:
//!
//! 1. Child installs the program with the listener flag, obtaining an fd
//! 2. The fd travels to the supervisor via `SCM_RIGHTS`
//! 3. The observer polls it; a notification parks the offending syscall and
//!    carries its number in `SeccompNotif::data.nr`

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;

use rustix::io::Errno;

use crate::last_errno;

const SECCOMP_SET_MODE_FILTER: u32 = 1;
pub const SECCOMP_FILTER_FLAG_NEW_LISTENER: u32 = 1 << 3;

/// ioctl to receive a notification from the seccomp listener fd.
pub const SECCOMP_IOCTL_NOTIF_RECV: libc::c_ulong = 0xc050_2100;

/// One classic-BPF instruction (mirrors kernel `struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// A BPF program (mirrors kernel `struct sock_fprog`).
#[repr(C)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// Seccomp notification data (mirrors kernel `struct seccomp_data`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// Notification received from the listener fd (mirrors `struct seccomp_notif`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

impl Default for SeccompNotif {
    fn default() -> Self {
        // SAFETY: SeccompNotif is a plain C struct with no invariants.
        unsafe { std::mem::zeroed() }
    }
}

/// A pre-compiled seccomp-BPF program read from disk.
#[derive(Debug, Clone)]
pub struct BpfProgram {
    filter: Vec<SockFilter>,
}

impl BpfProgram {
    /// Load a raw `sock_filter` array from `path`.
    ///
    /// The file length must be a multiple of the instruction size and the
    /// program must fit in `BPF_MAXINSNS` instructions.
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let insn = size_of::<SockFilter>();
        if bytes.is_empty() || bytes.len() % insn != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad BPF program size: {} bytes", bytes.len()),
            ));
        }
        let count = bytes.len() / insn;
        if count > 4096 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("BPF program too long: {count} instructions"),
            ));
        }
        let mut filter = vec![SockFilter::default(); count];
        // SAFETY: SockFilter is plain-old-data of the exact on-disk layout;
        // the source and destination do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                filter.as_mut_ptr().cast::<u8>(),
                bytes.len(),
            );
        }
        Ok(Self { filter })
    }

    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }

    /// Install the program for the calling thread.
    ///
    /// With `new_listener` the kernel returns a notification listener fd.
    /// The caller must already have set `PR_SET_NO_NEW_PRIVS` (or hold
    /// `CAP_SYS_ADMIN` in its user namespace).
    ///
    /// # Safety
    ///
    /// Permanently restricts syscalls for this thread; a program that traps
    /// the wrong syscalls will make the process unusable.
    pub unsafe fn install(&self, new_listener: bool) -> Result<Option<OwnedFd>, Errno> {
        let fprog = SockFprog {
            len: self.filter.len() as u16,
            filter: self.filter.as_ptr(),
        };
        let flags = if new_listener {
            SECCOMP_FILTER_FLAG_NEW_LISTENER
        } else {
            0
        };
        // SAFETY: fprog points at a live program for the duration of the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                flags,
                &fprog as *const SockFprog,
            )
        };
        if ret < 0 {
            Err(last_errno())
        } else if new_listener {
            // SAFETY: with the listener flag, a non-negative return is an fd.
            Ok(Some(unsafe { OwnedFd::from_raw_fd(ret as i32) }))
        } else {
            Ok(None)
        }
    }
}

/// Receive one notification from the listener fd.
///
/// Blocks until a notification is available; poll the fd first to bound the
/// wait. Returns `Errno::NOENT` if the target died before the receive.
pub fn notif_recv(listener_fd: i32, notif: &mut SeccompNotif) -> Result<(), Errno> {
    // SAFETY: notif is a writable struct of the layout the ioctl expects.
    let ret = unsafe { libc::ioctl(listener_fd, SECCOMP_IOCTL_NOTIF_RECV, notif as *mut _) };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<SockFilter>(), 8);
        assert_eq!(size_of::<SeccompData>(), 64);
        assert_eq!(size_of::<SeccompNotif>(), 80);
    }

    #[test]
    fn load_rejects_ragged_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 13]).unwrap();
        assert!(BpfProgram::load(file.path()).is_err());
    }

    #[test]
    fn load_parses_instructions() {
        // RET ALLOW, encoded little-endian: code=0x0006, jt=0, jf=0, k=0x7fff0000
        let insn: [u8; 8] = [0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x7f];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&insn).unwrap();
        file.write_all(&insn).unwrap();
        let prog = BpfProgram::load(file.path()).unwrap();
        assert_eq!(prog.len(), 2);
        assert_eq!(prog.filter[0].code, 0x0006);
        assert_eq!(prog.filter[0].k, 0x7fff_0000);
    }

    #[test]
    fn load_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(BpfProgram::load(file.path()).is_err());
    }
}
