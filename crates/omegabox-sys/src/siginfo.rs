//! `SIGSYS` siginfo decoding.
//!
//! A seccomp `SECCOMP_RET_TRAP` kill delivers `SIGSYS` with the offending
//! syscall number in `siginfo.si_syscall`. The libc crate does not expose
//! the `_sigsys` arm of the siginfo union, so mirror the kernel layout for
//! the one field we need.

/// The `_sigsys` arm of `siginfo_t` on 64-bit Linux.
///
/// Field offsets: three `c_int` header fields, alignment padding to 16, then
/// `{ void *call_addr; int syscall; unsigned int arch; }`.
#[repr(C)]
struct SigsysInfo {
    si_signo: libc::c_int,
    si_errno: libc::c_int,
    si_code: libc::c_int,
    _pad: libc::c_int,
    call_addr: u64,
    syscall: libc::c_int,
    arch: libc::c_uint,
}

/// Extract `si_syscall` from a `SIGSYS` siginfo.
///
/// Only meaningful when `info.si_signo == SIGSYS` and the signal came from a
/// seccomp filter (`si_code == SYS_SECCOMP`).
pub fn sigsys_syscall(info: &libc::siginfo_t) -> libc::c_int {
    // SAFETY: siginfo_t is at least as large as SigsysInfo and the kernel
    // fills the _sigsys arm for seccomp-originated SIGSYS.
    unsafe { &*(info as *const libc::siginfo_t).cast::<SigsysInfo>() }.syscall
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_fits_inside_siginfo() {
        assert!(size_of::<SigsysInfo>() <= size_of::<libc::siginfo_t>());
    }

    #[test]
    fn syscall_field_offset() {
        // The syscall number lives at byte 24 on x86_64 / aarch64.
        assert_eq!(std::mem::offset_of!(SigsysInfo, syscall), 24);
    }

    #[test]
    fn decodes_patterned_buffer() {
        // SAFETY: siginfo_t is plain data; a zeroed value is valid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let raw =
            (&mut info as *mut libc::siginfo_t).cast::<SigsysInfo>();
        // SAFETY: the overlay fits inside siginfo_t (asserted above).
        unsafe { (*raw).syscall = 165 };
        assert_eq!(sigsys_syscall(&info), 165);
    }
}
