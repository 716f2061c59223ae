//! Meta record emission.
//!
//! The verdict file is plain text, one `key:value` per line: the four
//! timing/memory keys in fixed order, then exactly one verdict block. A
//! SIGSYS verdict names the offending syscall and dominates every other
//! cause; a signal dominates a normal exit code.

use std::io::{self, Write};

use omegabox_sys::signals::signal_name;
use omegabox_sys::syscalls::syscall_name;

/// Resource accounting for the finished target.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accounting {
    /// User CPU time, microseconds.
    pub user_usec: i64,
    /// System CPU time, microseconds.
    pub sys_usec: i64,
    /// Wall time, microseconds.
    pub wall_usec: i64,
    /// Peak resident set in bytes, after VM-overhead subtraction.
    pub max_rss_bytes: i64,
}

impl Accounting {
    pub fn from_rusage(usage: &libc::rusage, wall_usec: i64, max_rss_bytes: i64) -> Self {
        Self {
            user_usec: usage.ru_utime.tv_sec * 1_000_000 + usage.ru_utime.tv_usec,
            sys_usec: usage.ru_stime.tv_sec * 1_000_000 + usage.ru_stime.tv_usec,
            wall_usec,
            max_rss_bytes,
        }
    }
}

/// Reconciled cause of target termination.
#[derive(Debug, Clone, Copy)]
pub struct ExitCause {
    /// Raw wait status of the tracked child.
    pub status: libc::c_int,
    /// Signal recorded by the supervise loop (resource kill, timeout, or a
    /// plain fatal signal), if any.
    pub signal: Option<libc::c_int>,
    /// Syscall that triggered a seccomp violation, if any.
    pub syscall: Option<libc::c_int>,
}

/// The verdict block a cause reconciles to.
enum Verdict {
    Sigsys(libc::c_int),
    Signal(libc::c_int),
    Exit(i32),
}

fn reconcile(cause: &ExitCause) -> Verdict {
    if let Some(nr) = cause.syscall {
        return Verdict::Sigsys(nr);
    }
    if libc::WIFSIGNALED(cause.status) || cause.signal.is_some() {
        let sig = cause.signal.unwrap_or_else(|| libc::WTERMSIG(cause.status));
        return Verdict::Signal(sig);
    }
    if libc::WIFEXITED(cause.status) {
        return Verdict::Exit(libc::WEXITSTATUS(cause.status));
    }
    // Nothing was ever reaped; report the empty-exit shape.
    Verdict::Exit(0)
}

/// The exit code the supervisor reports for `cause`.
pub fn exit_code(cause: &ExitCause) -> i32 {
    match reconcile(cause) {
        Verdict::Sigsys(_) => libc::SIGSYS,
        Verdict::Signal(sig) => sig,
        Verdict::Exit(code) => code,
    }
}

/// Write the meta record and return the exit code the supervisor reports.
pub fn write_meta<W: Write>(
    out: &mut W,
    accounting: &Accounting,
    cause: &ExitCause,
) -> io::Result<i32> {
    writeln!(out, "time:{}", accounting.user_usec)?;
    writeln!(out, "time-sys:{}", accounting.sys_usec)?;
    writeln!(out, "time-wall:{}", accounting.wall_usec)?;
    writeln!(out, "mem:{}", accounting.max_rss_bytes)?;

    match reconcile(cause) {
        Verdict::Sigsys(nr) => match syscall_name(nr) {
            Some(name) => write!(out, "signal:SIGSYS\nsyscall:{name}\n")?,
            None => write!(out, "signal:SIGSYS\nsyscall:#{nr}\n")?,
        },
        Verdict::Signal(sig) => match signal_name(sig) {
            Some(name) => writeln!(out, "signal:{name}")?,
            None => writeln!(out, "signal_number:{sig}")?,
        },
        Verdict::Exit(code) => writeln!(out, "status:{code}")?,
    }
    Ok(exit_code(cause))
}

/// `max(0, ru_maxrss·1024 − vm_overhead)`.
pub fn reconcile_max_rss(ru_maxrss_kib: i64, vm_overhead_bytes: u64) -> i64 {
    let bytes = ru_maxrss_kib.saturating_mul(1024);
    (bytes - vm_overhead_bytes as i64).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_status(code: i32) -> libc::c_int {
        code << 8
    }

    fn record(accounting: &Accounting, cause: &ExitCause) -> (String, i32) {
        let mut buf = Vec::new();
        let ret = write_meta(&mut buf, accounting, cause).unwrap();
        (String::from_utf8(buf).unwrap(), ret)
    }

    fn default_accounting() -> Accounting {
        Accounting {
            user_usec: 1000,
            sys_usec: 2000,
            wall_usec: 3000,
            max_rss_bytes: 4096,
        }
    }

    #[test]
    fn normal_exit() {
        let (text, ret) = record(
            &default_accounting(),
            &ExitCause {
                status: exit_status(7),
                signal: None,
                syscall: None,
            },
        );
        assert_eq!(text, "time:1000\ntime-sys:2000\ntime-wall:3000\nmem:4096\nstatus:7\n");
        assert_eq!(ret, 7);
    }

    #[test]
    fn sigsys_dominates_everything() {
        let (text, ret) = record(
            &default_accounting(),
            &ExitCause {
                status: exit_status(0),
                signal: Some(libc::SIGXCPU),
                syscall: Some(libc::SYS_mount as i32),
            },
        );
        assert!(text.ends_with("signal:SIGSYS\nsyscall:mount\n"));
        assert!(!text.contains("status:"));
        assert!(!text.contains("SIGXCPU"));
        assert_eq!(ret, libc::SIGSYS);
    }

    #[test]
    fn unknown_syscall_is_numbered() {
        let (text, _) = record(
            &default_accounting(),
            &ExitCause {
                status: exit_status(0),
                signal: None,
                syscall: Some(99_999),
            },
        );
        assert!(text.ends_with("signal:SIGSYS\nsyscall:#99999\n"));
    }

    #[test]
    fn recorded_signal_dominates_exit_code() {
        let (text, ret) = record(
            &default_accounting(),
            &ExitCause {
                status: exit_status(3),
                signal: Some(libc::SIGXCPU),
                syscall: None,
            },
        );
        assert!(text.ends_with("signal:SIGXCPU\n"));
        assert_eq!(ret, libc::SIGXCPU);
    }

    #[test]
    fn termination_signal_from_status() {
        let (text, ret) = record(
            &default_accounting(),
            &ExitCause {
                status: libc::SIGKILL, // killed, low bits carry the signal
                signal: None,
                syscall: None,
            },
        );
        assert!(text.ends_with("signal:SIGKILL\n"));
        assert_eq!(ret, libc::SIGKILL);
    }

    #[test]
    fn unknown_signal_is_numbered() {
        let (text, ret) = record(
            &default_accounting(),
            &ExitCause {
                status: exit_status(0),
                signal: Some(63),
                syscall: None,
            },
        );
        assert!(text.ends_with("signal_number:63\n"));
        assert_eq!(ret, 63);
    }

    #[test]
    fn max_rss_reconciliation() {
        assert_eq!(reconcile_max_rss(100, 0), 102_400);
        assert_eq!(reconcile_max_rss(100, 102_400), 0);
        assert_eq!(reconcile_max_rss(100, 200_000), 0);
        assert_eq!(reconcile_max_rss(0, 0), 0);
    }
}
