//! In-container init.
//!
//! Registered as the first `PreDropCaps` hook, this forks the target and
//! keeps the calling process as pid 1 of the pid namespace (or as a
//! subreaper when sandboxing is disabled). The forked child returns from
//! the hook and continues down the jail pipeline to the target image; the
//! init side never returns. It reaps, arbitrates ptrace stops, enforces the
//! wall-clock deadline, reconciles the exit cause, writes the meta record
//! to the reserved fd, and `_exit`s with the reconciled code.
//!
//! Errors after the fork are logged and swallowed: whatever happens, the
//! caller gets a meta record.

use std::cmp::Ordering;
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::PathBuf;

use rustix::io::Errno;

use omegabox_jail::Jail;
use omegabox_sys::{last_errno, retry_eintr, scm_rights, siginfo, ErrnoSaver};

use crate::cgroup::{self, ScopedCgroup};
use crate::clock::Timespec;
use crate::limits::{self, ResourceLimit};
use crate::meta::{self, Accounting, ExitCause};
use crate::supervisor::{META_FD, SIGSYS_FD};

/// Everything init needs, assembled by the supervisor before launch.
pub struct InitPayload {
    pub disable_sandboxing: bool,
    /// Credential/capability drops init applies to itself after the fork.
    pub post_fork_jail: Jail,
    /// Short target name installed with `PR_SET_NAME`.
    pub comm: Option<String>,
    /// Per-script cgroup parent the invocation group nests under.
    pub cgroup_parent: Option<PathBuf>,
    /// Cgroup-enforced memory ceiling in bytes.
    pub memory_limit: Option<i64>,
    /// Bytes subtracted from max-RSS before reporting.
    pub vm_overhead: u64,
    pub rlimits: Vec<ResourceLimit>,
    pub wall_limit: Option<Timespec>,
}

/// The meta-init hook body.
///
/// Returns only in the forked target-side child; the init side diverges
/// into [`supervise`].
pub fn meta_init(payload: InitPayload) -> Result<(), Errno> {
    let unified_mode = cgroup::is_cgroup_v2();
    let mut unified: Option<ScopedCgroup> = None;
    let mut v1_pids: Option<ScopedCgroup> = None;
    let mut v1_memory: Option<ScopedCgroup> = None;

    if let Some(parent) = &payload.cgroup_parent {
        match ScopedCgroup::create(parent, unified_mode) {
            Ok(cg) => {
                if unified_mode {
                    unified = Some(cg);
                } else {
                    v1_pids = Some(cg);
                }
            }
            Err(err) => {
                {
                    let _errno = ErrnoSaver::new();
                    tracing::error!("failed to create the invocation cgroup: {err}");
                }
                return Err(err.errno());
            }
        }
    }

    if payload.disable_sandboxing {
        // Orphaned grandchildren must still be ours to reap.
        // SAFETY: prctl with constant arguments.
        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } == -1 {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!("failed to become a subreaper");
            }
            return Err(last_errno());
        }
    } else if let Some(limit) = payload.memory_limit {
        if unified.is_none() {
            let cg = ScopedCgroup::create(std::path::Path::new(cgroup::V1_MEMORY_PARENT), false)
                .map_err(|err| {
                    {
                        let _errno = ErrnoSaver::new();
                        tracing::error!("failed to create the memory cgroup: {err}");
                    }
                    err.errno()
                })?;
            v1_memory = Some(cg);
        }
        for cg in unified.iter().chain(v1_memory.iter()) {
            cg.set_memory_max(limit).map_err(|err| {
                {
                    let _errno = ErrnoSaver::new();
                    tracing::error!("failed to write the cgroup memory limit: {err}");
                }
                err.errno()
            })?;
        }
    }

    // All child events are collected through sigtimedwait.
    // SAFETY: sigset manipulation on live stack structs.
    let (mask, orig_mask) = unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        let mut orig: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGCHLD);
        if libc::sigprocmask(libc::SIG_BLOCK, &mask, &mut orig) < 0 {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!("failed to block SIGCHLD");
            }
            return Err(last_errno());
        }
        (mask, orig)
    };

    let t0 = Timespec::now();
    let deadline = payload.wall_limit.map(|w| t0.add(w));

    // SAFETY: the child only runs fork-safe code before returning into the
    // jail pipeline, which ends in exec or _exit.
    let child_pid = unsafe { libc::fork() };
    if child_pid < 0 {
        return Err(last_errno());
    }

    if child_pid == 0 {
        return setup_target(
            &payload,
            &orig_mask,
            unified.as_mut(),
            v1_memory.as_mut(),
            v1_pids.as_mut(),
        );
    }

    supervise(
        payload, mask, t0, deadline, child_pid, unified, v1_memory, v1_pids,
    )
}

/// Target-side half of the fork: admit into the cgroups, restore signals,
/// shed init-only fds, hand ourselves to the tracer, apply rlimits.
fn setup_target(
    payload: &InitPayload,
    orig_mask: &libc::sigset_t,
    unified: Option<&mut ScopedCgroup>,
    v1_memory: Option<&mut ScopedCgroup>,
    v1_pids: Option<&mut ScopedCgroup>,
) -> Result<(), Errno> {
    if payload.disable_sandboxing {
        // A fresh process group so the terminal sweep can address the whole
        // subtree without a pid namespace.
        // SAFETY: setsid has no arguments.
        if unsafe { libc::setsid() } == -1 {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!("failed to create a new session");
            }
            return Err(last_errno());
        }
    }

    if let Some(comm) = &payload.comm {
        if let Ok(c_comm) = CString::new(comm.as_str()) {
            // SAFETY: PR_SET_NAME reads a NUL-terminated string.
            unsafe { libc::prctl(libc::PR_SET_NAME, c_comm.as_ptr()) };
        }
    }

    // getpid() is 2 inside the fresh pid namespace and the real pid in
    // disable-sandboxing mode; both are the pid the kernel accounts.
    // SAFETY: getpid has no failure mode.
    let self_pid = unsafe { libc::getpid() };
    for cg in [unified, v1_memory, v1_pids].into_iter().flatten() {
        cg.admit(self_pid).map_err(|err| {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!("failed to join the cgroup: {err}");
            }
            err.errno()
        })?;
        cg.release();
        cg.seal().map_err(|err| {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!("failed to seal the cgroup: {err}");
            }
            err.errno()
        })?;
    }

    // SAFETY: orig_mask was filled by sigprocmask above.
    if unsafe { libc::sigprocmask(libc::SIG_SETMASK, orig_mask, std::ptr::null_mut()) } < 0 {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!("failed to restore the signal mask");
        }
        return Err(last_errno());
    }

    for fd in [SIGSYS_FD, META_FD] {
        // SAFETY: these well-known fds belong to init, not the target.
        if unsafe { libc::close(fd) } < 0 {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!(fd, "failed to close an init-only fd");
            }
            return Err(last_errno());
        }
    }

    // Tracer handshake: stop here until init has seen us and set its ptrace
    // options; execve and seccomp stops then route to init.
    // SAFETY: TRACEME takes no pointers; raising SIGSTOP stops this process.
    unsafe {
        if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) == -1 {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!("failed to request tracing");
            }
            return Err(last_errno());
        }
        libc::raise(libc::SIGSTOP);
    }

    limits::apply(&payload.rlimits)
}

/// Init-side half of the fork. Never returns.
#[allow(clippy::too_many_arguments)]
fn supervise(
    payload: InitPayload,
    mask: libc::sigset_t,
    t0: Timespec,
    deadline: Option<Timespec>,
    child_pid: libc::pid_t,
    unified: Option<ScopedCgroup>,
    v1_memory: Option<ScopedCgroup>,
    v1_pids: Option<ScopedCgroup>,
) -> ! {
    // From here on, returning means nothing; push through to meta emission
    // no matter what breaks.
    // SAFETY: PR_SET_NAME reads a NUL-terminated string.
    unsafe { libc::prctl(libc::PR_SET_NAME, c"omegabox-init".as_ptr()) };

    // Shed inherited copies of fds the init role does not own; a stray
    // copy of the supervisor's sockets would keep their peers from ever
    // seeing EOF.
    omegabox_jail::close_extra_fds(&[crate::supervisor::LOGGING_FD, META_FD, SIGSYS_FD]);

    // The observer needs a pid-reuse-proof handle before the target can
    // issue its first syscall; the target is still in its SIGSTOP handshake.
    let mut sigsys_socket = true;
    match omegabox_sys::pidfd::pidfd_open(child_pid) {
        Ok(child_pidfd) => {
            if let Err(err) = scm_rights::send_fd(SIGSYS_FD, child_pidfd.as_raw_fd()) {
                tracing::error!("failed to send the target pidfd: {err}");
                // SAFETY: fd 5 is ours to close.
                unsafe { libc::close(SIGSYS_FD) };
                sigsys_socket = false;
            }
        }
        Err(errno) => tracing::error!("failed to open the target pidfd: {errno}"),
    }
    if sigsys_socket {
        // SAFETY: half-close of a socket we own.
        unsafe { libc::shutdown(SIGSYS_FD, libc::SHUT_WR) };
    }

    // Shed our own privileges; the target already has its copy of the jail.
    if let Err(errno) = payload.post_fork_jail.enter() {
        tracing::error!("failed to drop init privileges: {errno}");
    }

    let mut attached = false;
    let mut exited = false;
    let mut init_status: libc::c_int = 0;
    // SAFETY: rusage is plain data; zeroed is a valid initial state.
    let mut init_usage: libc::rusage = unsafe { std::mem::zeroed() };
    let mut exit_syscall: Option<libc::c_int> = None;
    let mut exit_signal: Option<libc::c_int> = None;
    let mut t = t0;

    loop {
        let timeout = match deadline {
            Some(d) => {
                let remaining = d.sub(t);
                if remaining.is_negative() {
                    Timespec::ZERO
                } else {
                    remaining
                }
            }
            // No deadline: wake occasionally anyway so a lost SIGCHLD
            // cannot park us forever.
            None => Timespec { sec: 3600, nsec: 0 },
        };
        let ts = timeout.to_libc();
        // SAFETY: info is a writable siginfo; mask and ts are live.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = retry_eintr!(unsafe { libc::sigtimedwait(&mask, &mut info, &ts) } as i64);
        if ret == -1 {
            t = Timespec::now();
            if deadline.is_some() {
                break;
            }
            continue;
        }

        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: status and usage point at writable structs.
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            let pid = unsafe {
                libc::wait4(-1, &mut status, libc::WNOHANG | libc::__WALL, &mut usage)
            };
            if pid <= 0 {
                break;
            }

            if libc::WIFSTOPPED(status) {
                if !attached {
                    // SAFETY: pid is a stopped tracee of ours.
                    if unsafe {
                        libc::ptrace(
                            libc::PTRACE_SETOPTIONS,
                            pid,
                            0,
                            libc::PTRACE_O_TRACESECCOMP | libc::PTRACE_O_EXITKILL,
                        )
                    } == -1
                    {
                        tracing::error!("failed to set ptrace options: {}", last_errno());
                    }
                    attached = true;
                }
                handle_stop(pid, status, &mut exit_syscall, &mut exit_signal);
                continue;
            }

            if pid == child_pid {
                init_status = status;
                init_usage = usage;
                exited = true;
            }
        }

        t = Timespec::now();
        if exited {
            break;
        }
        if let Some(d) = deadline {
            if t.cmp_to(d) != Ordering::Less {
                break;
            }
        }
    }

    // Wall-clock verdict only when the kernel did not already name a cause.
    if let Some(d) = deadline {
        if t.cmp_to(d) != Ordering::Less && exit_signal.is_none() {
            exit_signal = Some(libc::SIGXCPU);
        }
    }

    // Terminal sweep: as pid 1, -1 addresses every process left in the
    // namespace; without one, the setsid process group stands in.
    let sweep_target = if payload.disable_sandboxing {
        -child_pid
    } else {
        -1
    };
    // SAFETY: kill with a negative pid signals a group.
    unsafe { libc::kill(sweep_target, libc::SIGKILL) };
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: as above.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let pid =
            retry_eintr!(unsafe { libc::wait4(-1, &mut status, libc::__WALL, &mut usage) } as i64);
        if pid <= 0 {
            break;
        }
        if exited || pid as libc::pid_t != child_pid {
            continue;
        }
        init_status = status;
        init_usage = usage;
        exited = true;
    }

    let elapsed = Timespec::now().sub(t0);

    // The tracer can lose the SIGSYS race; the observer's copy of the
    // syscall number is authoritative when the loop saw nothing.
    if sigsys_socket {
        if let Some(nr) = drain_exit_syscall(SIGSYS_FD) {
            if exit_syscall.is_none() {
                exit_syscall = Some(nr);
            }
        }
    }

    // A v1 memory group held at its ceiling underreports ru_maxrss; the
    // configured limit is the honest figure.
    if let Some(cg) = &v1_memory {
        match cg.read_failcnt() {
            Ok(failcnt) if failcnt > 0 => {
                init_usage.ru_maxrss = payload.memory_limit.unwrap_or(0) / 1024;
            }
            Ok(_) => {}
            Err(err) => tracing::error!("failed to read memory.failcnt: {err}"),
        }
    }

    drop(v1_memory);
    drop(v1_pids);
    drop(unified);

    let accounting = Accounting::from_rusage(
        &init_usage,
        elapsed.as_micros(),
        meta::reconcile_max_rss(init_usage.ru_maxrss, payload.vm_overhead),
    );
    let cause = ExitCause {
        status: init_status,
        signal: exit_signal,
        syscall: exit_syscall,
    };

    // The meta fd must survive a failed write; never run File's close-on-drop.
    let mut meta_file = ManuallyDrop::new(unsafe { File::from_raw_fd(META_FD) });
    let ret = match meta::write_meta(&mut *meta_file, &accounting, &cause) {
        Ok(ret) => ret,
        Err(err) => {
            tracing::error!("failed to write the meta record: {err}");
            meta::exit_code(&cause)
        }
    };
    let _ = meta_file.flush();

    // SAFETY: init's job is done; _exit skips atexit machinery by design.
    unsafe { libc::_exit(ret) };
}

/// Arbitrate one ptrace stop.
fn handle_stop(
    pid: libc::pid_t,
    status: libc::c_int,
    exit_syscall: &mut Option<libc::c_int>,
    exit_signal: &mut Option<libc::c_int>,
) {
    let stop_signal = libc::WSTOPSIG(status);
    match stop_signal {
        libc::SIGSYS => {
            // SAFETY: info is writable; pid is a stopped tracee.
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            if unsafe { libc::ptrace(libc::PTRACE_GETSIGINFO, pid, 0, &mut info) } == -1 {
                tracing::error!("failed to read SIGSYS siginfo: {}", last_errno());
            } else {
                *exit_syscall = Some(siginfo::sigsys_syscall(&info));
            }
            // SAFETY: plain kill.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        libc::SIGXCPU | libc::SIGXFSZ => {
            // A resource-limit breach is a definitive cause.
            *exit_signal = Some(stop_signal);
            // SAFETY: plain kill.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        libc::SIGSTOP | libc::SIGTRAP => {
            // Internal plumbing (the pre-exec handshake stop and
            // ptrace-injected traps); swallow.
            // SAFETY: pid is a stopped tracee.
            if unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0, 0) } == -1 {
                tracing::error!("failed to continue the target: {}", last_errno());
            }
        }
        _ => {
            // SAFETY: as above; redeliver the original signal.
            if unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0, stop_signal) } == -1 {
                tracing::error!("failed to continue the target: {}", last_errno());
            }
        }
    }
}

/// Read the observer's copy of the offending syscall number.
///
/// The wait is capped at one second: if the target died before the observer
/// learned its pid, both sides would otherwise block on fds the other never
/// closes. Short reads, EOF, and timeout all mean "no value".
fn drain_exit_syscall(socket_fd: libc::c_int) -> Option<libc::c_int> {
    let mut pfd = libc::pollfd {
        fd: socket_fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a live pollfd.
    let ready = retry_eintr!(unsafe { libc::poll(&mut pfd, 1, 1000) } as i64);
    if ready < 0 {
        tracing::error!("failed to poll the observer socket: {}", last_errno());
        return None;
    }
    if ready == 0 {
        tracing::error!("no exit syscall arrived from the observer");
        return None;
    }

    let mut nr: libc::c_int = 0;
    // SAFETY: nr is a writable int of the advertised size.
    let len = retry_eintr!(unsafe {
        libc::recv(
            socket_fd,
            (&mut nr as *mut libc::c_int).cast(),
            size_of::<libc::c_int>(),
            libc::MSG_DONTWAIT,
        )
    });
    match len {
        n if n < 0 => {
            tracing::error!("failed to read the exit syscall: {}", last_errno());
            None
        }
        0 => None,
        n if n as usize != size_of::<libc::c_int>() => {
            tracing::error!("short read of the exit syscall");
            None
        }
        _ => Some(nr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_times_out_on_silent_socket() {
        let (ours, _theirs) = scm_rights::socketpair().unwrap();
        assert_eq!(drain_exit_syscall(ours.as_raw_fd()), None);
    }

    #[test]
    fn drain_reads_one_integer() {
        let (ours, theirs) = scm_rights::socketpair().unwrap();
        let nr: libc::c_int = libc::SYS_mount as libc::c_int;
        // SAFETY: sending a 4-byte integer from a live stack slot.
        let sent = unsafe {
            libc::send(
                theirs.as_raw_fd(),
                (&nr as *const libc::c_int).cast(),
                size_of::<libc::c_int>(),
                0,
            )
        };
        assert_eq!(sent, size_of::<libc::c_int>() as isize);
        assert_eq!(drain_exit_syscall(ours.as_raw_fd()), Some(nr));
    }

    #[test]
    fn drain_treats_eof_as_no_value() {
        let (ours, theirs) = scm_rights::socketpair().unwrap();
        drop(theirs);
        assert_eq!(drain_exit_syscall(ours.as_raw_fd()), None);
    }
}
