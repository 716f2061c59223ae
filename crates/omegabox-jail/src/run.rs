//! Jail launch pipeline.
//!
//! Process tree, outermost first:
//!
//! ```text
//! supervisor ── stage-1 relay ── init (pid 1 of the pid ns) ── ... target
//! ```
//!
//! `unshare(CLONE_NEWPID)` only takes effect for the *next* fork, so the
//! relay exists to create the in-namespace init as its child; it then waits
//! for init and relays the exit status to the supervisor (signals encoded as
//! `128 + n`).
//!
//! Inside init, the pipeline is: signal-mask reset, hostname, mounts,
//! `PreDropCaps` hooks, credential change, capability drop, no-new-privs,
//! seccomp install (listener fd sent up via `SCM_RIGHTS` when requested),
//! `PreExecve` hooks, fd sweep, `execve`. A `PreDropCaps` hook is free to
//! fork and keep the calling process as a long-lived init; the forked child
//! returns from the hook and continues down the pipeline to the target
//! image.

use std::ffi::CString;
use std::io::{self, Write as _};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::io::Errno;

use omegabox_sys::{last_errno, retry_eintr, scm_rights};

use crate::error::JailError;
use crate::hooks::{run_phase, HookPhase};
use crate::jail::{
    apply_no_new_privs, close_extra_fds, drop_capabilities, nix_errno, Jail,
};
use crate::mounts;

/// Exit status of a jailed process tree, as relayed by stage-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Signaled(i32),
}

impl WaitStatus {
    /// Collapse to the supervisor's exit-code convention.
    pub fn code(self) -> i32 {
        match self {
            WaitStatus::Exited(code) => code,
            WaitStatus::Signaled(sig) => 128 + sig,
        }
    }
}

/// A launched jail.
pub struct RunningJail {
    relay_pid: libc::pid_t,
    notify_fd: Option<OwnedFd>,
}

impl RunningJail {
    /// The seccomp user-notification listener fd, when the jail's program
    /// was installed with one.
    pub fn take_notify_fd(&mut self) -> Option<OwnedFd> {
        self.notify_fd.take()
    }

    /// Wait for the jailed tree to finish.
    pub fn wait(self) -> Result<WaitStatus, JailError> {
        let mut status: libc::c_int = 0;
        // SAFETY: status points at a writable int.
        let ret = retry_eintr!(unsafe { libc::waitpid(self.relay_pid, &mut status, 0) } as i64);
        if ret < 0 {
            return Err(JailError::Wait(last_errno()));
        }
        if libc::WIFEXITED(status) {
            let code = libc::WEXITSTATUS(status);
            if code > 128 {
                Ok(WaitStatus::Signaled(code - 128))
            } else {
                Ok(WaitStatus::Exited(code))
            }
        } else if libc::WIFSIGNALED(status) {
            Ok(WaitStatus::Signaled(libc::WTERMSIG(status)))
        } else {
            Ok(WaitStatus::Exited(126))
        }
    }
}

/// Launch `program` inside `jail`.
///
/// Returns once the jail tree is running and, when user notification was
/// requested, once the listener fd has arrived from the pre-exec child.
pub fn run(jail: Jail, program: &Path, args: &[String]) -> Result<RunningJail, JailError> {
    let notify_pair = if jail.wants_notify() {
        Some(scm_rights::socketpair().map_err(JailError::ListenerHandoff)?)
    } else {
        None
    };

    // SAFETY: single-threaded at this point; the child only runs
    // fork-safe code until exec or _exit.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(JailError::Fork(last_errno()));
    }

    if pid == 0 {
        let child_sock = notify_pair.map(|(_, child)| child);
        stage1(jail, program, args, child_sock);
    }

    let notify_fd = match notify_pair {
        Some((parent_sock, child_sock)) => {
            drop(child_sock);
            wait_readable(parent_sock.as_raw_fd(), 30_000).map_err(|e| {
                // SAFETY: pid is our direct child.
                unsafe { libc::kill(pid, libc::SIGKILL) };
                JailError::ListenerHandoff(e)
            })?;
            let fd = scm_rights::recv_fd(parent_sock.as_raw_fd()).map_err(|e| {
                // SAFETY: as above.
                unsafe { libc::kill(pid, libc::SIGKILL) };
                JailError::ListenerHandoff(e)
            })?;
            Some(fd)
        }
        None => None,
    };

    Ok(RunningJail {
        relay_pid: pid,
        notify_fd,
    })
}

/// Block until `fd` is readable, up to `timeout_ms`.
fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a live pollfd.
    let ret = retry_eintr!(unsafe { libc::poll(&mut pfd, 1, timeout_ms) } as i64);
    match ret {
        1.. => Ok(()),
        0 => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out waiting for the jailed child",
        )),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Stage-1: enter the namespaces, fork the in-namespace init, relay status.
fn stage1(jail: Jail, program: &Path, args: &[String], notify_sock: Option<OwnedFd>) -> ! {
    if let Err(errno) = enter_namespaces(&jail) {
        report_child_error("namespace entry", errno);
        // SAFETY: forked child, nothing to unwind.
        unsafe { libc::_exit(126) };
    }

    // SAFETY: no threads in this process; init_main only runs fork-safe
    // code until exec or _exit.
    let init_pid = unsafe { libc::fork() };
    if init_pid < 0 {
        report_child_error("fork init", last_errno());
        // SAFETY: as above.
        unsafe { libc::_exit(126) };
    }
    if init_pid == 0 {
        init_main(jail, program, args, notify_sock);
    }

    drop(notify_sock);
    // The relay inherited copies of every supervisor fd, including the
    // reserved ones; holding them open would keep their peers from ever
    // seeing EOF. The relay itself only waits.
    close_extra_fds(&[]);

    let mut status: libc::c_int = 0;
    // SAFETY: status points at a writable int.
    let ret = retry_eintr!(unsafe { libc::waitpid(init_pid, &mut status, 0) } as i64);
    let code = if ret < 0 {
        126
    } else if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        126
    };
    // SAFETY: as above.
    unsafe { libc::_exit(code) };
}

fn enter_namespaces(jail: &Jail) -> Result<(), Errno> {
    use nix::sched::CloneFlags;

    let mut flags = CloneFlags::empty();
    if jail.ns.user {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    if jail.ns.mount {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if jail.ns.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if jail.ns.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if jail.ns.net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if jail.ns.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if jail.ns.cgroup {
        flags |= CloneFlags::CLONE_NEWCGROUP;
    }
    if flags.is_empty() {
        return Ok(());
    }

    nix::sched::unshare(flags).map_err(nix_errno)?;

    if jail.ns.user {
        // setgroups must be denied before an unprivileged gid_map write.
        std::fs::write("/proc/self/setgroups", "deny\n").map_err(io_errno)?;
        if let Some((inside, outside)) = jail.uid_map {
            std::fs::write("/proc/self/uid_map", format!("{inside} {outside} 1\n"))
                .map_err(io_errno)?;
        }
        if let Some((inside, outside)) = jail.gid_map {
            std::fs::write("/proc/self/gid_map", format!("{inside} {outside} 1\n"))
                .map_err(io_errno)?;
        }
    }
    Ok(())
}

/// The in-namespace init: hooks, privilege drop, seccomp, exec.
fn init_main(mut jail: Jail, program: &Path, args: &[String], notify_sock: Option<OwnedFd>) -> ! {
    let result = init_pipeline(&mut jail, program, args, notify_sock);
    // Only reached on error; exec does not return.
    let (what, errno) = result.unwrap_err();
    report_child_error(what, errno);
    // SAFETY: forked child, nothing to unwind.
    unsafe { libc::_exit(if what == "execve" { 127 } else { 126 }) };
}

type ChildError = (&'static str, Errno);

fn init_pipeline(
    jail: &mut Jail,
    program: &Path,
    args: &[String],
    notify_sock: Option<OwnedFd>,
) -> Result<std::convert::Infallible, ChildError> {
    if jail.reset_signal_mask {
        let empty = nix::sys::signal::SigSet::empty();
        nix::sys::signal::sigprocmask(
            nix::sys::signal::SigmaskHow::SIG_SETMASK,
            Some(&empty),
            None,
        )
        .map_err(|e| ("signal mask reset", nix_errno(e)))?;
    }

    if jail.ns.uts {
        if let Some(hostname) = &jail.hostname {
            nix::unistd::sethostname(hostname).map_err(|e| ("sethostname", nix_errno(e)))?;
        }
    }

    if jail.ns.mount {
        mounts::make_rprivate().map_err(|e| ("mount propagation", e))?;
        for spec in &jail.mounts {
            mounts::apply(spec).map_err(|e| ("mount", e))?;
        }
    }

    run_phase(&mut jail.hooks, HookPhase::PreDropCaps).map_err(|e| ("pre-drop-caps hook", e))?;

    if jail.drop_caps {
        drop_capabilities();
    }
    if let Some(gid) = jail.change_gid {
        if !jail.ns.user {
            nix::unistd::setgroups(&[]).map_err(|e| ("setgroups", nix_errno(e)))?;
        }
        let gid = nix::unistd::Gid::from_raw(gid);
        nix::unistd::setresgid(gid, gid, gid).map_err(|e| ("setresgid", nix_errno(e)))?;
    }
    if let Some(uid) = jail.change_uid {
        let uid = nix::unistd::Uid::from_raw(uid);
        nix::unistd::setresuid(uid, uid, uid).map_err(|e| ("setresuid", nix_errno(e)))?;
    }
    if jail.no_new_privs {
        apply_no_new_privs().map_err(|e| ("no_new_privs", e))?;
    }

    if let Some(seccomp) = &jail.seccomp {
        // SAFETY: the program came from BpfProgram::load and no_new_privs
        // (or namespaced CAP_SYS_ADMIN) is in place.
        let listener = unsafe { seccomp.program.install(seccomp.notify) }
            .map_err(|e| ("seccomp install", e))?;
        if let Some(listener) = listener {
            let sock = notify_sock
                .as_ref()
                .ok_or(("seccomp listener handoff", Errno::BADF))?;
            scm_rights::send_fd(sock.as_raw_fd(), listener.as_raw_fd())
                .map_err(|e| ("seccomp listener handoff", io_errno(e)))?;
        }
    }
    drop(notify_sock);

    run_phase(&mut jail.hooks, HookPhase::PreExecve).map_err(|e| ("pre-execve hook", e))?;

    if jail.close_fds {
        close_extra_fds(&jail.preserved_fds);
    }

    Err(("execve", exec(program, args)))
}

/// `execve` the target; only returns the failure errno.
fn exec(program: &Path, args: &[String]) -> Errno {
    let Ok(path) = CString::new(program.as_os_str().as_bytes()) else {
        return Errno::INVAL;
    };

    let mut argv_owned = Vec::with_capacity(args.len());
    for arg in args {
        match CString::new(arg.as_bytes()) {
            Ok(c) => argv_owned.push(c),
            Err(_) => return Errno::INVAL,
        }
    }
    let argv: Vec<*const libc::c_char> = argv_owned
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let mut envp_owned = Vec::new();
    for (key, value) in std::env::vars_os() {
        let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
        entry.extend_from_slice(key.as_bytes());
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        match CString::new(entry) {
            Ok(c) => envp_owned.push(c),
            Err(_) => return Errno::INVAL,
        }
    }
    let envp: Vec<*const libc::c_char> = envp_owned
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    // SAFETY: argv/envp are null-terminated arrays of live CStrings.
    unsafe { libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    last_errno()
}

fn io_errno(err: io::Error) -> Errno {
    Errno::from_raw_os_error(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Best-effort error report from a forked child. Writes straight to stderr;
/// the logging fd may already be gone at this point.
fn report_child_error(what: &str, errno: Errno) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "jail setup failed: {what}: {errno}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_codes() {
        assert_eq!(WaitStatus::Exited(0).code(), 0);
        assert_eq!(WaitStatus::Exited(7).code(), 7);
        assert_eq!(WaitStatus::Signaled(libc::SIGKILL).code(), 137);
    }

    #[test]
    fn plain_jail_runs_true() {
        let mut jail = Jail::new();
        jail.reset_signal_mask();
        let running = run(
            jail,
            Path::new("/bin/true"),
            &["/bin/true".to_string()],
        )
        .unwrap();
        assert_eq!(running.wait().unwrap(), WaitStatus::Exited(0));
    }

    #[test]
    fn plain_jail_relays_exit_code() {
        let jail = Jail::new();
        let running = run(
            jail,
            Path::new("/bin/sh"),
            &["/bin/sh".to_string(), "-c".to_string(), "exit 9".to_string()],
        )
        .unwrap();
        assert_eq!(running.wait().unwrap(), WaitStatus::Exited(9));
    }

    #[test]
    fn missing_program_reports_failure() {
        let jail = Jail::new();
        let running = run(
            jail,
            Path::new("/no/such/binary"),
            &["/no/such/binary".to_string()],
        )
        .unwrap();
        assert_eq!(running.wait().unwrap(), WaitStatus::Exited(127));
    }
}
