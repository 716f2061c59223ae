//! Outer supervisor: turns an [`Invocation`] into a launch-ready jail.
//!
//! Three fd numbers are reserved by contract inside the jailed process and
//! must hold the right files before any untrusted code runs: logging (3),
//! the meta record (4), and the SIGSYS notification socket (5).
//!
//! The `PreDropCaps` hook order is load-bearing:
//!
//! 1. meta-init (or plain rlimits when no meta record was asked for)
//! 2. remount `/` read-only, re-enable exec on `/tmp`
//! 3. optional chdir
//! 4. stdio redirection, which detaches its carrier mount and must be last
//!
//! and `PreExecve` closes the logging fd so the target cannot write to the
//! supervisor's log sink.

use std::ffi::CString;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use rustix::io::Errno;

use omegabox_jail::{HookPhase, Jail, MountSpec};
use omegabox_sys::seccomp::BpfProgram;
use omegabox_sys::{last_errno, scm_rights, ErrnoSaver};

use crate::args::Invocation;
use crate::cgroup;
use crate::clock::Timespec;
use crate::init::{self, InitPayload};
use crate::limits;
use crate::stdio;

pub const LOGGING_FD: RawFd = 3;
pub const META_FD: RawFd = 4;
pub const SIGSYS_FD: RawFd = 5;

/// The invoking user, resolved before the environment reset.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    /// Invoked through sudo: run the target as the invoker, no user ns.
    pub from_sudo: bool,
}

/// A jail ready to run, plus the supervisor-side observer socket.
pub struct Launch {
    pub jail: Jail,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Peer of the socketpair placed at the SIGSYS fd; present when a meta
    /// record was requested.
    pub observer_socket: Option<OwnedFd>,
}

/// Assemble the jail: namespaces, mounts, fd placement, hooks.
pub fn build(inv: Invocation, creds: Credentials) -> anyhow::Result<Launch> {
    let mut jail = Jail::new();
    jail.reset_signal_mask();
    jail.close_open_fds();
    jail.preserve_fd(LOGGING_FD);

    if !inv.disable_sandboxing {
        if creds.from_sudo {
            jail.change_uid(creds.uid).change_gid(creds.gid);
        } else {
            // The invoking user appears as uid 1000 inside the container.
            jail.namespace_user()
                .change_uid(1000)
                .change_gid(1000)
                .uidmap(1000, creds.uid)
                .gidmap(1000, creds.gid);
        }

        jail.namespace_cgroups()
            .namespace_ipc()
            .namespace_net()
            .namespace_pids()
            .namespace_uts()
            .namespace_vfs()
            .set_hostname("omegabox")
            .no_new_privs()
            .drop_all_caps();

        jail.mount(MountSpec::proc("/proc"));
        jail.mount(MountSpec::tmpfs("/tmp", "size=67108864,mode=1777"));
        jail.mount(MountSpec::tmpfs(stdio::STDIO_MOUNT, "size=4096,mode=555"));
        for bind in &inv.binds {
            jail.mount(bind.clone());
        }
        for mount in stdio::prepare_sandboxed(&inv.redirects)
            .map_err(|errno| anyhow!("failed to stage stdio redirects: {errno}"))?
        {
            jail.mount(mount);
        }

        if inv.memory_limit.is_some() && !cgroup::is_cgroup_v2() {
            jail.mount(self_bind(cgroup::V1_MEMORY_PARENT));
        }
    } else {
        tracing::warn!("running with --disable-sandboxing");
        stdio::pretruncate_unsandboxed(&inv.redirects)
            .map_err(|errno| anyhow!("failed to stage stdio redirects: {errno}"))?;
    }

    let cgroup_parent = match &inv.script_basename {
        Some(script) => {
            let parent = cgroup::prepare_script_parent(script)
                .with_context(|| format!("failed to prepare the {script} cgroup"))?;
            if parent.is_some() && !inv.disable_sandboxing {
                let subtree = if cgroup::is_cgroup_v2() {
                    cgroup::UNIFIED_ROOT
                } else {
                    cgroup::V1_PIDS_ROOT
                };
                jail.mount(self_bind(subtree));
            }
            parent
        }
        None => None,
    };

    if let Some(policy_path) = &inv.seccomp_bpf {
        let program = BpfProgram::load(policy_path)
            .with_context(|| format!("failed to load the seccomp program {policy_path:?}"))?;
        jail.use_seccomp_program(program, inv.meta.is_some());
    }

    // Hook 1 and the reserved-fd placement.
    let observer_socket = if let Some(meta_path) = &inv.meta {
        let meta_file = open_meta_file(meta_path)
            .with_context(|| format!("failed to open the meta file {meta_path:?}"))?;
        move_to_well_known_fd(meta_file, META_FD).context("failed to place the meta fd")?;
        jail.preserve_fd(META_FD);

        let (jail_end, observer_end) =
            scm_rights::socketpair().context("failed to create the sigsys socketpair")?;
        move_to_well_known_fd(jail_end, SIGSYS_FD).context("failed to place the sigsys fd")?;
        jail.preserve_fd(SIGSYS_FD);

        let mut post_fork_jail = Jail::new();
        if creds.from_sudo {
            post_fork_jail.change_uid(creds.uid).change_gid(creds.gid);
        }
        if !inv.disable_sandboxing {
            post_fork_jail.no_new_privs().drop_all_caps();
        }

        let payload = InitPayload {
            disable_sandboxing: inv.disable_sandboxing,
            post_fork_jail,
            comm: inv.comm.clone(),
            cgroup_parent,
            memory_limit: inv.memory_limit,
            vm_overhead: inv.vm_memory_size,
            rlimits: inv.rlimits.clone(),
            wall_limit: inv.wall_time_limit.map(Timespec::from_millis),
        };
        let mut payload_slot = Some(payload);
        jail.add_hook(HookPhase::PreDropCaps, move || {
            let payload = payload_slot.take().ok_or(Errno::INVAL)?;
            init::meta_init(payload)
        });

        Some(observer_end)
    } else {
        let rlimits = inv.rlimits.clone();
        jail.add_hook(HookPhase::PreDropCaps, move || limits::apply(&rlimits));
        None
    };

    // Hook 2.
    if !inv.disable_sandboxing {
        jail.add_hook(HookPhase::PreDropCaps, remount_root_read_only);
    }

    // Hook 3.
    if let Some(dir) = inv.chdir.clone() {
        jail.add_hook(HookPhase::PreDropCaps, move || chdir_hook(&dir));
    }

    // Hook 4: must be the last PreDropCaps hook; it detaches /mnt/stdio.
    if inv.redirects.any() {
        let redirects = inv.redirects.clone();
        let disable_sandboxing = inv.disable_sandboxing;
        jail.add_hook(HookPhase::PreDropCaps, move || {
            stdio::redirect_stdio(&redirects, disable_sandboxing)
        });
    }

    // Hook 5: nothing may be registered after this one.
    jail.add_hook(HookPhase::PreExecve, close_logging_fd);

    Ok(Launch {
        jail,
        program: inv.program,
        args: inv.program_args,
        observer_socket,
    })
}

fn self_bind(path: &str) -> MountSpec {
    MountSpec::bind(path, path, true)
}

fn open_meta_file(path: &Path) -> std::io::Result<OwnedFd> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok(file.into())
}

/// Place `fd` at exactly `well_known_fd`, leaking the descriptor so the
/// jailed process inherits it.
fn move_to_well_known_fd(fd: OwnedFd, well_known_fd: RawFd) -> std::io::Result<()> {
    if fd.as_raw_fd() == well_known_fd {
        let _ = fd.into_raw_fd();
        return Ok(());
    }
    // SAFETY: dup2 onto a number we reserve by contract; the duplicate
    // intentionally outlives `fd`.
    if unsafe { libc::dup2(fd.as_raw_fd(), well_known_fd) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn remount_root_read_only() -> Result<(), Errno> {
    // SAFETY: constant arguments.
    if unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_RDONLY | libc::MS_REMOUNT | libc::MS_BIND,
            std::ptr::null(),
        )
    } != 0
    {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!("failed to remount root read-only");
        }
        return Err(last_errno());
    }
    // /tmp keeps exec so staged binaries can still run.
    // SAFETY: constant arguments.
    if unsafe {
        libc::mount(
            std::ptr::null(),
            c"/tmp".as_ptr(),
            std::ptr::null(),
            libc::MS_NODEV | libc::MS_NOSUID | libc::MS_REMOUNT,
            std::ptr::null(),
        )
    } != 0
    {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!("failed to remount /tmp");
        }
        return Err(last_errno());
    }
    Ok(())
}

fn chdir_hook(dir: &Path) -> Result<(), Errno> {
    let c_dir = CString::new(dir.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)?;
    // SAFETY: c_dir is a live CString.
    if unsafe { libc::chdir(c_dir.as_ptr()) } != 0 {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!(?dir, "failed to chdir");
        }
        return Err(last_errno());
    }
    Ok(())
}

fn close_logging_fd() -> Result<(), Errno> {
    // SAFETY: fd 3 is the supervisor's log sink, reserved by contract.
    if unsafe { libc::close(LOGGING_FD) } != 0 {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!("failed to close the logging fd");
        }
        return Err(last_errno());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Cli;
    use clap::Parser as _;

    fn invocation(args: &[&str]) -> Invocation {
        Cli::try_parse_from(args)
            .unwrap()
            .into_invocation(Path::new("/work"))
            .unwrap()
    }

    fn creds() -> Credentials {
        Credentials {
            // SAFETY: getuid/getgid cannot fail.
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            from_sudo: false,
        }
    }

    #[test]
    fn unsandboxed_build_has_no_observer_without_meta() {
        let launch = build(
            invocation(&["omegabox", "--disable-sandboxing", "--", "/bin/true"]),
            creds(),
        )
        .unwrap();
        assert!(launch.observer_socket.is_none());
        assert_eq!(launch.program, Path::new("/bin/true"));
    }

    #[test]
    fn chdir_hook_reports_enoent() {
        assert_eq!(
            chdir_hook(Path::new("/no/such/directory")),
            Err(Errno::NOENT)
        );
    }

    #[test]
    fn self_bind_is_writable_same_path() {
        let spec = self_bind(cgroup::UNIFIED_ROOT);
        assert_eq!(spec.source, spec.target);
        assert!(!spec.flags.contains(nix::mount::MsFlags::MS_RDONLY));
    }
}
