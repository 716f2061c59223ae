//! Jail specification builder.

use std::os::fd::RawFd;

use rustix::io::Errno;

use omegabox_sys::last_errno;
use omegabox_sys::seccomp::BpfProgram;

use crate::hooks::{Hook, HookEntry, HookPhase};
use crate::mounts::MountSpec;

/// Which namespaces the jailed process enters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Namespaces {
    pub user: bool,
    pub mount: bool,
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    pub uts: bool,
    pub cgroup: bool,
}

pub(crate) struct SeccompConfig {
    pub program: BpfProgram,
    pub notify: bool,
}

/// Declarative description of a jail.
///
/// Built by the supervisor, then consumed by [`crate::run`]. A second,
/// lighter `Jail` can be applied to the *current* process with [`Jail::enter`]
/// (no namespaces or mounts, only credential and capability changes); the
/// in-container init uses this to shed its own privileges after forking the
/// target.
#[derive(Default)]
pub struct Jail {
    pub(crate) ns: Namespaces,
    pub(crate) uid_map: Option<(libc::uid_t, libc::uid_t)>,
    pub(crate) gid_map: Option<(libc::gid_t, libc::gid_t)>,
    pub(crate) change_uid: Option<libc::uid_t>,
    pub(crate) change_gid: Option<libc::gid_t>,
    pub(crate) hostname: Option<String>,
    pub(crate) no_new_privs: bool,
    pub(crate) drop_caps: bool,
    pub(crate) reset_signal_mask: bool,
    pub(crate) close_fds: bool,
    pub(crate) preserved_fds: Vec<RawFd>,
    pub(crate) mounts: Vec<MountSpec>,
    pub(crate) hooks: Vec<HookEntry>,
    pub(crate) seccomp: Option<SeccompConfig>,
}

impl Jail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a new user namespace.
    pub fn namespace_user(&mut self) -> &mut Self {
        self.ns.user = true;
        self
    }

    pub fn namespace_vfs(&mut self) -> &mut Self {
        self.ns.mount = true;
        self
    }

    pub fn namespace_pids(&mut self) -> &mut Self {
        self.ns.pid = true;
        self
    }

    pub fn namespace_ipc(&mut self) -> &mut Self {
        self.ns.ipc = true;
        self
    }

    pub fn namespace_net(&mut self) -> &mut Self {
        self.ns.net = true;
        self
    }

    pub fn namespace_uts(&mut self) -> &mut Self {
        self.ns.uts = true;
        self
    }

    pub fn namespace_cgroups(&mut self) -> &mut Self {
        self.ns.cgroup = true;
        self
    }

    /// Map `inside` to `outside` (one uid wide) in the new user namespace.
    pub fn uidmap(&mut self, inside: libc::uid_t, outside: libc::uid_t) -> &mut Self {
        self.uid_map = Some((inside, outside));
        self
    }

    pub fn gidmap(&mut self, inside: libc::gid_t, outside: libc::gid_t) -> &mut Self {
        self.gid_map = Some((inside, outside));
        self
    }

    /// Switch to `uid` before dropping into the target (after mounts/hooks).
    pub fn change_uid(&mut self, uid: libc::uid_t) -> &mut Self {
        self.change_uid = Some(uid);
        self
    }

    pub fn change_gid(&mut self, gid: libc::gid_t) -> &mut Self {
        self.change_gid = Some(gid);
        self
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn no_new_privs(&mut self) -> &mut Self {
        self.no_new_privs = true;
        self
    }

    /// Clear the ambient set and empty the capability bounding set.
    pub fn drop_all_caps(&mut self) -> &mut Self {
        self.drop_caps = true;
        self
    }

    /// Reset the signal mask to empty inside the jail.
    pub fn reset_signal_mask(&mut self) -> &mut Self {
        self.reset_signal_mask = true;
        self
    }

    /// Close every fd the preserve list does not name before `execve`.
    pub fn close_open_fds(&mut self) -> &mut Self {
        self.close_fds = true;
        self
    }

    /// Keep `fd` open across the launch (fds 0-2 are always kept).
    pub fn preserve_fd(&mut self, fd: RawFd) -> &mut Self {
        if !self.preserved_fds.contains(&fd) {
            self.preserved_fds.push(fd);
        }
        self
    }

    /// Append a mount entry; entries apply in insertion order.
    pub fn mount(&mut self, spec: MountSpec) -> &mut Self {
        self.mounts.push(spec);
        self
    }

    /// Register a hook; order within a phase is insertion order.
    pub fn add_hook(
        &mut self,
        phase: HookPhase,
        hook: impl FnMut() -> Result<(), Errno> + Send + 'static,
    ) -> &mut Self {
        self.hooks.push(HookEntry {
            phase,
            hook: Box::new(hook) as Hook,
        });
        self
    }

    /// Install `program` in the pre-exec child. With `notify`, the filter is
    /// installed with a user-notification listener whose fd is handed back
    /// through [`crate::RunningJail::notify_fd`].
    pub fn use_seccomp_program(&mut self, program: BpfProgram, notify: bool) -> &mut Self {
        self.seccomp = Some(SeccompConfig { program, notify });
        self
    }

    pub(crate) fn wants_notify(&self) -> bool {
        self.seccomp.as_ref().is_some_and(|s| s.notify)
    }

    /// Apply this jail's credential and capability changes to the calling
    /// process. Namespaces, mounts, hooks, and seccomp are ignored.
    pub fn enter(&self) -> Result<(), Errno> {
        if self.drop_caps {
            drop_capabilities();
        }
        if let Some(gid) = self.change_gid {
            let gid = nix::unistd::Gid::from_raw(gid);
            nix::unistd::setresgid(gid, gid, gid).map_err(nix_errno)?;
        }
        if let Some(uid) = self.change_uid {
            let uid = nix::unistd::Uid::from_raw(uid);
            nix::unistd::setresuid(uid, uid, uid).map_err(nix_errno)?;
        }
        if self.no_new_privs {
            apply_no_new_privs()?;
        }
        Ok(())
    }
}

pub(crate) fn nix_errno(err: nix::errno::Errno) -> Errno {
    Errno::from_raw_os_error(err as i32)
}

/// Clear the ambient capability set and drain the bounding set.
///
/// Drops past the highest supported capability fail with EINVAL, which is
/// the loop's stop condition, so individual errors are not checked.
pub(crate) fn drop_capabilities() {
    // SAFETY: prctl with constant arguments.
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        );
        for cap in 0..64 {
            libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
        }
    }
}

pub(crate) fn apply_no_new_privs() -> Result<(), Errno> {
    // SAFETY: prctl with constant arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Close every open fd above 2 that `preserved` does not name.
///
/// Also useful to a hook that turns the pre-exec child into a long-lived
/// init: stray inherited copies of the supervisor's sockets would keep
/// their peers from ever seeing EOF.
pub fn close_extra_fds(preserved: &[RawFd]) {
    let mut to_close = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                if fd > 2 && !preserved.contains(&fd) {
                    to_close.push(fd);
                }
            }
        }
    }
    for fd in to_close {
        // SAFETY: fd came from /proc/self/fd and is not one we still use.
        unsafe { libc::close(fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates() {
        let mut jail = Jail::new();
        jail.namespace_user()
            .namespace_pids()
            .namespace_vfs()
            .set_hostname("box")
            .uidmap(1000, 1000)
            .no_new_privs()
            .drop_all_caps()
            .preserve_fd(3)
            .preserve_fd(3);

        assert!(jail.ns.user && jail.ns.pid && jail.ns.mount);
        assert!(!jail.ns.net);
        assert_eq!(jail.hostname.as_deref(), Some("box"));
        assert_eq!(jail.uid_map, Some((1000, 1000)));
        assert_eq!(jail.preserved_fds, vec![3]);
    }

    #[test]
    fn enter_with_empty_jail_is_noop() {
        Jail::new().enter().unwrap();
    }

    #[test]
    fn notify_requires_seccomp() {
        assert!(!Jail::new().wants_notify());
    }
}
