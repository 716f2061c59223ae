//! omegabox-jail: process jail primitives
//!
//! This crate builds and launches the isolated environment the supervisor
//! runs untrusted programs in. It combines the standard Linux mechanisms for
//! defense in depth:
//!
//! - **User namespaces** - the invoking user maps to an unprivileged uid
//! - **cgroup/ipc/net/pid/uts/mount namespaces** - private kernel views
//! - **Mount table** - fresh `/proc`, tmpfs scratch space, caller binds
//! - **Capability drop** - empty bounding and ambient sets, no-new-privs
//! - **Seccomp-BPF** - pre-compiled policy programs, optionally with a
//!   user-notification listener fd handed back to the supervisor
//!
//! Callers describe the jail with [`Jail`]'s builder methods, register
//! callbacks in the two hook phases ([`HookPhase`]), and launch with
//! [`run`]. Hooks run inside the new namespaces: `PreDropCaps` hooks with
//! full (namespaced) capabilities, `PreExecve` hooks just before the target
//! image is loaded.
//!
//! ```ignore
//! let mut jail = Jail::new();
//! jail.namespace_user().namespace_pids().namespace_vfs().namespace_uts();
//! jail.set_hostname("omegabox");
//! jail.mount(MountSpec::tmpfs("/tmp", "size=67108864,mode=1777"));
//! jail.add_hook(HookPhase::PreDropCaps, || { /* ... */ Ok(()) });
//! let running = run(jail, Path::new("/bin/true"), &["/bin/true".to_string()])?;
//! let status = running.wait()?;
//! ```

pub mod error;
pub mod hooks;
pub mod jail;
pub mod mounts;
pub mod run;

pub use error::JailError;
pub use hooks::{Hook, HookPhase};
pub use jail::{close_extra_fds, Jail};
pub use mounts::MountSpec;
pub use run::{run, RunningJail, WaitStatus};
