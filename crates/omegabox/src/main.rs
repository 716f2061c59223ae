//! omegabox: process sandbox and resource-enforcement supervisor.
//!
//! Wraps a target program in namespaces, a mandatory filesystem layout,
//! capability drops, seccomp filtering, and cgroup limits, then runs an
//! in-container init that enforces wall-clock and resource ceilings and
//! emits a structured verdict record.

use std::io;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use nix::sched::CpuSet;
use nix::unistd::{Gid, Pid, Uid, User};
use tracing_subscriber::EnvFilter;

mod args;
mod cgroup;
mod clock;
mod init;
mod limits;
mod meta;
mod observer;
mod stdio;
mod supervisor;

use args::Cli;
use supervisor::{Credentials, LOGGING_FD};

fn main() -> ExitCode {
    // SUDO_USER must be read before the environment reset discards it.
    let creds = match resolve_credentials() {
        Ok(creds) => creds,
        Err(err) => {
            eprintln!("omegabox: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(creds) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("omegabox: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(creds: Credentials) -> anyhow::Result<i32> {
    if creds.from_sudo {
        // Demote so stdio and meta files open as the invoking user.
        nix::unistd::setegid(Gid::from_raw(creds.gid)).context("setegid")?;
        nix::unistd::seteuid(Uid::from_raw(creds.uid)).context("seteuid")?;
    }

    reset_environment();
    pin_cpu_affinity().context("failed to pin the processor affinity")?;

    // All logging rides on the reserved fd so it survives stdio redirection
    // inside the container.
    // SAFETY: duplicating stderr onto a number we reserve by contract.
    if unsafe { libc::dup2(libc::STDERR_FILENO, LOGGING_FD) } == -1 {
        return Err(io::Error::last_os_error()).context("failed to set up the logging fd");
    }
    init_tracing();

    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let cli = Cli::try_parse().map_err(|err| {
        let _ = err.print();
        anyhow::anyhow!("invalid arguments")
    })?;
    let invocation = cli
        .into_invocation(&cwd)
        .map_err(|err| anyhow::anyhow!(err))?;

    let launch = supervisor::build(invocation, creds)?;

    if creds.from_sudo {
        // Root again; namespace and mount setup needs it.
        nix::unistd::seteuid(Uid::from_raw(0)).context("seteuid(0)")?;
        nix::unistd::setegid(Gid::from_raw(0)).context("setegid(0)")?;
    }

    let mut running = omegabox_jail::run(launch.jail, &launch.program, &launch.args)
        .context("failed to launch the jail")?;

    // The jail side owns the reserved fds now; our raw copies would keep
    // the sockets from ever reaching EOF if init dies early, wedging the
    // observer against the jail wait.
    if launch.observer_socket.is_some() {
        // SAFETY: placed by supervisor::build, inherited by the jail.
        unsafe {
            libc::close(supervisor::META_FD);
            libc::close(supervisor::SIGSYS_FD);
        }
    }

    if let Some(observer_socket) = launch.observer_socket {
        match running.take_notify_fd() {
            Some(notify_fd) => {
                let handle = observer::spawn(observer_socket, notify_fd);
                if handle.join().is_err() {
                    tracing::error!("the sigsys observer panicked");
                }
            }
            // No policy listener: drop our socket end so init's drain sees
            // EOF instead of waiting out its timeout.
            None => drop(observer_socket),
        }
    }

    let status = running.wait().context("failed to wait for the jail")?;
    Ok(status.code())
}

fn resolve_credentials() -> anyhow::Result<Credentials> {
    let sudo_user = std::env::var("SUDO_USER").ok();
    if let Some(name) = sudo_user {
        // Only meaningful when the escalation actually happened.
        if Uid::effective().is_root() {
            let user = User::from_name(&name)
                .with_context(|| format!("failed to look up user {name}"))?
                .with_context(|| format!("user {name} not found"))?;
            return Ok(Credentials {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
                from_sudo: true,
            });
        }
    }
    Ok(Credentials {
        uid: Uid::current().as_raw(),
        gid: Gid::current().as_raw(),
        from_sudo: false,
    })
}

/// Replace the environment with the fixed minimal set the target sees.
fn reset_environment() {
    let keys: Vec<_> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in keys {
        std::env::remove_var(key);
    }
    std::env::set_var("HOME", "/home");
    std::env::set_var("LANG", "en_US.UTF-8");
    std::env::set_var("PATH", "/usr/bin");
    std::env::set_var("DOTNET_CLI_TELEMETRY_OPTOUT", "1");
}

/// Pin to the lowest cpu in the affinity set when more than one is allowed,
/// trading throughput for less scheduling jitter in the measurements.
fn pin_cpu_affinity() -> anyhow::Result<()> {
    let pid = Pid::from_raw(0);
    let current = nix::sched::sched_getaffinity(pid)?;

    let mut lowest = None;
    let mut allowed = 0usize;
    for cpu in 0..CpuSet::count() {
        if current.is_set(cpu)? {
            allowed += 1;
            if lowest.is_none() {
                lowest = Some(cpu);
            }
        }
    }
    if allowed <= 1 {
        return Ok(());
    }

    let mut pinned = CpuSet::new();
    if let Some(cpu) = lowest {
        pinned.set(cpu)?;
    }
    nix::sched::sched_setaffinity(pid, &pinned)?;
    Ok(())
}

/// Route tracing output to the reserved logging fd.
fn init_tracing() {
    struct LoggingFd;
    impl io::Write for LoggingFd {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // SAFETY: writing a live buffer to the reserved fd.
            let ret = unsafe { libc::write(LOGGING_FD, buf.as_ptr().cast(), buf.len()) };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(|| LoggingFd)
        .with_ansi(false)
        .with_target(false)
        .init();
}
