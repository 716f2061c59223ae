//! Stdio redirection.
//!
//! Sandboxed runs cannot open host paths once the mount namespace is
//! entered, so redirection happens in two stages: the supervisor pre-opens
//! each host path as the invoking user (creating and truncating write-side
//! files) and bind-mounts it into a private tmpfs at `/mnt/stdio`; after the
//! namespaces are entered, a hook opens the bind-mounted copies, dups them
//! onto fds 0/1/2, and lazily detaches the whole tmpfs so the target's
//! `/proc/self/mountinfo` never names the host paths.
//!
//! A path whose `open` fails with `ENXIO` is a stdio socket: the redirector
//! connects an `AF_UNIX/SOCK_SEQPACKET` socket to it and shuts down the
//! unused direction instead.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::sys::socket::{connect, shutdown, socket, AddressFamily, Shutdown, SockFlag, SockType, UnixAddr};
use rustix::io::Errno;

use omegabox_sys::{last_errno, ErrnoSaver};

/// Mountpoint of the private stdio tmpfs inside the container.
pub const STDIO_MOUNT: &str = "/mnt/stdio";

/// Redirection triple, carried into the in-container hook.
#[derive(Debug, Clone, Default)]
pub struct StdioRedirects {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl StdioRedirects {
    pub fn any(&self) -> bool {
        self.stdin.is_some() || self.stdout.is_some() || self.stderr.is_some()
    }
}

/// Open `path` for stdio use.
///
/// Regular files open with `O_NOFOLLOW`; `ENXIO` marks a stdio socket,
/// which is connected as SEQPACKET with the unused direction shut down.
pub fn open_stream(path: &Path, writable: bool) -> Result<OwnedFd, Errno> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)?;
    let flags = libc::O_NOFOLLOW | if writable { libc::O_WRONLY } else { libc::O_RDONLY };
    // SAFETY: c_path is a live CString.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd >= 0 {
        // SAFETY: fresh fd owned by us.
        return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    if last_errno() != Errno::NXIO {
        return Err(last_errno());
    }

    // Stdio socket: connect and half-shutdown the direction we do not use.
    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::empty(),
        None,
    )
    .map_err(errno_from_nix)?;
    let addr = UnixAddr::new(path).map_err(errno_from_nix)?;
    connect(sock.as_raw_fd(), &addr).map_err(errno_from_nix)?;
    shutdown(
        sock.as_raw_fd(),
        if writable {
            Shutdown::Read
        } else {
            Shutdown::Write
        },
    )
    .map_err(errno_from_nix)?;
    Ok(sock)
}

/// Open `path` and place it at `expected_fd`.
pub fn open_onto(path: &Path, expected_fd: RawFd, writable: bool) -> Result<(), Errno> {
    let fd = match open_stream(path, writable) {
        Ok(fd) => fd,
        Err(errno) => {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!(?path, expected_fd, "failed to open stdio redirect");
            }
            return Err(errno);
        }
    };
    if fd.as_raw_fd() == expected_fd {
        // Already in place; leak so it survives this scope.
        let _ = fd.into_raw_fd();
        return Ok(());
    }
    // SAFETY: dup2 onto a well-known fd number; fd stays owned and closes
    // on drop.
    if unsafe { libc::dup2(fd.as_raw_fd(), expected_fd) } == -1 {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!(?path, expected_fd, "failed to dup stdio redirect");
        }
        return Err(last_errno());
    }
    Ok(())
}

/// The redirect hook body: must be the last `PreDropCaps` hook.
pub fn redirect_stdio(redirects: &StdioRedirects, disable_sandboxing: bool) -> Result<(), Errno> {
    if disable_sandboxing {
        if let Some(path) = &redirects.stdin {
            open_onto(path, libc::STDIN_FILENO, false)?;
        }
        if let Some(path) = &redirects.stdout {
            open_onto(path, libc::STDOUT_FILENO, true)?;
        }
        if let Some(path) = &redirects.stderr {
            open_onto(path, libc::STDERR_FILENO, true)?;
            // Best effort; the redirected stream may be a socket.
            let message = b"WARNING: Running with --disable-sandboxing\n";
            // SAFETY: writing a constant buffer to stderr.
            unsafe { libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len()) };
        }
        return Ok(());
    }

    let mount = Path::new(STDIO_MOUNT);
    if redirects.stdin.is_some() {
        open_onto(&mount.join("stdin"), libc::STDIN_FILENO, false)?;
    }
    if redirects.stdout.is_some() {
        open_onto(&mount.join("stdout"), libc::STDOUT_FILENO, true)?;
    }
    if redirects.stderr.is_some() {
        open_onto(&mount.join("stderr"), libc::STDERR_FILENO, true)?;
    }

    // The fds are open in this namespace now; detach the carrier mount so
    // the source paths never show up in the target's mountinfo.
    if let Err(err) = nix::mount::umount2(mount, nix::mount::MntFlags::MNT_DETACH) {
        {
            let _errno = ErrnoSaver::new();
            tracing::error!("failed to detach {STDIO_MOUNT}");
        }
        return Err(errno_from_nix(err));
    }
    Ok(())
}

/// Supervisor pre-stage for a sandboxed run: open each host path as the
/// invoking user (write side created and truncated) and return the bind
/// mounts to install. `ENXIO` sources skip the pre-open; the in-container
/// hook connects them instead.
pub fn prepare_sandboxed(
    redirects: &StdioRedirects,
) -> Result<Vec<omegabox_jail::MountSpec>, Errno> {
    let mut mounts = Vec::new();
    let stdio = Path::new(STDIO_MOUNT);
    for (source, name, writable) in [
        (&redirects.stdin, "stdin", false),
        (&redirects.stdout, "stdout", true),
        (&redirects.stderr, "stderr", true),
    ] {
        let Some(source) = source else { continue };
        pre_open(source, writable)?;
        mounts.push(omegabox_jail::MountSpec::bind(
            source,
            stdio.join(name),
            writable,
        ));
    }
    Ok(mounts)
}

/// Supervisor pre-stage for `--disable-sandboxing`: create and truncate the
/// write-side targets as the invoking user. The redirect hook reopens them.
pub fn pretruncate_unsandboxed(redirects: &StdioRedirects) -> Result<(), Errno> {
    for path in [&redirects.stdout, &redirects.stderr].into_iter().flatten() {
        pre_open(path, true)?;
    }
    Ok(())
}

fn pre_open(path: &Path, writable: bool) -> Result<(), Errno> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)?;
    let flags = if writable {
        libc::O_WRONLY | libc::O_CREAT | libc::O_NOFOLLOW | libc::O_TRUNC
    } else {
        libc::O_RDONLY | libc::O_NOFOLLOW
    };
    // SAFETY: c_path is a live CString.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o644 as libc::c_uint) };
    if fd >= 0 {
        // Opened only for creation/truncation and a permission check.
        // SAFETY: fd is ours to close.
        unsafe { libc::close(fd) };
        return Ok(());
    }
    if last_errno() == Errno::NXIO {
        // A stdio socket; the in-container hook connects it.
        return Ok(());
    }
    {
        let _errno = ErrnoSaver::new();
        tracing::error!(?path, "failed to open stdio redirect source");
    }
    Err(last_errno())
}

fn errno_from_nix(err: nix::errno::Errno) -> Errno {
    Errno::from_raw_os_error(err as i32)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsFd;

    use nix::sys::socket::{bind, listen, Backlog};

    use super::*;

    fn is_socket(fd: RawFd) -> bool {
        // SAFETY: stat buffer is a plain C struct.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
        st.st_mode & libc::S_IFMT == libc::S_IFSOCK
    }

    #[test]
    fn regular_file_opens_directly() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"input").unwrap();
        let fd = open_stream(file.path(), false).unwrap();
        assert!(!is_socket(fd.as_raw_fd()));
    }

    #[test]
    fn missing_file_reports_enoent() {
        assert!(matches!(
            open_stream(Path::new("/no/such/stdio"), false),
            Err(Errno::NOENT)
        ));
    }

    #[test]
    fn enxio_path_connects_as_seqpacket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("stdout.sock");

        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        bind(listener.as_raw_fd(), &UnixAddr::new(&sock_path).unwrap()).unwrap();
        listen(&listener.as_fd(), Backlog::new(1).unwrap()).unwrap();

        let fd = open_stream(&sock_path, true).unwrap();
        assert!(is_socket(fd.as_raw_fd()));
    }

    #[test]
    fn pre_open_truncates_existing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"stale output").unwrap();
        pre_open(file.path(), true).unwrap();
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 0);
    }

    #[test]
    fn prepare_sandboxed_builds_bind_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = dir.path().join("in");
        std::fs::write(&stdin, b"x").unwrap();
        let stdout = dir.path().join("out");

        let redirects = StdioRedirects {
            stdin: Some(stdin),
            stdout: Some(stdout.clone()),
            stderr: None,
        };
        let mounts = prepare_sandboxed(&redirects).unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].target, Path::new("/mnt/stdio/stdin"));
        assert_eq!(mounts[1].target, Path::new("/mnt/stdio/stdout"));
        // The write side got created by the pre-open.
        assert!(stdout.exists());
    }
}
