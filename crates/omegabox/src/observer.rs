//! Out-of-container SIGSYS observer.
//!
//! A seccomp policy that kills the target for a forbidden syscall races the
//! in-container tracer: the tracer can miss the SIGSYS stop entirely when
//! the kill lands first. The observer closes that gap from outside the
//! container. It owns two fds by move and shares nothing else with the
//! supervisor:
//!
//! 1. Receive the target's pidfd over the notification socket (sent by the
//!    in-container init before the target can issue any syscall).
//! 2. Poll the seccomp listener fd and the pidfd together.
//! 3. Target exit (pidfd readable) ends the watch with nothing to report.
//! 4. A notification carries the offending syscall number: write it back
//!    through the socket as a 4-byte integer, then deliver the kill the
//!    policy chose through the pidfd.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::thread::JoinHandle;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use omegabox_sys::seccomp::{notif_recv, SeccompNotif};
use omegabox_sys::{pidfd, scm_rights};

const NOTIFY: Token = Token(0);
const PIDFD: Token = Token(1);

/// Spawn the observer thread. It exits on target death or after relaying
/// one violation; join it before waiting for the jail.
pub fn spawn(socket: OwnedFd, notify_fd: OwnedFd) -> JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(err) = watch(&socket, &notify_fd) {
            tracing::error!("sigsys observer: {err}");
        }
    })
}

fn watch(socket: &OwnedFd, notify_fd: &OwnedFd) -> std::io::Result<()> {
    let target_pidfd = scm_rights::recv_fd(socket.as_raw_fd())?;

    let mut poll = Poll::new()?;
    poll.registry().register(
        &mut SourceFd(&notify_fd.as_raw_fd()),
        NOTIFY,
        Interest::READABLE,
    )?;
    poll.registry().register(
        &mut SourceFd(&target_pidfd.as_raw_fd()),
        PIDFD,
        Interest::READABLE,
    )?;

    let mut events = Events::with_capacity(4);
    loop {
        poll.poll(&mut events, None)?;

        let mut notification_ready = false;
        for event in &events {
            match event.token() {
                // Target is gone; there is nothing left to observe.
                PIDFD => return Ok(()),
                NOTIFY => notification_ready = true,
                _ => {}
            }
        }
        if !notification_ready {
            continue;
        }

        let mut notif = SeccompNotif::default();
        if let Err(errno) = notif_recv(notify_fd.as_raw_fd(), &mut notif) {
            // ENOENT: the target died between poll and receive.
            if errno == rustix::io::Errno::NOENT {
                return Ok(());
            }
            return Err(std::io::Error::from_raw_os_error(errno.raw_os_error()));
        }

        let syscall_nr: i32 = notif.data.nr;
        // SAFETY: sending a 4-byte integer from a live stack slot.
        let sent = unsafe {
            libc::send(
                socket.as_raw_fd(),
                (&syscall_nr as *const i32).cast(),
                size_of::<i32>(),
                libc::MSG_NOSIGNAL,
            )
        };
        if sent < 0 {
            tracing::error!(
                "failed to relay the exit syscall: {}",
                std::io::Error::last_os_error()
            );
        }

        // The parked syscall resolves when the target dies; this is the
        // kill the policy asked for.
        if let Err(errno) = pidfd::pidfd_send_signal(target_pidfd.as_fd(), libc::SIGKILL) {
            tracing::error!("failed to kill the target through its pidfd: {errno}");
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn closed_socket_ends_watch_without_panic() {
        let (ours, theirs) = scm_rights::socketpair().unwrap();
        let (notify_stub, _other) = scm_rights::socketpair().unwrap();
        drop(theirs);
        // EOF before the pidfd arrives reads as an error, not a hang.
        let err = watch(&ours, &notify_stub).unwrap_err();
        assert_ne!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn target_exit_ends_watch() {
        let (ours, theirs) = scm_rights::socketpair().unwrap();
        let (notify_stub, _other) = scm_rights::socketpair().unwrap();

        // A short-lived child whose pidfd turns readable on exit.
        // SAFETY: the child immediately _exits.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            // SAFETY: forked child.
            unsafe { libc::_exit(0) };
        }
        let child_pidfd = pidfd::pidfd_open(pid).unwrap();
        scm_rights::send_fd(theirs.as_raw_fd(), child_pidfd.as_raw_fd()).unwrap();

        watch(&ours, &notify_stub).unwrap();

        // Reap the child.
        let mut status = 0;
        // SAFETY: status points at a writable int.
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }
}
