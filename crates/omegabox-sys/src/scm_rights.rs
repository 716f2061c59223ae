//! File-descriptor passing over `AF_UNIX` sockets via `SCM_RIGHTS`.
//!
//! Two cross-process handoffs ride on this: the in-container init sends the
//! target's pidfd out to the observer thread, and the pre-exec child sends
//! the seccomp listener fd up to the supervisor. Both use one-shot
//! socketpairs whose ends are single-owner.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Create an `AF_UNIX SOCK_STREAM` close-on-exec socketpair.
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds points at two writable ints.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success both fds are fresh descriptors owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Send a file descriptor over a unix socket.
pub fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let data = [0u8; 1];
    let iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    // SAFETY: msghdr is a plain C struct; zeroed is a valid initial state.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    // SAFETY: msg_control points at a buffer of CMSG_SPACE bytes.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::other("CMSG_FIRSTHDR null"));
    }
    // SAFETY: cmsg is a valid header within cmsg_buf.
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
        std::ptr::copy_nonoverlapping(
            (&fd as *const RawFd).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            size_of::<RawFd>(),
        );
    }

    // SAFETY: msg and its buffers are alive across the call.
    let ret = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Receive a file descriptor from a unix socket.
///
/// The received fd is close-on-exec. Truncated messages and messages that
/// carry no `SCM_RIGHTS` payload are rejected.
pub fn recv_fd(socket: RawFd) -> io::Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: 1,
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    // SAFETY: as in send_fd.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    // SAFETY: msg and its buffers are alive across the call.
    let ret = unsafe {
        libc::recvmsg(
            socket,
            &mut msg,
            libc::MSG_CMSG_CLOEXEC | libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated SCM_RIGHTS message",
        ));
    }

    // SAFETY: msg_control was filled in by the kernel.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no control message received",
        ));
    }

    // SAFETY: cmsg is a valid header; CMSG_DATA points at at least one fd.
    unsafe {
        if (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            || (*cmsg).cmsg_len != libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected control message",
            ));
        }
        let mut fd: RawFd = -1;
        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            (&mut fd as *mut RawFd).cast::<u8>(),
            size_of::<RawFd>(),
        );
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd};

    use super::*;

    #[test]
    fn socketpair_creation() {
        let (a, b) = socketpair().unwrap();
        assert!(a.as_raw_fd() >= 0);
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn roundtrip_pipe_end() {
        let (tx, rx) = socketpair().unwrap();

        let mut pipe_fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        let read_end = unsafe { std::fs::File::from_raw_fd(pipe_fds[0]) };
        let mut write_end = unsafe { std::fs::File::from_raw_fd(pipe_fds[1]) };

        send_fd(tx.as_raw_fd(), read_end.as_raw_fd()).unwrap();
        let received = recv_fd(rx.as_raw_fd()).unwrap();

        // Writing into the original pipe must be readable through the copy.
        write_end.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        let mut received = std::fs::File::from(received);
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn recv_without_fd_is_rejected() {
        let (tx, rx) = socketpair().unwrap();
        let ret = unsafe { libc::send(tx.as_raw_fd(), b"y".as_ptr().cast(), 1, 0) };
        assert_eq!(ret, 1);
        assert!(recv_fd(rx.as_raw_fd()).is_err());
    }
}
