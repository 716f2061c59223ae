use std::io;

use rustix::io::Errno;
use thiserror::Error;

/// Error launching or supervising a jail.
#[derive(Debug, Error)]
pub enum JailError {
    #[error("fork: {0}")]
    Fork(Errno),

    #[error("seccomp program: {0}")]
    SeccompProgram(io::Error),

    #[error("seccomp listener handoff: {0}")]
    ListenerHandoff(io::Error),

    #[error("child setup: {0}")]
    ChildSetup(String),

    #[error("wait: {0}")]
    Wait(Errno),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
