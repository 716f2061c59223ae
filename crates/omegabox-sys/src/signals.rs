//! Signal-number-to-name table for verdict reporting.

/// Name of a standard Linux signal, or `None` for realtime/unknown numbers.
pub fn signal_name(sig: libc::c_int) -> Option<&'static str> {
    macro_rules! table {
        ($($name:ident),* $(,)?) => {
            match sig {
                $(libc::$name => Some(stringify!($name)),)*
                _ => None,
            }
        };
    }
    table!(
        SIGHUP, SIGINT, SIGQUIT, SIGILL, SIGTRAP, SIGABRT, SIGBUS, SIGFPE, SIGKILL, SIGUSR1,
        SIGSEGV, SIGUSR2, SIGPIPE, SIGALRM, SIGTERM, SIGSTKFLT, SIGCHLD, SIGCONT, SIGSTOP,
        SIGTSTP, SIGTTIN, SIGTTOU, SIGURG, SIGXCPU, SIGXFSZ, SIGVTALRM, SIGPROF, SIGWINCH, SIGIO,
        SIGPWR, SIGSYS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signals() {
        assert_eq!(signal_name(libc::SIGKILL), Some("SIGKILL"));
        assert_eq!(signal_name(libc::SIGXCPU), Some("SIGXCPU"));
        assert_eq!(signal_name(libc::SIGXFSZ), Some("SIGXFSZ"));
        assert_eq!(signal_name(libc::SIGSYS), Some("SIGSYS"));
    }

    #[test]
    fn unknown_signals() {
        assert_eq!(signal_name(0), None);
        assert_eq!(signal_name(64), None);
    }
}
