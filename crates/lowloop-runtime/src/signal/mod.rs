//! Process signal delivery through the wake channel.
//!
//! The only process-wide state in the engine lives here: the write end of
//! the wake pipe, published for the async-signal handler.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    }
}

/// Signals routed to the event loop.
pub const HANDLED_SIGNALS: [i32; 7] = [
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGPIPE,
    libc::SIGWINCH,
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGHUP,
];

/// Name of a handled signal (`"SIGTERM"`), `None` for anything else.
pub fn signal_name(signum: i32) -> Option<&'static str> {
    let name = match signum {
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGTERM => "SIGTERM",
        libc::SIGINT => "SIGINT",
        libc::SIGHUP => "SIGHUP",
        _ => return None,
    };
    Some(name)
}

/// Signals that terminate the process unless the host intercepts them.
#[inline]
pub fn is_terminating(signum: i32) -> bool {
    signum == libc::SIGTERM || signum == libc::SIGINT || signum == libc::SIGHUP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(signal_name(libc::SIGTERM), Some("SIGTERM"));
        assert_eq!(signal_name(libc::SIGKILL), None);
        assert!(is_terminating(libc::SIGHUP));
        assert!(!is_terminating(libc::SIGPIPE));
        for sig in HANDLED_SIGNALS {
            assert!(sig > 0 && sig < 0xFF);
        }
    }
}
