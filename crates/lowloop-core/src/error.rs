//! Engine error type.
//!
//! Errors raised on the multiplexer or worker threads are never thrown
//! there; they travel by value inside the next completion and surface on the
//! event-loop thread as a `LoopError`.

use std::fmt;
use std::io;

/// Coarse classification used by callers to tell "the OS call failed" from
/// "the peer misbehaved".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// OS-level failure: errno plus the failing operation.
    Resource,
    /// Malformed peer data (HTTP framing, DNS answers, TLS records).
    Protocol,
    /// An allocation or table ran out; reported, never fatal.
    Exhausted,
    /// Startup failure; the engine does not exist.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// errno from `syscall`.
    Os { errno: i32, syscall: &'static str },
    /// TLS layer failure while performing `syscall`.
    Tls { message: String, syscall: &'static str },
    /// Hostname did not resolve.
    NotFound { host: String },
    /// Malformed peer data; `code` is stable, `message` is for humans.
    Protocol { code: &'static str, message: &'static str },
    /// Resource table exhausted.
    Exhausted { what: &'static str },
    /// Engine could not start.
    Fatal(String),
}

impl LoopError {
    #[inline]
    pub fn os(errno: i32, syscall: &'static str) -> Self {
        LoopError::Os { errno, syscall }
    }

    /// errno of the calling thread, tagged with `syscall`.
    #[inline]
    pub fn last_os(syscall: &'static str) -> Self {
        LoopError::Os { errno: last_errno(), syscall }
    }

    pub fn from_io(err: &io::Error, syscall: &'static str) -> Self {
        match err.raw_os_error() {
            Some(errno) => LoopError::Os { errno, syscall },
            None => match err.kind() {
                io::ErrorKind::UnexpectedEof => LoopError::Os { errno: libc::ECONNRESET, syscall },
                io::ErrorKind::WouldBlock => LoopError::Os { errno: libc::EAGAIN, syscall },
                io::ErrorKind::OutOfMemory => LoopError::Exhausted { what: syscall },
                _ => LoopError::Os { errno: libc::EIO, syscall },
            },
        }
    }

    pub fn tls(message: impl Into<String>, syscall: &'static str) -> Self {
        LoopError::Tls { message: message.into(), syscall }
    }

    /// The framing error every HTTP consumer reports.
    pub fn http_parser() -> Self {
        LoopError::Protocol { code: "ERR_HTTP_PARSER", message: "HTTP data not valid" }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LoopError::Os { .. } | LoopError::NotFound { .. } => ErrorKind::Resource,
            LoopError::Tls { .. } | LoopError::Protocol { .. } => ErrorKind::Protocol,
            LoopError::Exhausted { .. } => ErrorKind::Exhausted,
            LoopError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            LoopError::Os { errno, .. } => Some(*errno),
            LoopError::Exhausted { .. } => Some(libc::ENOMEM),
            _ => None,
        }
    }

    pub fn syscall(&self) -> Option<&'static str> {
        match self {
            LoopError::Os { syscall, .. } | LoopError::Tls { syscall, .. } => Some(syscall),
            LoopError::NotFound { .. } => Some("getaddrinfo"),
            _ => None,
        }
    }

    /// Stable string code (`ECONNRESET`, `ERR_HTTP_PARSER`, ...).
    pub fn code(&self) -> String {
        match self {
            LoopError::Os { errno, .. } => errno_name(*errno)
                .map(str::to_string)
                .unwrap_or_else(|| format!("E{}", errno)),
            LoopError::Tls { .. } => "ERR_TLS".to_string(),
            LoopError::NotFound { .. } => "ENOTFOUND".to_string(),
            LoopError::Protocol { code, .. } => code.to_string(),
            LoopError::Exhausted { .. } => "ENOMEM".to_string(),
            LoopError::Fatal(_) => "ERR_ENGINE_START".to_string(),
        }
    }

    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, LoopError::Os { errno, .. } if *errno == libc::EAGAIN || *errno == libc::EWOULDBLOCK || *errno == libc::EINTR)
    }
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Os { errno, syscall } => {
                write!(f, "{} (at {})", io::Error::from_raw_os_error(*errno), syscall)
            }
            LoopError::Tls { message, syscall } => write!(f, "TLS: {} (at {})", message, syscall),
            LoopError::NotFound { host } => write!(f, "host not found: {}", host),
            LoopError::Protocol { code, message } => write!(f, "{} [{}]", message, code),
            LoopError::Exhausted { what } => write!(f, "out of memory: {}", what),
            LoopError::Fatal(msg) => write!(f, "engine startup failed: {}", msg),
        }
    }
}

impl std::error::Error for LoopError {}

impl From<LoopError> for io::Error {
    fn from(err: LoopError) -> Self {
        match err.errno() {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }
}

pub type LoopResult<T> = std::result::Result<T, LoopError>;

/// errno of the calling thread.
#[inline]
pub fn last_errno() -> i32 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            unsafe { *libc::__errno_location() }
        } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
            unsafe { *libc::__error() }
        } else {
            io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
        }
    }
}

/// Symbolic name for the errnos the engine reports most.
pub fn errno_name(errno: i32) -> Option<&'static str> {
    let name = match errno {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EBUSY => "EBUSY",
        libc::EEXIST => "EEXIST",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::ENOSPC => "ENOSPC",
        libc::EPIPE => "EPIPE",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNRESET => "ECONNRESET",
        libc::EISCONN => "EISCONN",
        libc::ENOTCONN => "ENOTCONN",
        libc::EMSGSIZE => "EMSGSIZE",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::EALREADY => "EALREADY",
        libc::EINPROGRESS => "EINPROGRESS",
        libc::ECANCELED => "ECANCELED",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        assert_eq!(LoopError::os(libc::ECONNRESET, "read").kind(), ErrorKind::Resource);
        assert_eq!(LoopError::http_parser().kind(), ErrorKind::Protocol);
        assert_eq!(LoopError::Exhausted { what: "slot" }.kind(), ErrorKind::Exhausted);
        assert_eq!(LoopError::Fatal("x".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_codes() {
        assert_eq!(LoopError::os(libc::ECONNRESET, "read").code(), "ECONNRESET");
        assert_eq!(LoopError::http_parser().code(), "ERR_HTTP_PARSER");
        assert_eq!(LoopError::NotFound { host: "nowhere".into() }.code(), "ENOTFOUND");
        assert_eq!(LoopError::os(4095, "x").code(), "E4095");
    }

    #[test]
    fn test_display_names_syscall() {
        let err = LoopError::os(libc::ENOENT, "open");
        let text = err.to_string();
        assert!(text.ends_with("(at open)"), "{}", text);
        assert_eq!(err.syscall(), Some("open"));
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_from_io_keeps_errno() {
        let io_err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(LoopError::from_io(&io_err, "stat"), LoopError::os(libc::EACCES, "stat"));
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(LoopError::from_io(&eof, "read").errno(), Some(libc::ECONNRESET));
    }

    #[test]
    fn test_would_block() {
        assert!(LoopError::os(libc::EAGAIN, "read").is_would_block());
        assert!(!LoopError::os(libc::EPIPE, "write").is_would_block());
    }
}
