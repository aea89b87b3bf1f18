//! Error taxonomy: system status codes, argument errors, and state errors.
//!
//! Native operations report failure through negative status codes; the public
//! layer projects those into [`Errno`], which carries the canonical short
//! symbol (`"ENOENT"`) plus a human message. Argument and state violations
//! are separate variants so callers can match on the class, mirroring the
//! split between returned errors and raised errors in the host convention.

use std::fmt;
use std::io;

macro_rules! errno_map {
    ($($name:ident => $msg:expr,)*) => {
        impl Errno {
            $(pub const $name: Errno = Errno(-libc::$name);)*

            /// Canonical short symbol for the code.
            pub fn name(self) -> &'static str {
                match -self.0 {
                    $(libc::$name => stringify!($name),)*
                    _ => match self {
                        Errno::EOF => "EOF",
                        _ => "UNKNOWN",
                    },
                }
            }

            /// Human readable message for the code.
            pub fn message(self) -> &'static str {
                match -self.0 {
                    $(libc::$name => $msg,)*
                    _ => match self {
                        Errno::EOF => "end of file",
                        _ => "unknown error",
                    },
                }
            }
        }
    };
}

/// A failed native operation, stored as the negated `errno` value.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Errno(i32);

// The codes the runtime itself generates or documents; anything else still
// round-trips through `from_raw` and prints as UNKNOWN.
errno_map! {
    EACCES => "permission denied",
    EADDRINUSE => "address already in use",
    EALREADY => "connection already in progress",
    EADDRNOTAVAIL => "address not available",
    EAGAIN => "resource temporarily unavailable",
    EBADF => "bad file descriptor",
    EBUSY => "resource busy or locked",
    ECANCELED => "operation canceled",
    ECONNABORTED => "software caused connection abort",
    ECONNREFUSED => "connection refused",
    ECONNRESET => "connection reset by peer",
    EDESTADDRREQ => "destination address required",
    EEXIST => "file already exists",
    EFAULT => "bad address in system call argument",
    EFBIG => "file too large",
    EINTR => "interrupted system call",
    EINVAL => "invalid argument",
    EIO => "i/o error",
    EISCONN => "socket is already connected",
    EISDIR => "illegal operation on a directory",
    ELOOP => "too many symbolic links encountered",
    EMFILE => "too many open files",
    EMSGSIZE => "message too long",
    ENAMETOOLONG => "name too long",
    ENFILE => "file table overflow",
    ENOBUFS => "no buffer space available",
    ENODEV => "no such device",
    ENOENT => "no such file or directory",
    ENOMEM => "not enough memory",
    ENOSPC => "no space left on device",
    ENOSYS => "function not implemented",
    ENOTCONN => "socket is not connected",
    ENOTDIR => "not a directory",
    ENOTEMPTY => "directory not empty",
    ENOTSOCK => "socket operation on non-socket",
    ENOTTY => "inappropriate ioctl for device",
    ENXIO => "no such device or address",
    EPERM => "operation not permitted",
    EPIPE => "broken pipe",
    EPROTO => "protocol error",
    ERANGE => "result too large",
    EROFS => "read-only file system",
    ESHUTDOWN => "cannot send after transport endpoint shutdown",
    ESPIPE => "invalid seek",
    ESRCH => "no such process",
    ETIMEDOUT => "connection timed out",
    EXDEV => "cross-device link not permitted",
}

impl Errno {
    /// End of file. Not an OS errno; lives outside the errno range the way
    /// the native loop reserves private codes.
    pub const EOF: Errno = Errno(-4095);

    pub(crate) fn from_raw(errno: i32) -> Errno {
        debug_assert!(errno > 0, "raw errno must be positive");
        Errno(-errno)
    }

    pub(crate) fn from_io(err: &io::Error) -> Errno {
        match err.raw_os_error() {
            Some(errno) => Errno::from_raw(errno),
            None => match err.kind() {
                io::ErrorKind::InvalidInput => Errno::EINVAL,
                io::ErrorKind::WouldBlock => Errno::EAGAIN,
                io::ErrorKind::UnexpectedEof => Errno::EOF,
                _ => Errno(-4094),
            },
        }
    }

    /// The negative status code, as carried between the engines.
    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_would_block(self) -> bool {
        self == Errno::EAGAIN || self.0 == -libc::EWOULDBLOCK
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: {}", self.name(), self.message())
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Errno({})", self.name())
    }
}

/// Any failure surfaced by the runtime.
#[derive(Debug)]
pub enum Error {
    /// A native operation failed; holds the projected status.
    Sys(Errno),
    /// An argument failed validation; slot number and expected shape.
    Arg { index: u8, expected: &'static str },
    /// The operation is invalid in the current handle or loop state.
    State(&'static str),
}

impl Error {
    pub(crate) fn sys(err: io::Error) -> Error {
        Error::Sys(Errno::from_io(&err))
    }

    pub(crate) fn arg(index: u8, expected: &'static str) -> Error {
        Error::Arg { index, expected }
    }

    /// The errno, when this is a system error.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Sys(errno) => Some(*errno),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Sys(errno) => errno.fmt(fmt),
            Error::Arg { index, expected } => {
                write!(fmt, "bad argument #{} (expected {})", index, expected)
            }
            Error::State(msg) => fmt.write_str(msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::Sys(errno)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::sys(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_messages() {
        assert_eq!(Errno::ENOENT.name(), "ENOENT");
        assert_eq!(Errno::ENOENT.to_string(), "ENOENT: no such file or directory");
        assert_eq!(Errno::EOF.name(), "EOF");
        assert_eq!(Errno::from_raw(libc::EMFILE), Errno::EMFILE);
    }

    #[test]
    fn io_projection() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(Errno::from_io(&err), Errno::ECONNRESET);
        assert!(Errno::from_io(&io::ErrorKind::WouldBlock.into()).is_would_block());
    }
}
