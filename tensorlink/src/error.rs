//! Error types shared by all tensorlink crates.

use std::io;

use nix::errno::Errno;

/// Errors surfaced by channels, connections and contexts.
///
/// The first error observed on an object is sticky: once a channel or
/// context has recorded one, every pending and subsequent operation
/// completes with that same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The channel was closed, either explicitly or by its owning context.
    ChannelClosed,
    /// The underlying transport connection was closed.
    ConnectionClosed,
    /// The peer shut down its end of the connection.
    Eof,
    /// A read transferred fewer bytes than requested.
    ShortRead { expected: usize, got: usize },
    /// A write transferred fewer bytes than requested.
    ShortWrite { expected: usize, got: usize },
    /// A system call failed.
    System { subsystem: &'static str, errno: i32 },
    /// The peer violated the channel protocol.
    Protocol(String),
}

impl Error {
    /// Wraps a failed system call in the named subsystem.
    pub fn system(subsystem: &'static str, errno: Errno) -> Self {
        Error::System {
            subsystem,
            errno: errno as i32,
        }
    }

    /// Wraps an `io::Error` in the named subsystem.
    ///
    /// Errors with no OS error code (e.g. invalid input) map to errno 0.
    pub fn system_io(subsystem: &'static str, err: &io::Error) -> Self {
        Error::System {
            subsystem,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ChannelClosed => write!(f, "channel closed"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Eof => write!(f, "end of file"),
            Error::ShortRead { expected, got } => {
                write!(f, "short read: expected {} bytes, got {}", expected, got)
            }
            Error::ShortWrite { expected, got } => {
                write!(f, "short write: expected {} bytes, got {}", expected, got)
            }
            Error::System { subsystem, errno } => {
                write!(f, "{} error: {}", subsystem, Errno::from_raw(*errno).desc())
            }
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for tensorlink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::ShortRead {
            expected: 4096,
            got: 3072,
        };
        assert_eq!(err.to_string(), "short read: expected 4096 bytes, got 3072");
        let err = Error::ShortWrite {
            expected: 128,
            got: 64,
        };
        assert_eq!(err.to_string(), "short write: expected 128 bytes, got 64");
        assert_eq!(Error::ChannelClosed.to_string(), "channel closed");
    }

    #[test]
    fn test_system_from_errno() {
        let err = Error::system("cma", Errno::EPERM);
        assert_eq!(
            err,
            Error::System {
                subsystem: "cma",
                errno: Errno::EPERM as i32
            }
        );
    }

    #[test]
    fn test_equality() {
        assert_eq!(Error::ChannelClosed, Error::ChannelClosed);
        assert_ne!(Error::ChannelClosed, Error::ConnectionClosed);
        assert_ne!(
            Error::ShortRead {
                expected: 8,
                got: 4
            },
            Error::ShortRead {
                expected: 8,
                got: 5
            }
        );
    }
}
