use std::fmt;
use std::io;

/// Errors returned by the reactor.
#[derive(Debug)]
pub enum Error {
    /// A syscall failed (socket, bind, epoll, timerfd, ...).
    Io(io::Error),
    /// An address literal could not be parsed or does not match its protocol.
    InvalidAddress(String),
    /// A write was attempted on a connection that is not in the Connected state.
    NotConnected,
    /// The owning event loop is gone (its thread exited or failed to start).
    LoopGone,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
            Error::NotConnected => write!(f, "connection not open"),
            Error::LoopGone => write!(f, "event loop is gone"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
