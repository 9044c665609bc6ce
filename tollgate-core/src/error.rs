use std::io;

use thiserror::Error;

/// A specialized `Result` type for tollgate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type of the proxy core.
///
/// Errors stay local to the connection that produced them; the state
/// machine decides whether an error closes the connection or is reported
/// to the peer as an ERR packet.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("error communicating with peer: {0}")]
    Io(#[from] io::Error),

    /// A decoder hit an impossible tag or ran past the end of the packet.
    #[error("malformed packet: {0}")]
    Protocol(String),

    #[error("error in configuration: {0}")]
    Configuration(String),

    /// The backend address is already registered (after canonicalization).
    #[error("backend {0} is already registered")]
    DuplicateBackend(String),

    /// The peer disappeared mid-conversation.
    #[error("connection closed by peer")]
    PeerClosed,

    /// A wait on the peer outlived the phase timeout.
    #[error("timed out waiting for the peer")]
    Timeout,

    /// The process is shutting down; drain and close.
    #[error("proxy is shutting down")]
    Shutdown,
}

impl Error {
    /// `true` when the error came from the kernel reporting a gone peer
    /// rather than from a protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::PeerClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

macro_rules! err_protocol {
    ($($args:tt)*) => {
        $crate::error::Error::Protocol(format!($($args)*))
    };
}
