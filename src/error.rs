//! Error taxonomy for the client streaming protocol

use crate::protocol::{code, domain};
use std::io;

/// An error decoded from an ERROR reply (or an ERROR control frame).
///
/// The same numeric code means different things in different domains, so the
/// domain always travels with it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub domain: String,
    pub code: u32,
    pub message: String,
}

impl RemoteError {
    pub fn new(domain: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an error in the generic I/O domain
    pub fn io(code: u32, message: impl Into<String>) -> Self {
        Self::new(domain::IO, code, message)
    }

    pub fn cancelled() -> Self {
        Self::io(code::CANCELLED, "Operation was cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.domain == domain::IO && self.code == code::CANCELLED
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The caller's cancellable fired before the operation committed.
    #[error("Operation was cancelled")]
    Cancelled,
    /// The peer answered with an ERROR reply.
    #[error(transparent)]
    Remote(RemoteError),
    /// The underlying socket failed. The connection is unusable afterwards.
    #[error("Error in stream protocol: {0}")]
    Io(#[source] io::Error),
    /// The peer sent something that cannot occur in this state.
    #[error("Error in stream protocol: {0}")]
    Framing(String),
    #[error("Seek not supported on stream")]
    NotSupported,
    #[error("Stream is already closed")]
    Closed,
}

impl StreamError {
    /// Map a decoded ERROR reply, turning the server's cancel acknowledgement
    /// back into [`StreamError::Cancelled`].
    pub fn from_remote(err: RemoteError) -> Self {
        if err.is_cancelled() {
            StreamError::Cancelled
        } else {
            StreamError::Remote(err)
        }
    }

    /// Errors after which the framing state of the connection is unknown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Io(_) | StreamError::Framing(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        StreamError::Io(e)
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(inner) => inner,
            StreamError::NotSupported => io::Error::new(io::ErrorKind::Unsupported, e),
            StreamError::Framing(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            StreamError::Remote(ref r) if r.domain == domain::IO => {
                let kind = match r.code {
                    code::NOT_FOUND => io::ErrorKind::NotFound,
                    code::PERMISSION_DENIED => io::ErrorKind::PermissionDenied,
                    code::INVALID_ARGUMENT => io::ErrorKind::InvalidInput,
                    code::NOT_SUPPORTED => io::ErrorKind::Unsupported,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, e)
            }
            other => io::Error::other(other),
        }
    }
}
