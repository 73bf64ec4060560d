//! Errors returned by multiplexed connections and their streams.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::BoxError;

/// Error returned by connection and stream operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O failure on the raw connection, the session, or a stream.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The multiplexer could not establish a session.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The first bytes of an accepted stream were not the open marker.
    #[error("expected open stream marker {expected:?} but got {observed:?}")]
    ProtocolViolation {
        /// The marker bytes required at the start of every stream.
        expected: Vec<u8>,

        /// The bytes actually read from the stream.
        observed: Vec<u8>,
    },

    /// The caller cancelled the operation before the session was established.
    #[error("operation cancelled")]
    Cancelled,

    /// The stream half was closed locally.
    #[error("stream half closed")]
    Closed,
}

impl Error {
    /// Returns true if this error came from a locally closed stream half.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Returns true if `error` is the I/O rendering of [`Error::Closed`].
    ///
    /// Reads and writes on a [`LogicalStream`](crate::LogicalStream) go through
    /// the tokio io traits, so a closed half surfaces as an [`io::Error`] wrapping
    /// this crate's error.
    pub fn is_closed_io(error: &io::Error) -> bool {
        error.kind() == io::ErrorKind::BrokenPipe
            && error
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<Error>())
                .is_some_and(Error::is_closed)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        let kind = match &error {
            Error::Transport(_) => io::ErrorKind::Other,
            Error::Handshake(_) => io::ErrorKind::ConnectionRefused,
            Error::ProtocolViolation { .. } => io::ErrorKind::InvalidData,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Closed => io::ErrorKind::BrokenPipe,
        };

        match error {
            Error::Transport(error) => error,
            error => io::Error::new(kind, error),
        }
    }
}

/// A failed multiplexer handshake.
///
/// The failure is shared: every waiter on an establishment receives a clone
/// pointing at the same underlying cause.
#[derive(Clone)]
pub struct HandshakeError {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl HandshakeError {
    /// Wrap the cause of a failed handshake.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            inner: Arc::from(error.into()),
        }
    }

    /// The underlying cause.
    pub fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Returns true if both errors are clones of the same failure.
    pub fn same_as(&self, other: &HandshakeError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandshakeError").field(&self.inner).finish()
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "multiplexer handshake failed: {}", self.inner)
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner)
    }
}
