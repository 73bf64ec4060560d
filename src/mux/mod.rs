//! The seam between connections and the multiplexing engine underneath them.
//!
//! A multiplexer is modelled the same way a protocol handshake is modelled elsewhere
//! in the tower ecosystem: it is a [`Service`] which accepts a raw duplex [`Handshake`]
//! and resolves to an established [`Session`]. Sessions hand out [`SessionStream`]s,
//! which are plain tokio byte streams that can additionally carry deadlines.
//!
//! The default engine is [`yamux`], which opens streams lazily: the peer does not
//! learn about a new stream until the first frame is written to it.

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod yamux;

use std::fmt;
use std::io;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tower::Service;

use crate::{BoxError, BoxFuture};

/// Which side of the raw connection this end plays in the session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// This end dialed the connection (client mode).
    Outbound,

    /// This end accepted the connection (server mode).
    Inbound,
}

impl Direction {
    /// Convert an `outbound` flag into a direction.
    pub fn from_outbound(outbound: bool) -> Self {
        if outbound {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// Returns true for [`Direction::Outbound`].
    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// The request handed to a [`Multiplexer`]: a connected duplex pipe, and the
/// role this end plays on it.
#[derive(Debug)]
pub struct Handshake<IO> {
    /// The raw, already connected transport.
    pub io: IO,

    /// Dial or accept.
    pub direction: Direction,
}

impl<IO> Handshake<IO> {
    /// Create a new handshake request.
    pub fn new(io: IO, direction: Direction) -> Self {
        Self { io, direction }
    }
}

/// An established multiplexed session.
pub trait Session: Send + Sync + 'static {
    /// The logical streams carried by this session.
    type Stream: SessionStream;

    /// Create a new outbound stream.
    ///
    /// The peer is not required to learn about the stream until data is written to it.
    fn open_stream(&self) -> BoxFuture<'_, io::Result<Self::Stream>>;

    /// Wait for the peer to open a stream.
    fn accept_stream(&self) -> BoxFuture<'_, io::Result<Self::Stream>>;

    /// Close the session and every stream on it.
    fn close(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// A single logical stream within a [`Session`].
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Fail reads which are still pending after `deadline`. `None` clears it.
    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    /// Fail writes which are still pending after `deadline`. `None` clears it.
    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    /// Set both the read and the write deadline.
    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }
}

/// A multiplexing engine, which turns a raw duplex pipe into a [`Session`].
///
/// This is implemented for every [`Service`] from [`Handshake<IO>`] to a session,
/// so an engine only has to provide the service.
pub trait Multiplexer<IO>
where
    Self: Service<Handshake<IO>, Response = Self::Session>,
{
    /// The session produced by a successful handshake.
    type Session: Session;

    /// Error returned when the handshake fails.
    type Error: Into<BoxError>;

    /// The handshake future.
    type Future: Future<Output = Result<Self::Session, <Self as Multiplexer<IO>>::Error>>
        + Send
        + 'static;

    /// Dial or accept a session on `io`.
    fn establish(&mut self, io: IO, direction: Direction) -> <Self as Multiplexer<IO>>::Future;

    /// Poll the multiplexer to see if it is ready to start a handshake.
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Multiplexer<IO>>::Error>>;
}

impl<T, S, IO> Multiplexer<IO> for T
where
    T: Service<Handshake<IO>, Response = S> + Send + 'static,
    T::Error: Into<BoxError>,
    T::Future: Send + 'static,
    S: Session,
{
    type Session = S;
    type Error = T::Error;
    type Future = T::Future;

    fn establish(&mut self, io: IO, direction: Direction) -> <Self as Multiplexer<IO>>::Future {
        self.call(Handshake::new(io, direction))
    }

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Multiplexer<IO>>::Error>> {
        Service::poll_ready(self, cx)
    }
}
