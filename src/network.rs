//! The connection and stream contract expected by peer-to-peer networking code.
//!
//! [`MuxedConnection`] and [`LogicalStream`] implement these traits, so code which
//! only needs the contract can be generic over it instead of naming a multiplexer.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::BoxFuture;
use crate::conn::MuxedConnection;
use crate::error::Error;
use crate::mux::{Session, SessionStream};
use crate::stream::LogicalStream;

/// A connection which carries many independent byte streams.
pub trait MuxedConn: Send + Sync {
    /// The streams produced by this connection.
    type Stream: MuxedStream;

    /// Open a stream which the peer's [`accept_stream`](MuxedConn::accept_stream)
    /// observes immediately.
    fn open_stream<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Self::Stream, Error>>;

    /// Wait for the peer to open a stream.
    fn accept_stream(&self) -> BoxFuture<'_, Result<Self::Stream, Error>>;

    /// Returns true once the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Close the connection and all of its streams.
    fn close(&self) -> BoxFuture<'_, Result<(), Error>>;
}

/// A single stream within a [`MuxedConn`].
pub trait MuxedStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Stop reading.
    fn close_read(&self) -> Result<(), Error>;

    /// Stop writing.
    fn close_write(&self) -> Result<(), Error>;

    /// Close both halves of the stream.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// Tell the peer to hang up.
    fn reset(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// Set the read and write deadlines.
    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    /// Set the read deadline.
    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    /// Set the write deadline.
    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;
}

impl<S> MuxedConn for MuxedConnection<S>
where
    S: Session,
{
    type Stream = LogicalStream<S::Stream>;

    fn open_stream<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Self::Stream, Error>> {
        Box::pin(MuxedConnection::open_stream(self, cancel))
    }

    fn accept_stream(&self) -> BoxFuture<'_, Result<Self::Stream, Error>> {
        Box::pin(MuxedConnection::accept_stream(self))
    }

    fn is_closed(&self) -> bool {
        MuxedConnection::is_closed(self)
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(MuxedConnection::close(self))
    }
}

impl<T> MuxedStream for LogicalStream<T>
where
    T: SessionStream,
{
    fn close_read(&self) -> Result<(), Error> {
        LogicalStream::close_read(self)
    }

    fn close_write(&self) -> Result<(), Error> {
        LogicalStream::close_write(self)
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(LogicalStream::close(self))
    }

    fn reset(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(LogicalStream::reset(self))
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        LogicalStream::set_deadline(self, deadline)
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        LogicalStream::set_read_deadline(self, deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        LogicalStream::set_write_deadline(self, deadline)
    }
}
