//! Logical streams handed to consumers of a [`MuxedConnection`](crate::MuxedConnection).
//!
//! The multiplexer's streams have no independent read/write half-close, so
//! [`LogicalStream`] tracks each half locally. Closing a half is bookkeeping only:
//! the peer is not told. A full [`close`](LogicalStream::close) additionally closes
//! the underlying stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::time::Instant;

use crate::error::Error;
use crate::mux::SessionStream;

#[derive(Debug, Default)]
struct Flags {
    read: AtomicBool,
    write: AtomicBool,
}

/// A handle to the half-close flags of a [`LogicalStream`].
///
/// Lets another task close a half while the stream itself is busy in a read or write.
/// Flags are monotonic: once closed, a half never reopens.
#[derive(Debug, Clone, Default)]
pub struct HalfClose {
    flags: Arc<Flags>,
}

impl HalfClose {
    /// Mark the read half closed.
    pub fn close_read(&self) {
        self.flags.read.store(true, Ordering::Release);
    }

    /// Mark the write half closed.
    pub fn close_write(&self) {
        self.flags.write.store(true, Ordering::Release);
    }

    /// Returns true once the read half has been closed.
    pub fn is_read_closed(&self) -> bool {
        self.flags.read.load(Ordering::Acquire)
    }

    /// Returns true once the write half has been closed.
    pub fn is_write_closed(&self) -> bool {
        self.flags.write.load(Ordering::Acquire)
    }
}

/// A multiplexed stream which has completed the open handshake.
///
/// Reads and writes go through the tokio io traits. Once a half is closed, calls
/// on that half fail with an [`io::Error`] of kind [`io::ErrorKind::BrokenPipe`]
/// wrapping [`Error::Closed`].
#[pin_project]
#[derive(Debug)]
pub struct LogicalStream<T> {
    #[pin]
    inner: T,
    half_close: HalfClose,
}

impl<T> LogicalStream<T>
where
    T: SessionStream,
{
    pub(crate) fn new(inner: T) -> Self {
        Self {
            inner,
            half_close: HalfClose::default(),
        }
    }

    /// Stop reading. Local only; the peer is not notified.
    pub fn close_read(&self) -> Result<(), Error> {
        self.half_close.close_read();
        Ok(())
    }

    /// Stop writing. Local only; the peer is not notified.
    pub fn close_write(&self) -> Result<(), Error> {
        self.half_close.close_write();
        Ok(())
    }

    /// Close both halves and the underlying stream.
    pub async fn close(&mut self) -> io::Result<()> {
        self.half_close.close_read();
        self.half_close.close_write();
        self.inner.shutdown().await
    }

    /// Tell the peer to hang up. There is no abrupt reset, so this is [`close`](Self::close).
    pub async fn reset(&mut self) -> io::Result<()> {
        self.close().await
    }

    /// Set the read and write deadlines on the underlying stream.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_deadline(deadline)
    }

    /// Set the read deadline on the underlying stream.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    /// Set the write deadline on the underlying stream.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_write_deadline(deadline)
    }
}

impl<T> LogicalStream<T> {
    /// Returns true once the read half has been closed.
    pub fn is_read_closed(&self) -> bool {
        self.half_close.is_read_closed()
    }

    /// Returns true once the write half has been closed.
    pub fn is_write_closed(&self) -> bool {
        self.half_close.is_write_closed()
    }

    /// A handle which shares this stream's half-close flags.
    pub fn half_close_handle(&self) -> HalfClose {
        self.half_close.clone()
    }

    /// The underlying multiplexed stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwrap the underlying multiplexed stream, discarding the half-close flags.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn closed() -> io::Error {
    Error::Closed.into()
}

impl<T> AsyncRead for LogicalStream<T>
where
    T: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.half_close.is_read_closed() {
            return Poll::Ready(Err(closed()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for LogicalStream<T>
where
    T: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if this.half_close.is_write_closed() {
            return Poll::Ready(Err(closed()));
        }
        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        this.half_close.close_write();
        this.inner.poll_shutdown(cx)
    }
}
