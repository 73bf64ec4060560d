//! A multiplexer full of in-memory implementations, suitable for testing connection behavior
//! without a real wire protocol.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Handshake, Session, SessionStream};
use crate::BoxFuture;
use crate::deadline::Deadline;

const MOCK_BUFFER_SIZE: usize = 8 * 1024;

/// The error returned by a failing mock handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("mock handshake error")]
pub struct MockHandshakeError;

enum HandshakeMode {
    Ready(MockSession),
    Error,
    Channel(Option<oneshot::Receiver<Result<MockSession, MockHandshakeError>>>),
}

impl fmt::Debug for HandshakeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeMode::Ready(_) => f.debug_tuple("Ready").finish(),
            HandshakeMode::Error => f.debug_tuple("Error").finish(),
            HandshakeMode::Channel(_) => f.debug_tuple("Channel").finish(),
        }
    }
}

/// A mock multiplexer whose handshake outcome is chosen by the test.
#[derive(Debug)]
pub struct MockMultiplexer {
    mode: HandshakeMode,
    attempts: Arc<AtomicUsize>,
}

impl Clone for MockMultiplexer {
    fn clone(&self) -> Self {
        Self {
            mode: match &self.mode {
                HandshakeMode::Ready(session) => HandshakeMode::Ready(session.clone()),
                HandshakeMode::Error => HandshakeMode::Error,
                HandshakeMode::Channel(_) => HandshakeMode::Error,
            },
            attempts: self.attempts.clone(),
        }
    }
}

impl MockMultiplexer {
    /// Multiplexer which immediately establishes `session`.
    pub fn ready(session: MockSession) -> Self {
        Self::with_mode(HandshakeMode::Ready(session))
    }

    /// Multiplexer whose handshake always fails.
    pub fn error() -> Self {
        Self::with_mode(HandshakeMode::Error)
    }

    /// Multiplexer whose handshake completes with the value sent on the channel.
    ///
    /// Dropping the sender fails the handshake.
    pub fn channel(rx: oneshot::Receiver<Result<MockSession, MockHandshakeError>>) -> Self {
        Self::with_mode(HandshakeMode::Channel(Some(rx)))
    }

    fn with_mode(mode: HandshakeMode) -> Self {
        Self {
            mode,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of handshakes started by this multiplexer and its clones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// A counter shared with this multiplexer, readable after it has been moved.
    pub fn attempt_counter(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }
}

impl<IO> tower::Service<Handshake<IO>> for MockMultiplexer
where
    IO: Send + 'static,
{
    type Response = MockSession;
    type Error = MockHandshakeError;
    type Future = BoxFuture<'static, Result<MockSession, MockHandshakeError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Handshake<IO>) -> Self::Future {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(direction = %req.direction, "mock handshake");

        match &mut self.mode {
            HandshakeMode::Ready(session) => {
                let session = session.clone();
                Box::pin(async move { Ok(session) })
            }
            HandshakeMode::Error => Box::pin(async { Err(MockHandshakeError) }),
            HandshakeMode::Channel(rx) => {
                let rx = rx.take();
                Box::pin(async move {
                    match rx {
                        Some(rx) => rx.await.unwrap_or(Err(MockHandshakeError)),
                        None => Err(MockHandshakeError),
                    }
                })
            }
        }
    }
}

struct MockSessionInner {
    loopback: mpsc::UnboundedSender<MockStream>,
    inbound: Mutex<mpsc::UnboundedReceiver<MockStream>>,
    closed: CancellationToken,
    closes: AtomicUsize,
    fail_close: bool,
}

/// An in-memory session in loopback mode: streams opened on it are accepted by
/// the same session.
#[derive(Clone)]
pub struct MockSession {
    inner: Arc<MockSessionInner>,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("closes", &self.closes())
            .field("fail_close", &self.inner.fail_close)
            .finish()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Create a new loopback session.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Create a session whose `close` always fails.
    pub fn failing_close() -> Self {
        Self::build(true)
    }

    fn build(fail_close: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockSessionInner {
                loopback: tx,
                inbound: Mutex::new(rx),
                closed: CancellationToken::new(),
                closes: AtomicUsize::new(0),
                fail_close,
            }),
        }
    }

    /// Number of times `close` has been called.
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Returns true if both handles refer to the same session.
    pub fn same_as(&self, other: &MockSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Session for MockSession {
    type Stream = MockStream;

    fn open_stream(&self) -> BoxFuture<'_, io::Result<Self::Stream>> {
        Box::pin(async move {
            if self.inner.closed.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock session closed"));
            }

            let (local, remote) = tokio::io::duplex(MOCK_BUFFER_SIZE);
            self.inner
                .loopback
                .send(MockStream::new(remote))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock session closed"))?;
            Ok(MockStream::new(local))
        })
    }

    fn accept_stream(&self) -> BoxFuture<'_, io::Result<Self::Stream>> {
        Box::pin(async move {
            let mut inbound = self.inner.inbound.lock().await;
            tokio::select! {
                stream = inbound.recv() => stream.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "mock session closed")
                }),
                _ = self.inner.closed.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock session closed"))
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.closed.cancel();
            if self.inner.fail_close {
                Err(io::Error::other("mock close error"))
            } else {
                Ok(())
            }
        })
    }
}

/// One end of an in-memory stream.
#[pin_project::pin_project]
#[derive(Debug)]
pub struct MockStream {
    #[pin]
    inner: DuplexStream,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl MockStream {
    fn new(inner: DuplexStream) -> Self {
        Self {
            inner,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }

    /// The current read deadline.
    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.get()
    }

    /// The current write deadline.
    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.get()
    }
}

impl SessionStream for MockStream {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.read_deadline.set(deadline);
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.write_deadline.set(deadline);
        Ok(())
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.read_deadline.poll_check(cx)?;
        this.inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        this.write_deadline.poll_check(cx)?;
        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use crate::mux::{Direction, Multiplexer};

    assert_impl_all!(MockMultiplexer: Multiplexer<()>, Clone, Send);
    assert_impl_all!(MockSession: Session, Clone, Send, Sync);
    assert_impl_all!(MockStream: SessionStream, Send);
    assert_impl_all!(MockHandshakeError: std::error::Error, Send, Sync);

    #[tokio::test]
    async fn ready_multiplexer_returns_session() {
        let session = MockSession::new();
        let mut mux = MockMultiplexer::ready(session.clone());

        let established = mux.establish((), Direction::Outbound).await.unwrap();
        assert!(established.same_as(&session));
        assert_eq!(mux.attempts(), 1);
    }

    #[tokio::test]
    async fn error_multiplexer_fails() {
        let mut mux = MockMultiplexer::error();
        let result = mux.establish((), Direction::Inbound).await;
        assert_eq!(result.unwrap_err(), MockHandshakeError);
    }

    #[tokio::test]
    async fn channel_multiplexer_waits_for_sender() {
        let (tx, rx) = oneshot::channel();
        let mut mux = MockMultiplexer::channel(rx);
        let future = mux.establish((), Direction::Outbound);

        let session = MockSession::new();
        tx.send(Ok(session.clone())).unwrap();
        assert!(future.await.unwrap().same_as(&session));

        // The channel is single use.
        assert!(mux.establish((), Direction::Outbound).await.is_err());
        assert_eq!(mux.attempts(), 2);
    }

    #[tokio::test]
    async fn dropped_channel_fails_handshake() {
        let (tx, rx) = oneshot::channel();
        let mut mux = MockMultiplexer::channel(rx);
        drop(tx);
        assert!(mux.establish((), Direction::Outbound).await.is_err());
    }

    #[tokio::test]
    async fn loopback_streams() {
        let session = MockSession::new();
        let mut opened = session.open_stream().await.unwrap();
        let mut accepted = session.accept_stream().await.unwrap();

        opened.write_all(b"loop").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"loop");
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let session = MockSession::new();
        let accepting = session.clone();
        let accept = tokio::spawn(async move { accepting.accept_stream().await });

        session.close().await.unwrap();
        assert!(accept.await.unwrap().is_err());
        assert_eq!(session.closes(), 1);
        assert!(session.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn failing_close() {
        let session = MockSession::failing_close();
        assert!(session.close().await.is_err());
        assert_eq!(session.closes(), 1);
    }

    #[test]
    fn clone_of_channel_mode_fails() {
        let (_tx, rx) = oneshot::channel();
        let mux = MockMultiplexer::channel(rx);
        let clone = mux.clone();
        assert!(format!("{clone:?}").contains("Error"));
    }
}
