//! Multiplexed connections with eager stream opening.
//!
//! A lazy-open multiplexer only tells the peer about a new stream once data is
//! written to it. Consumers of a [`MuxedConnection`] expect the peer's
//! [`accept_stream`](MuxedConnection::accept_stream) to return as soon as
//! [`open_stream`](MuxedConnection::open_stream) does, so every stream starts with a
//! single reserved byte, [`OPEN_STREAM_MARKER`]. The opener writes it immediately,
//! and the accepter consumes and checks it before handing the stream out.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::establish::{self, Establishment};
use crate::mux::yamux::{Yamux, YamuxSession};
use crate::mux::{Direction, Multiplexer, Session};
use crate::stream::LogicalStream;

/// The byte written at the start of every stream to force the peer to see it.
pub const OPEN_STREAM_MARKER: u8 = 0x2A;

struct Inner<S> {
    establishment: Establishment<S>,
    closed: AtomicBool,
}

/// A duplex stream factory over a multiplexed session.
///
/// The handle is cheap to clone, and every clone shares the same session and
/// closed state.
pub struct MuxedConnection<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for MuxedConnection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for MuxedConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxedConnection")
            .field("establishment", &self.inner.establishment)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl MuxedConnection<YamuxSession> {
    /// Start a yamux session over `io` and return without waiting for it.
    ///
    /// `outbound` selects the dialing (client) role. Must be called from within a
    /// tokio runtime.
    pub fn new<IO>(io: IO, outbound: bool) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_multiplexer(Yamux::default(), io, outbound)
    }
}

impl<S> MuxedConnection<S>
where
    S: Session,
{
    /// Start a session using `multiplexer` and return without waiting for it.
    pub fn with_multiplexer<M, IO>(multiplexer: M, io: IO, outbound: bool) -> Self
    where
        M: Multiplexer<IO, Session = S> + Send + 'static,
        IO: Send + 'static,
    {
        let direction = Direction::from_outbound(outbound);
        Self::from_establishment(Establishment::start(multiplexer, io, direction))
    }

    /// Establish a session using `multiplexer`, returning once the handshake has finished.
    pub async fn establish<M, IO>(multiplexer: M, io: IO, outbound: bool) -> Result<Self, Error>
    where
        M: Multiplexer<IO, Session = S>,
    {
        let session =
            establish::establish(multiplexer, io, Direction::from_outbound(outbound)).await?;
        Ok(Self::from_session(session))
    }

    /// Wrap a session which was established elsewhere.
    pub fn from_session(session: S) -> Self {
        Self::from_establishment(Establishment::ready(session))
    }

    fn from_establishment(establishment: Establishment<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                establishment,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The establishment slot backing this connection.
    pub fn establishment(&self) -> &Establishment<S> {
        &self.inner.establishment
    }

    /// Wait for the session, or for `cancel` to fire.
    ///
    /// Cancelling does not affect the establishment; a later call still sees the
    /// real outcome. A failed establishment is returned on every call.
    pub async fn wait_established(&self, cancel: &CancellationToken) -> Result<Arc<S>, Error> {
        tokio::select! {
            biased;

            outcome = self.inner.establishment.wait() => outcome.map_err(Error::from),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Open a new stream, which the peer can accept immediately.
    ///
    /// `cancel` only applies while waiting for the session. Once the stream has been
    /// created, the open runs to completion.
    pub async fn open_stream(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LogicalStream<S::Stream>, Error> {
        let session = self.wait_established(cancel).await?;
        let mut stream = session.open_stream().await?;

        stream.write_all(&[OPEN_STREAM_MARKER]).await?;
        stream.flush().await?;
        trace!("sent open stream marker");

        Ok(LogicalStream::new(stream))
    }

    /// Wait for the peer to open a stream.
    ///
    /// There is no cancellation: close the connection (or the raw transport) to
    /// unblock a pending accept.
    pub async fn accept_stream(&self) -> Result<LogicalStream<S::Stream>, Error> {
        let session = self.inner.establishment.wait().await?;
        let mut stream = session.accept_stream().await?;

        read_open_marker(&mut stream).await?;
        trace!("received open stream marker");

        Ok(LogicalStream::new(stream))
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the session.
    ///
    /// Waits for establishment to finish first. A connection which never
    /// established has nothing to release, so that case returns `Ok`. The
    /// connection is marked closed however this returns, including when the
    /// future is dropped part way through.
    pub async fn close(&self) -> Result<(), Error> {
        let _closed = MarkClosed(&self.inner.closed);

        match self.inner.establishment.wait().await {
            Ok(session) => {
                session.close().await?;
                debug!("session closed");
                Ok(())
            }
            Err(error) => {
                debug!(%error, "closing a connection which never established");
                Ok(())
            }
        }
    }
}

struct MarkClosed<'a>(&'a AtomicBool);

impl Drop for MarkClosed<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Consume the open marker from the start of an accepted stream.
///
/// The marker is read into a one-byte buffer, so any application bytes sent right
/// behind it stay in the stream. A read which returns no bytes is the end of the
/// stream, since the io traits report "nothing yet" as pending.
async fn read_open_marker<T>(stream: &mut T) -> Result<(), Error>
where
    T: AsyncRead + Unpin,
{
    let mut marker = [0u8; 1];
    let n = stream.read(&mut marker).await?;

    if n == 0 {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended before the open stream marker",
        )));
    }

    if marker[0] != OPEN_STREAM_MARKER {
        warn!(observed = marker[0], "unexpected open stream marker");
        return Err(Error::ProtocolViolation {
            expected: vec![OPEN_STREAM_MARKER],
            observed: marker.to_vec(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use static_assertions::assert_impl_all;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::sync::oneshot;

    use crate::mux::mock::{MockHandshakeError, MockMultiplexer, MockSession, MockStream};

    assert_impl_all!(MuxedConnection<MockSession>: Clone, Send, Sync);
    assert_impl_all!(MuxedConnection<YamuxSession>: Clone, Send, Sync);

    fn pending() -> (
        oneshot::Sender<Result<MockSession, MockHandshakeError>>,
        MuxedConnection<MockSession>,
    ) {
        let (tx, rx) = oneshot::channel();
        let conn = MuxedConnection::with_multiplexer(MockMultiplexer::channel(rx), (), true);
        (tx, conn)
    }

    #[tokio::test]
    async fn open_then_accept_over_loopback() {
        crate::fixtures::subscribe();
        let conn = MuxedConnection::from_session(MockSession::new());
        let cancel = CancellationToken::new();

        let mut opened = conn.open_stream(&cancel).await.unwrap();
        let mut accepted = conn.accept_stream().await.unwrap();

        opened.write_all(b"payload").await.unwrap();
        let mut buf = [0u8; 7];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn accept_rejects_wrong_marker() {
        let session = MockSession::new();
        let conn = MuxedConnection::from_session(session.clone());

        let mut raw = session.open_stream().await.unwrap();
        raw.write_all(&[0x01]).await.unwrap();

        let error = tokio::time::timeout(Duration::from_secs(5), conn.accept_stream())
            .await
            .expect("accept must not hang")
            .unwrap_err();
        match error {
            Error::ProtocolViolation { expected, observed } => {
                assert_eq!(expected, vec![OPEN_STREAM_MARKER]);
                assert_eq!(observed, vec![0x01]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn accept_fails_on_eof_before_marker() {
        let session = MockSession::new();
        let conn = MuxedConnection::from_session(session.clone());

        let mut raw = session.open_stream().await.unwrap();
        raw.shutdown().await.unwrap();

        let error = conn.accept_stream().await.unwrap_err();
        match error {
            Error::Transport(error) => assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn marker_split_from_trailing_payload() {
        let session = MockSession::new();
        let conn = MuxedConnection::from_session(session.clone());

        let mut raw = session.open_stream().await.unwrap();
        raw.write_all(&[OPEN_STREAM_MARKER, b'h', b'i']).await.unwrap();

        let mut accepted = conn.accept_stream().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn read_open_marker_accepts_marker() {
        let (mut writer, mut reader) = tokio::io::duplex(16);
        writer.write_all(&[OPEN_STREAM_MARKER]).await.unwrap();
        read_open_marker(&mut reader).await.unwrap();
    }

    #[tokio::test]
    async fn wait_established_cancellation_keeps_outcome() {
        let (tx, conn) = pending();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = conn.wait_established(&cancel).await.unwrap_err();
        assert!(matches!(error, Error::Cancelled));

        let session = MockSession::new();
        tx.send(Ok(session.clone())).unwrap();

        let established = conn
            .wait_established(&CancellationToken::new())
            .await
            .unwrap();
        assert!(established.same_as(&session));
    }

    #[tokio::test]
    async fn open_stream_cancelled_while_establishing() {
        let (_tx, conn) = pending();
        let cancel = CancellationToken::new();

        let open = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.open_stream(&cancel).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), open)
            .await
            .expect("cancellation must unblock open_stream")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn concurrent_waiters_see_identical_failure() {
        let (tx, conn) = pending();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.wait_established(&CancellationToken::new()).await
                })
            })
            .collect();

        tx.send(Err(MockHandshakeError)).unwrap();

        let mut failures = Vec::new();
        for waiter in waiters {
            match waiter.await.unwrap() {
                Err(Error::Handshake(error)) => failures.push(error),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        for failure in &failures {
            assert!(failure.same_as(&failures[0]));
        }
    }

    #[tokio::test]
    async fn establishment_failure_is_sticky() {
        let conn: MuxedConnection<MockSession> =
            MuxedConnection::with_multiplexer(MockMultiplexer::error(), (), false);
        let cancel = CancellationToken::new();

        assert!(matches!(
            conn.open_stream(&cancel).await,
            Err(Error::Handshake(_))
        ));
        assert!(matches!(conn.accept_stream().await, Err(Error::Handshake(_))));
        assert!(matches!(
            conn.wait_established(&cancel).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn close_during_establishment_does_not_deadlock() {
        let (tx, conn) = pending();

        let close = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!conn.is_closed());

        let session = MockSession::new();
        tx.send(Ok(session.clone())).unwrap();

        tokio::time::timeout(Duration::from_secs(5), close)
            .await
            .expect("close must finish")
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert_eq!(session.closes(), 1);
    }

    #[tokio::test]
    async fn close_after_failed_establishment_is_ok() {
        let conn: MuxedConnection<MockSession> =
            MuxedConnection::with_multiplexer(MockMultiplexer::error(), (), true);

        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn close_propagates_session_error_and_still_marks_closed() {
        let session = MockSession::failing_close();
        let conn = MuxedConnection::from_session(session.clone());

        let error = conn.close().await.unwrap_err();
        assert!(matches!(error, Error::Transport(_)));
        assert!(conn.is_closed());
        assert_eq!(session.closes(), 1);
    }

    #[tokio::test]
    async fn dropped_close_still_marks_closed() {
        let (_tx, conn) = pending();

        let result = tokio::time::timeout(Duration::from_millis(10), conn.close()).await;
        assert!(result.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let conn = MuxedConnection::from_session(MockSession::new());

        let accept = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.accept_stream().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), accept)
            .await
            .expect("accept must unblock")
            .unwrap();
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn establish_waits_for_handshake() {
        let session = MockSession::new();
        let conn = MuxedConnection::establish(MockMultiplexer::ready(session.clone()), (), true)
            .await
            .unwrap();
        assert!(conn.establishment().is_settled());

        let error = MuxedConnection::<MockSession>::establish(MockMultiplexer::error(), (), true)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn streams_are_logical_streams() {
        let conn = MuxedConnection::from_session(MockSession::new());
        let opened: LogicalStream<MockStream> =
            conn.open_stream(&CancellationToken::new()).await.unwrap();
        assert!(!opened.is_read_closed());
        assert!(format!("{conn:?}").contains("MuxedConnection"));
    }
}
