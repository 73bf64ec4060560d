//! Yamux multiplexing engine.
//!
//! A [`::yamux::Connection`] has to be polled continuously to make progress, so
//! [`Yamux`] moves it onto a driver task and hands out a [`YamuxSession`], a cheap
//! cloneable handle which talks to the driver over channels.

use std::collections::VecDeque;
use std::fmt;
use std::future::{Ready, ready};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::compat::{
    Compat, FuturesAsyncReadCompatExt as _, TokioAsyncReadCompatExt as _,
};
use tracing::{Instrument as _, debug, trace};

use super::{Direction, Handshake, Session, SessionStream};
use crate::BoxFuture;
use crate::deadline::Deadline;

/// The yamux engine, configured with a [`::yamux::Config`].
///
/// Yamux has no session-level handshake: the session is usable as soon as the
/// connection driver is running, and streams are announced to the peer with
/// their first frame.
#[derive(Debug, Clone, Default)]
pub struct Yamux {
    config: ::yamux::Config,
}

impl Yamux {
    /// Create an engine using `config` for every session.
    pub fn new(config: ::yamux::Config) -> Self {
        Self { config }
    }

    /// The configuration used for new sessions.
    pub fn config(&self) -> &::yamux::Config {
        &self.config
    }
}

impl<IO> tower::Service<Handshake<IO>> for Yamux
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Response = YamuxSession;
    type Error = io::Error;
    type Future = Ready<Result<YamuxSession, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Handshake<IO>) -> Self::Future {
        ready(Ok(YamuxSession::spawn(
            req.io,
            self.config.clone(),
            req.direction,
        )))
    }
}

enum Command {
    Open(oneshot::Sender<io::Result<::yamux::Stream>>),
    Close(oneshot::Sender<io::Result<()>>),
}

type Inbound = mpsc::UnboundedReceiver<io::Result<::yamux::Stream>>;

/// Handle to a yamux session running on a driver task.
///
/// Dropping every handle closes the session.
#[derive(Clone)]
pub struct YamuxSession {
    commands: mpsc::UnboundedSender<Command>,
    inbound: Arc<Mutex<Inbound>>,
    direction: Direction,
}

impl fmt::Debug for YamuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YamuxSession")
            .field("direction", &self.direction)
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl YamuxSession {
    /// Start a yamux session on `io`, spawning its driver on the current tokio runtime.
    pub fn spawn<IO>(io: IO, config: ::yamux::Config, direction: Direction) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mode = match direction {
            Direction::Outbound => ::yamux::Mode::Client,
            Direction::Inbound => ::yamux::Mode::Server,
        };

        let connection = ::yamux::Connection::new(io.compat(), config, mode);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut driver = Driver {
            connection,
            commands: commands_rx,
            inbound: inbound_tx,
            opening: VecDeque::new(),
            closing: Vec::new(),
            shutdown: false,
        };

        let span = tracing::debug_span!("yamux", %direction);
        tokio::spawn(
            async move {
                std::future::poll_fn(|cx| driver.poll_drive(cx)).await;
                debug!("connection driver exited");
            }
            .instrument(span),
        );

        Self {
            commands: commands_tx,
            inbound: Arc::new(Mutex::new(inbound_rx)),
            direction,
        }
    }

    /// The role this end played when the session was created.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns true once the connection driver has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl Session for YamuxSession {
    type Stream = YamuxStream;

    fn open_stream(&self) -> BoxFuture<'_, io::Result<Self::Stream>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(Command::Open(tx))
                .map_err(|_| session_closed())?;
            let stream = rx.await.map_err(|_| session_closed())??;
            trace!(id = %stream.id(), "opened outbound stream");
            Ok(YamuxStream::new(stream))
        })
    }

    fn accept_stream(&self) -> BoxFuture<'_, io::Result<Self::Stream>> {
        Box::pin(async move {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(Ok(stream)) => {
                    trace!(id = %stream.id(), "accepted inbound stream");
                    Ok(YamuxStream::new(stream))
                }
                Some(Err(error)) => Err(error),
                None => Err(session_closed()),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            if self.commands.send(Command::Close(tx)).is_err() {
                // The driver already exited, so the connection is gone.
                return Ok(());
            }
            rx.await.unwrap_or(Ok(()))
        })
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "yamux session closed")
}

fn into_io(error: ::yamux::ConnectionError) -> io::Error {
    match error {
        ::yamux::ConnectionError::Io(error) => error,
        error => io::Error::new(io::ErrorKind::ConnectionAborted, error),
    }
}

/// Copy an error for a second recipient. `io::Error` is not `Clone`.
fn replicate(error: &io::Error) -> io::Error {
    io::Error::new(error.kind(), error.to_string())
}

struct Driver<T> {
    connection: ::yamux::Connection<Compat<T>>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<io::Result<::yamux::Stream>>,
    opening: VecDeque<oneshot::Sender<io::Result<::yamux::Stream>>>,
    closing: Vec<oneshot::Sender<io::Result<()>>>,
    shutdown: bool,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_drive(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_commands(cx);

        if self.shutdown {
            return self.poll_shutdown(cx);
        }

        while !self.opening.is_empty() {
            match self.connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(tx) = self.opening.pop_front() {
                        let _ = tx.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(error)) => {
                    // Stream limits are reported here too; a dead connection also
                    // surfaces through `poll_next_inbound` below.
                    debug!(%error, "failed to open outbound stream");
                    if let Some(tx) = self.opening.pop_front() {
                        let _ = tx.send(Err(into_io(error)));
                    }
                }
                Poll::Pending => break,
            }
        }

        loop {
            match self.connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    let _ = self.inbound.send(Ok(stream));
                }
                Poll::Ready(Some(Err(error))) => {
                    debug!(%error, "connection failed");
                    self.fail(into_io(error));
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    debug!("connection closed by peer");
                    self.fail(session_closed());
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_commands(&mut self, cx: &mut Context<'_>) {
        loop {
            match self.commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(tx))) => {
                    if self.shutdown {
                        let _ = tx.send(Err(session_closed()));
                    } else {
                        self.opening.push_back(tx);
                    }
                }
                Poll::Ready(Some(Command::Close(tx))) => {
                    trace!("close requested");
                    self.closing.push(tx);
                    self.shutdown = true;
                }
                Poll::Ready(None) => {
                    if !self.shutdown {
                        trace!("all session handles dropped");
                    }
                    self.shutdown = true;
                    return;
                }
                Poll::Pending => return,
            }
        }
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        for tx in self.opening.drain(..) {
            let _ = tx.send(Err(session_closed()));
        }

        let result = std::task::ready!(self.connection.poll_close(cx)).map_err(into_io);
        debug!(ok = result.is_ok(), "connection closed");

        for tx in self.closing.drain(..) {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(error) => Err(replicate(error)),
            };
            let _ = tx.send(reply);
        }

        Poll::Ready(())
    }

    fn fail(&mut self, error: io::Error) {
        for tx in self.opening.drain(..) {
            let _ = tx.send(Err(replicate(&error)));
        }

        // The connection is already gone, so there is nothing left to close.
        for tx in self.closing.drain(..) {
            let _ = tx.send(Ok(()));
        }

        let _ = self.inbound.send(Err(error));
    }
}

/// A yamux stream with deadline support.
#[pin_project]
pub struct YamuxStream {
    #[pin]
    inner: Compat<::yamux::Stream>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl fmt::Debug for YamuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YamuxStream")
            .field("id", &self.id())
            .field("read_deadline", &self.read_deadline)
            .field("write_deadline", &self.write_deadline)
            .finish()
    }
}

impl YamuxStream {
    fn new(stream: ::yamux::Stream) -> Self {
        Self {
            inner: stream.compat(),
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }

    /// The yamux stream identifier.
    pub fn id(&self) -> ::yamux::StreamId {
        self.inner.get_ref().id()
    }
}

impl SessionStream for YamuxStream {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.read_deadline.set(deadline);
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.write_deadline.set(deadline);
        Ok(())
    }
}

impl AsyncRead for YamuxStream {
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

impl AsyncWrite for YamuxStream {
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
        let this = self.project();
        this.write_deadline.poll_check(cx)?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        this.write_deadline.poll_check(cx)?;
        this.inner.poll_shutdown(cx)
    }
}
