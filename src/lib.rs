//! # Muxconn: eager-open streams over a lazy-open stream multiplexer
//!
//! Muxconn adapts a stream multiplexer (one physical connection carrying many
//! independent byte streams) to the contract expected by peer-to-peer networking
//! code, where opening a stream on one side must immediately unblock the matching
//! accept on the other.
//!
//! ## Architecture Overview
//!
//! The crate is a thin correctness layer over an opaque multiplexing session:
//!
//! - **Establishment** ([`establish`]): turns a raw, already connected duplex pipe
//!   into a multiplexed session, either as the dialer or the acceptor. The handshake
//!   runs on a background task, so a connection handle can be returned before the
//!   session exists. The outcome is settled once and observed by every waiter.
//! - **Connection** ([`MuxedConnection`]): the consumer-facing stream factory. Opening
//!   and accepting streams transparently waits for establishment, then runs the
//!   single byte open handshake described below.
//! - **Stream** ([`LogicalStream`]): one multiplexed stream, with independent read
//!   and write half-close tracking and deadline pass-through.
//!
//! ## The open handshake
//!
//! Multiplexers like yamux open streams lazily: the peer only learns about a stream
//! when its first frame arrives. To make a new stream visible immediately, the
//! opener writes one reserved byte, [`OPEN_STREAM_MARKER`] (`0x2A`), before any
//! application data. The accepter reads and checks that byte before handing the
//! stream to the application, and fails with [`Error::ProtocolViolation`] if the
//! stream starts with anything else. The marker is never visible to application
//! readers.
//!
//! ## Multiplexing engines
//!
//! Engines plug in through the [`mux`] traits. A [`Multiplexer`](mux::Multiplexer) is
//! any tower `Service` from a raw [`Handshake`](mux::Handshake) to a
//! [`Session`](mux::Session). The built-in engine is [`mux::yamux::Yamux`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use muxconn::MuxedConnection;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client, server) = tokio::io::duplex(64 * 1024);
//!
//! let client = MuxedConnection::new(client, true);
//! let server = MuxedConnection::new(server, false);
//!
//! let mut outbound = client.open_stream(&CancellationToken::new()).await?;
//! let mut inbound = server.accept_stream().await?;
//!
//! outbound.write_all(b"hello").await?;
//! let mut buf = [0u8; 5];
//! inbound.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `mock`: exposes [`mux::mock`], an in-memory multiplexer for testing code built
//!   on this crate.

use std::fmt;
use std::pin::Pin;

pub mod conn;
pub mod deadline;
pub mod error;
pub mod establish;
pub mod mux;
pub mod network;
pub mod stream;

pub use conn::{MuxedConnection, OPEN_STREAM_MARKER};
pub use error::{Error, HandshakeError};
pub use establish::Establishment;
pub use network::{MuxedConn, MuxedStream};
pub use stream::{HalfClose, LogicalStream};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed, sendable error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
