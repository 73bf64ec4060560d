//! Session establishment, decoupled from the moment a connection handle is created.
//!
//! An [`Establishment`] is a settle-once slot: exactly one writer (the handshake task)
//! and any number of readers, all of which observe the same outcome. Reading never
//! consumes the outcome, so every later waiter sees it too.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{Instrument as _, debug};

use crate::DebugLiteral;
use crate::error::HandshakeError;
use crate::mux::{Direction, Multiplexer, Session};

type Outcome<S> = Result<Arc<S>, HandshakeError>;

/// The eventual outcome of a multiplexer handshake.
pub struct Establishment<S> {
    rx: watch::Receiver<Option<Outcome<S>>>,
}

impl<S> Clone for Establishment<S> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<S> fmt::Debug for Establishment<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.rx.borrow() {
            None => "establishing",
            Some(Ok(_)) => "established",
            Some(Err(_)) => "failed",
        };
        f.debug_tuple("Establishment")
            .field(&DebugLiteral(state))
            .finish()
    }
}

impl<S> Establishment<S>
where
    S: Session,
{
    /// Start a handshake on a background task and return its slot immediately.
    ///
    /// Must be called from within a tokio runtime. No timeout is applied; drop or
    /// close `io` to abandon a handshake which never completes.
    pub fn start<M, IO>(multiplexer: M, io: IO, direction: Direction) -> Self
    where
        M: Multiplexer<IO, Session = S> + Send + 'static,
        IO: Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let span = tracing::debug_span!("establish", %direction);

        tokio::spawn(
            async move {
                let outcome = establish(multiplexer, io, direction).await.map(Arc::new);
                match &outcome {
                    Ok(_) => debug!("session established"),
                    Err(error) => debug!(%error, "session establishment failed"),
                }
                tx.send_replace(Some(outcome));
            }
            .instrument(span),
        );

        Self { rx }
    }

    /// A slot which already holds `session`.
    pub fn ready(session: S) -> Self {
        Self::settled(Ok(Arc::new(session)))
    }

    /// A slot which already holds a failure.
    pub fn failed(error: HandshakeError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(outcome: Outcome<S>) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    /// Wait for the handshake to finish.
    ///
    /// Every call returns the same outcome: the same session, or a clone of the
    /// same failure. Dropping the returned future leaves the outcome in place.
    pub async fn wait(&self) -> Result<Arc<S>, HandshakeError> {
        let mut rx = self.rx.clone();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| (*slot).clone());

        settled.unwrap_or_else(|| {
            Err(HandshakeError::new(
                "establishment task exited before completing",
            ))
        })
    }

    /// The outcome, if the handshake has finished.
    pub fn peek(&self) -> Option<Result<Arc<S>, HandshakeError>> {
        (*self.rx.borrow()).clone()
    }

    /// Returns true once the handshake has finished.
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Run a handshake to completion.
pub async fn establish<M, IO>(
    mut multiplexer: M,
    io: IO,
    direction: Direction,
) -> Result<M::Session, HandshakeError>
where
    M: Multiplexer<IO>,
{
    std::future::poll_fn(|cx| <M as Multiplexer<IO>>::poll_ready(&mut multiplexer, cx))
        .await
        .map_err(HandshakeError::new)?;

    multiplexer
        .establish(io, direction)
        .await
        .map_err(HandshakeError::new)
}
