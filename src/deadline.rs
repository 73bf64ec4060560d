//! Read and write deadlines for streams which have no native timeout support.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::time::{Instant, Sleep};

/// A point in time after which polling an I/O half fails with
/// [`io::ErrorKind::TimedOut`].
///
/// The timer is created lazily on the first poll, so deadlines can be set
/// outside of a runtime context.
#[derive(Default)]
pub struct Deadline {
    at: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deadline").field(&self.at).finish()
    }
}

impl Deadline {
    /// Replace the deadline. `None` clears it.
    pub fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        self.timer = None;
    }

    /// The current deadline, if any.
    pub fn get(&self) -> Option<Instant> {
        self.at
    }

    /// Check the deadline, registering the timer with `cx` while it is still pending.
    ///
    /// Call this before polling the guarded I/O so a blocked read or write is woken
    /// when the deadline passes.
    pub fn poll_check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let Some(at) = self.at else {
            return Ok(());
        };

        if at <= Instant::now() {
            return Err(timed_out());
        }

        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at)));

        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => Err(timed_out()),
            Poll::Pending => Ok(()),
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}
