//! Absolute read and write deadlines for one side of a tunnel.
//!
//! A deadline is a fixed instant: it is not pushed back when data flows, so a
//! busy connection still fails once its deadline has passed. Every operation
//! started after the deadline, or still pending when it passes, fails with
//! [`io::ErrorKind::TimedOut`].

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep},
};

#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("a deadline {timeout:?} after now cannot be represented")]
    OutOfRange { timeout: Duration },
}

pub struct Deadlines<S> {
    inner: S,
    read: Option<Pin<Box<Sleep>>>,
    write: Option<Pin<Box<Sleep>>>,
}

impl<S> Deadlines<S> {
    /// Wraps `inner` without any deadline.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read: None,
            write: None,
        }
    }

    /// Reads fail from `now + timeout` on. A zero timeout clears the deadline.
    pub fn set_read_deadline(&mut self, now: Instant, timeout: Duration) -> Result<(), DeadlineError> {
        self.read = deadline_after(now, timeout)?;
        Ok(())
    }

    /// Writes fail from `now + timeout` on. A zero timeout clears the deadline.
    pub fn set_write_deadline(&mut self, now: Instant, timeout: Duration) -> Result<(), DeadlineError> {
        self.write = deadline_after(now, timeout)?;
        Ok(())
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read.as_ref().map(|sleep| sleep.deadline())
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write.as_ref().map(|sleep| sleep.deadline())
    }
}

fn deadline_after(now: Instant, timeout: Duration) -> Result<Option<Pin<Box<Sleep>>>, DeadlineError> {
    if timeout.is_zero() {
        return Ok(None);
    }
    let at = now
        .checked_add(timeout)
        .ok_or(DeadlineError::OutOfRange { timeout })?;
    Ok(Some(Box::pin(tokio::time::sleep_until(at))))
}

/// Polls the deadline so the task is woken when it passes.
fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, what)
}

impl<S: AsyncRead + Unpin> AsyncRead for Deadlines<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.read, cx) {
            return Poll::Ready(Err(timed_out("read deadline exceeded")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Deadlines<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if expired(&mut this.write, cx) {
            return Poll::Ready(Err(timed_out("write deadline exceeded")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.write, cx) {
            return Poll::Ready(Err(timed_out("write deadline exceeded")));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    // Closing is always allowed, even past the deadline.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
