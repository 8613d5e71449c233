//! One direction of a tunnel.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on the graceful close of the destination half. The half is
/// dropped regardless once this elapses.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one relay direction.
#[derive(Debug)]
pub struct TransferResult {
    /// Bytes written to the destination, including partial transfers.
    pub bytes: u64,
    /// Why the copy stopped, `None` on a clean end of stream.
    pub error: Option<io::Error>,
}

/// Copies `source` into `destination` until end of stream, an I/O error, or
/// until `close` is cancelled by the relay running in the other direction.
///
/// Whatever the outcome, `close` is cancelled on return and both halves are
/// closed, so the sibling relay stops as well.
pub async fn relay<W, R>(mut destination: W, mut source: R, close: CancellationToken) -> TransferResult
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let _close_tunnel = close.clone().drop_guard();

    // tokio's copy flushes whenever the source has nothing to read, so bytes
    // held by a buffering destination (a TLS session) are not left behind.
    let mut counted = CountingWriter::new(&mut destination);
    let result = tokio::select! {
        res = tokio::io::copy(&mut source, &mut counted) => res.map(drop),
        _ = close.cancelled() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "tunnel closed by the other direction",
        )),
    };
    let bytes = counted.written;

    drop(source);
    if tokio::time::timeout(CLOSE_TIMEOUT, destination.shutdown())
        .await
        .is_err()
    {
        debug!("closing the destination half timed out");
    }
    drop(destination);

    TransferResult {
        bytes,
        error: result.err(),
    }
}

/// Counts what the inner writer accepted, so a failed copy still reports the
/// bytes that went through.
struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.written += n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}
