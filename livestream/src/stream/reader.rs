use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::ended::EndReason;
use crate::ByteReader;

/// Upstream tuner stream as handed to a passthrough consumer.
///
/// Reports end of stream, read errors and being dropped to the owning
/// session, and can be closed by the session through its token even while
/// a consumer holds it. Closing drops the inner stream, which cancels the
/// upstream request.
pub(crate) struct UpstreamReader {
    inner: Option<ByteReader>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    events: Option<mpsc::UnboundedSender<EndReason>>,
}

impl UpstreamReader {
    pub(crate) fn new(
        inner: ByteReader,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<EndReason>,
    ) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(cancel.cancelled_owned()),
            events: Some(events),
        }
    }

    /// Send at most one event for the lifetime of the reader.
    fn report(&mut self, reason: EndReason) {
        if let Some(events) = self.events.take() {
            let _ = events.send(reason);
        }
    }
}

impl AsyncRead for UpstreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.inner.is_some() && this.cancelled.as_mut().poll(cx).is_ready() {
            this.inner = None;
            this.report(EndReason::UpstreamClosed);
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;
        match inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if wanted && buf.filled().len() == before {
                    this.inner = None;
                    this.report(EndReason::UpstreamEnded);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.inner = None;
                this.report(EndReason::UpstreamError(e.to_string()));
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for UpstreamReader {
    fn drop(&mut self) {
        self.report(EndReason::UpstreamClosed);
    }
}
