//! Byte-counting wrapper for download streams.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Receives the number of bytes read since the previous call
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream wrapper that reports bytes as they flow through it.
///
/// Reports are rate-limited to one per `interval`; whatever is still
/// unreported when the stream ends or fails is flushed at that point, so the
/// deltas always add up to the bytes actually read.
pub struct ProgressStream<S> {
    inner: S,
    bytes_read: u64,
    unreported: u64,
    last_report: Instant,
    interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    pub fn new(inner: S, interval: Duration, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_read: 0,
            unreported: 0,
            last_report: Instant::now(),
            interval,
            callback,
        }
    }

    /// Total bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn flush(&mut self) {
        if self.unreported > 0 {
            (self.callback)(self.unreported);
            self.unreported = 0;
        }
        self.last_report = Instant::now();
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let len = chunk.len() as u64;
                self.bytes_read += len;
                self.unreported += len;
                if self.last_report.elapsed() >= self.interval {
                    self.flush();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.flush();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.flush();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
