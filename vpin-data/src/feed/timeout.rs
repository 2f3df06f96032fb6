//! Idle read timeout for upstream feed streams.
//!
//! Exchanges occasionally stop sending frames without closing the socket. [`TimeoutStream`]
//! converts that silence into a terminal [`FeedError::ReadTimeout`] so the ingestor reconnects.

use crate::error::FeedError;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};

/// Default idle period after which a feed connection is considered dead.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream wrapper yielding a single [`FeedError::ReadTimeout`] and then ending if the inner
/// stream produces nothing for `timeout`.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            expired: false,
        }
    }
}

impl<S, T> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<T, FeedError>> + Unpin,
{
    type Item = Result<T, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.expired {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                let timeout = self.timeout;
                self.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    let timeout_secs = self.timeout.as_secs();
                    tracing::warn!(timeout_secs, "feed read timeout, no data received");
                    self.expired = true;
                    Poll::Ready(Some(Err(FeedError::ReadTimeout(timeout_secs))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: Unpin> Unpin for TimeoutStream<S> {}
