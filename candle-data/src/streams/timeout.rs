//! Heartbeat timeout for transport connections.
//!
//! A socket can stall without ever producing an error. [`TimeoutStream`] watches the time since
//! the last inbound item and yields [`TransportError::Stale`] once it exceeds the configured
//! timeout, which the reconnection supervisor treats as a disconnect.

use crate::error::TransportError;
use futures::Stream;
use pin_project::pin_project;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};

/// Stream wrapper that yields [`TransportError::Stale`] if the inner stream is idle for longer
/// than the configured timeout. Every item, keep-alives included, resets the deadline.
#[pin_project]
#[derive(Debug)]
pub struct TimeoutStream<S> {
    #[pin]
    inner: S,
    timeout: Duration,
    #[pin]
    deadline: Sleep,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: tokio::time::sleep(timeout),
        }
    }
}

impl<S, T> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<T, TransportError>>,
{
    type Item = Result<T, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                this.deadline.as_mut().reset(Instant::now() + *this.timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        timeout_ms = this.timeout.as_millis() as u64,
                        "no inbound data within stale timeout"
                    );
                    this.deadline.as_mut().reset(Instant::now() + *this.timeout);
                    Poll::Ready(Some(Err(TransportError::Stale(*this.timeout))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
