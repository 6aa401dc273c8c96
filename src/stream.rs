//! Multi-subscriber sample broadcast.
//!
//! Every subscriber owns an unbounded queue, so publishing never blocks and a
//! slow consumer only grows its own backlog. A stream is closed exactly once,
//! with a terminal [`StreamEnd`] delivered to everyone after their last record.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::errors::{StreamClosed, TransportReadError};
use crate::frame::SampleRecord;
use crate::lock;

/// Why a stream stopped delivering records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamEnd {
    /// Orderly shutdown via `disconnect`.
    #[error("sample stream closed")]
    Closed,
    /// The transport failed; the connection is `Faulted`.
    #[error("connection faulted: {0}")]
    Faulted(TransportReadError),
}

#[derive(Debug)]
enum Event {
    Sample(SampleRecord),
    End(StreamEnd),
}

#[derive(Debug, Default)]
struct Inner {
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    end: Option<StreamEnd>,
}

/// Broadcast side, owned by the connection that produces the samples.
#[derive(Debug, Default)]
pub struct SampleStream {
    inner: Mutex<Inner>,
}

impl SampleStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber. It sees every record published from now on.
    pub fn subscribe(&self) -> Result<Subscription, StreamClosed> {
        let mut inner = lock(&self.inner);
        if inner.end.is_some() {
            return Err(StreamClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(tx);
        Ok(Subscription { rx, end: None })
    }

    /// Deliver `record` to every live subscriber; returns how many received it.
    pub fn publish(&self, record: SampleRecord) -> usize {
        let mut inner = lock(&self.inner);
        if inner.end.is_some() {
            return 0;
        }
        // Dropped subscriptions fail the send and are pruned here.
        inner
            .subscribers
            .retain(|tx| tx.send(Event::Sample(record.clone())).is_ok());
        inner.subscribers.len()
    }

    /// Terminate the stream. Only the first call has any effect.
    pub fn close(&self, end: StreamEnd) {
        let mut inner = lock(&self.inner);
        if inner.end.is_some() {
            return;
        }
        debug!(
            "closing sample stream: end={:?}, subscribers={}",
            end,
            inner.subscribers.len()
        );
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Event::End(end.clone()));
        }
        inner.end = Some(end);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).end.is_some()
    }

    pub fn end(&self) -> Option<StreamEnd> {
        lock(&self.inner).end.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

/// Receiving side of a [`SampleStream`].
///
/// Use [`Subscription::recv`] directly, or treat it as a
/// `Stream<Item = Result<SampleRecord, TransportReadError>>` that ends after
/// an orderly close and yields one `Err` before ending after a fault.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Event>,
    end: Option<StreamEnd>,
}

impl Subscription {
    /// Next record in publication order, or the terminal signal once the backlog is drained.
    pub async fn recv(&mut self) -> Result<SampleRecord, StreamEnd> {
        if let Some(end) = &self.end {
            return Err(end.clone());
        }
        let event = self.rx.recv().await;
        self.accept(event)
    }

    /// Non-suspending variant of [`Subscription::recv`]; `Ok(None)` means nothing is queued yet.
    pub fn try_recv(&mut self) -> Result<Option<SampleRecord>, StreamEnd> {
        if let Some(end) = &self.end {
            return Err(end.clone());
        }
        match self.rx.try_recv() {
            Ok(event) => self.accept(Some(event)).map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => self.accept(None).map(Some),
        }
    }

    /// Records queued for this subscriber and not yet received.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    fn accept(&mut self, event: Option<Event>) -> Result<SampleRecord, StreamEnd> {
        match event {
            Some(Event::Sample(record)) => Ok(record),
            Some(Event::End(end)) => {
                self.end = Some(end.clone());
                Err(end)
            }
            // Broadcaster dropped without an explicit close.
            None => {
                self.end = Some(StreamEnd::Closed);
                Err(StreamEnd::Closed)
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Result<SampleRecord, TransportReadError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.end.is_some() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(event) => match self.accept(event) {
                Ok(record) => Poll::Ready(Some(Ok(record))),
                Err(StreamEnd::Faulted(err)) => Poll::Ready(Some(Err(err))),
                Err(StreamEnd::Closed) => Poll::Ready(None),
            },
        }
    }
}
