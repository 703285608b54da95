//! Ordered single-consumer sink for a session's outbound events.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::Event;

/// Publishing side of a session channel.
///
/// Events are delivered in push order. Once closed, nothing more reaches the
/// consumer; later pushes land in the discard counter.
pub struct Outbound {
    sender: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl Outbound {
    /// Create a sink and its consumer.
    #[must_use]
    pub fn channel() -> (Arc<Self>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            delivered: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });
        (outbound, EventReceiver { inner: rx })
    }

    /// Publish an event. Returns `false` if it was discarded.
    pub fn push(&self, event: Event) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = sender.as_ref().is_some_and(|tx| tx.send(event).is_ok());
        drop(sender);

        if sent {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Route an event to the discard sink.
    pub fn discard(&self, event: &Event) {
        tracing::trace!("Discarding event {event:?}");
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the channel. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(mpsc::UnboundedSender::is_closed)
    }

    /// Events handed to the consumer.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events sent to the discard sink.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Consuming side of a session channel.
pub struct EventReceiver {
    inner: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Next event, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.inner.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.inner.try_recv().ok()
    }

    /// Stream of events until closure.
    #[must_use]
    pub fn into_stream(self) -> futures::stream::BoxStream<'static, Event> {
        UnboundedReceiverStream::new(self.inner).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected(reason: &str) -> Event {
        Event::Disconnected {
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_delivers_in_push_order() {
        let (outbound, mut rx) = Outbound::channel();
        for i in 0..5 {
            assert!(outbound.push(disconnected(&i.to_string())));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(disconnected(&i.to_string())));
        }
        assert_eq!(outbound.delivered(), 5);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_stream() {
        let (outbound, mut rx) = Outbound::channel();
        outbound.push(disconnected("before"));

        assert!(outbound.close());
        assert!(!outbound.close());
        assert!(outbound.is_closed());

        assert!(!outbound.push(disconnected("after")));
        assert_eq!(rx.recv().await, Some(disconnected("before")));
        assert_eq!(rx.recv().await, None);
        assert_eq!(outbound.delivered(), 1);
        assert_eq!(outbound.discarded(), 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_counts_as_discard() {
        let (outbound, rx) = Outbound::channel();
        drop(rx);
        assert!(!outbound.push(disconnected("gone")));
        assert_eq!(outbound.discarded(), 1);
    }

    #[test]
    fn test_discard_sink_counts() {
        let (outbound, mut rx) = Outbound::channel();
        outbound.discard(&disconnected("x"));
        assert_eq!(outbound.discarded(), 1);
        assert!(rx.try_recv().is_none());
    }
}
