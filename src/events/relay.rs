//! Per-job event relay: a bounded, FIFO, cross-task channel.
//!
//! One relay exists per job. The producer half lives inside the background
//! workflow task; the consumer half backs the client's SSE response. Events
//! are delivered in publish order. When the consumer lags, events queue up to
//! the channel capacity, after which `publish` suspends the producer rather
//! than dropping anything.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event as SseFrame, Sse};
use futures::stream::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use super::Event;

pub const DEFAULT_CAPACITY: usize = 256;

/// Create a connected relay/stream pair for one job.
pub fn channel(capacity: usize) -> (EventRelay, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventRelay { tx },
        EventStream {
            rx,
            finished: false,
        },
    )
}

// ── Producer half ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventRelay {
    tx: mpsc::Sender<Event>,
}

impl EventRelay {
    /// Enqueue an event. Suspends only when the buffer is full. If the
    /// consumer has gone away (client disconnected) the event is discarded;
    /// the job keeps running either way.
    pub async fn publish(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            warn!("event relay consumer gone; event discarded");
        }
    }

    /// True once the consumer half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── Consumer half ────────────────────────────────────────────────────

pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    finished: bool,
}

impl EventStream {
    /// Next event in FIFO order. Returns `None` after a terminal event has
    /// been delivered or once every producer handle is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Like [`recv`](Self::recv), but injects a keepalive event after `idle`
    /// elapses with nothing to deliver, so an underlying transport is never
    /// starved silent.
    pub async fn recv_or_keepalive(&mut self, idle: Duration) -> Option<Event> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(idle, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            Ok(None) => None,
            Err(_) => Some(Event::keepalive()),
        }
    }

    /// Adapt the stream into an SSE response body: one JSON object per frame.
    pub fn into_sse(
        self,
        keepalive_idle: Duration,
    ) -> Sse<impl Stream<Item = Result<SseFrame, Infallible>>> {
        let stream = futures::stream::unfold(self, move |mut events| async move {
            let event = events.recv_or_keepalive(keepalive_idle).await?;
            let frame = SseFrame::default().data(event.to_wire_json());
            Some((Ok::<SseFrame, Infallible>(frame), events))
        });
        Sse::new(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn events_are_delivered_in_publish_order() {
        let (relay, mut stream) = channel(16);
        for i in 0..5u8 {
            relay.publish(Event::progress(i * 10, format!("step-{i}"))).await;
        }
        relay.publish(Event::success("done", None)).await;

        for i in 0..5u8 {
            let event = stream.recv().await.unwrap();
            match event.kind {
                EventKind::Progress { progress, step } => {
                    assert_eq!(progress, i * 10);
                    assert_eq!(step, format!("step-{i}"));
                }
                other => panic!("Expected Progress, got {other:?}"),
            }
        }
        assert!(stream.recv().await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        let (relay, mut stream) = channel(16);
        relay.publish(Event::error("boom")).await;
        relay.publish(Event::message("never seen")).await;

        assert!(stream.recv().await.unwrap().is_terminal());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_producers_drop() {
        let (relay, mut stream) = channel(16);
        relay.publish(Event::message("one")).await;
        drop(relay);

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_blocks_when_buffer_is_full() {
        let (relay, mut stream) = channel(1);
        relay.publish(Event::message("first")).await;

        // Second publish must suspend rather than drop.
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            relay.publish(Event::message("second")),
        )
        .await;
        assert!(pending.is_err(), "publish should block on a full buffer");

        // Draining one slot unblocks the producer.
        assert!(stream.recv().await.is_some());
        tokio::time::timeout(
            Duration::from_millis(200),
            relay.publish(Event::message("second")),
        )
        .await
        .expect("publish should complete once capacity frees up");
    }

    #[tokio::test]
    async fn keepalive_injected_on_idle() {
        let (relay, mut stream) = channel(4);
        let event = stream
            .recv_or_keepalive(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(event.kind, EventKind::Keepalive);

        // A real event still comes through afterwards.
        relay.publish(Event::message("hello")).await;
        let event = stream
            .recv_or_keepalive(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(event.kind, EventKind::Message { .. }));
    }

    #[tokio::test]
    async fn publish_after_consumer_drop_does_not_panic() {
        let (relay, stream) = channel(4);
        drop(stream);
        assert!(relay.is_closed());
        relay.publish(Event::message("into the void")).await;
    }
}
