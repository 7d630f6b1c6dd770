//! Pull-style event streams over bounded channels.
//!
//! Every provider turn produces an [`EventStream`]: a single-consumer cursor
//! over a bounded channel fed by a background producer task. The channel
//! bound gives natural backpressure: when the consumer stalls (slow
//! rendering), producers block instead of buffering unboundedly.
//!
//! [`spawn_stream`] is the one way streams are built. It takes a producer
//! closure of the form `async |sink| -> Result<()>`, runs it on a background
//! task, and wires its terminal result into the cursor: `Ok(())` becomes the
//! end-of-stream sentinel, any other error is delivered as a final `Err`
//! item after buffered events drain. Cancellation is the exception: once the
//! consumer closes the stream, nothing further is observed.

use crate::event::Event;
use crate::{Error, Result};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default channel capacity. Bounded so stalled consumers exert
/// backpressure on producers.
pub const DEFAULT_CAPACITY: usize = 32;

/// Producer-side handle: a bounded sender plus the cancellation token for
/// this stream.
///
/// All send operations return a "sent" flag instead of panicking when the
/// consumer has gone away; producers should treat `false` as a signal to
/// wind down.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Result<Event>>,
    cancel: CancellationToken,
}

impl EventSink {
    /// Send one event. Returns false when the stream is closed.
    pub async fn send(&self, event: Event) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(event)) => sent.is_ok(),
        }
    }

    /// Deliver a mid-stream error. Returns false when the stream is closed.
    pub async fn send_err(&self, err: Error) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Err(err)) => sent.is_ok(),
        }
    }

    /// The cancellation token shared with the consumer's `close`.
    ///
    /// Producers select on this at every suspension point: channel sends,
    /// HTTP body reads, child-process waits, tool execution.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the consumer has closed the stream.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Single-consumer cursor over a stream of events.
///
/// `recv` blocks until an event is available, an error arrives, or the
/// stream ends; end-of-stream is `None`, distinct from `Some(Err(_))`.
/// Dropping the stream closes it.
pub struct EventStream {
    rx: mpsc::Receiver<Result<Event>>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Receive the next event, `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<Result<Event>> {
        self.rx.recv().await
    }

    /// Close the stream: cancel the producer and drop anything buffered.
    ///
    /// Idempotent. After close, `recv` returns `None` once the producer
    /// observes cancellation (it must return promptly).
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        // Drain whatever the producer raced in before it saw the token.
        while self.rx.try_recv().is_ok() {}
    }

    /// Collect every remaining item. Test and tooling convenience.
    pub async fn collect_all(&mut self) -> Vec<Result<Event>> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `producer` on a background task and return the consumer cursor.
///
/// The producer's terminal value maps onto the stream as follows:
///
/// - `Ok(())`: the channel closes and the cursor yields the end-of-stream
///   sentinel after buffered events drain.
/// - `Err(Error::Cancelled)`: nothing further is delivered; the consumer
///   asked for this.
/// - any other `Err(e)`: delivered as a final `Err` item after buffered
///   events drain, then end-of-stream.
pub fn spawn_stream<F, Fut>(capacity: usize, producer: F) -> EventStream
where
    F: FnOnce(EventSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.clamp(1, 1024));
    let cancel = CancellationToken::new();
    let sink = EventSink {
        tx: tx.clone(),
        cancel: cancel.clone(),
    };

    tokio::spawn(async move {
        let result = producer(sink).await;
        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {}
            Err(e) => {
                // Buffered events drain first: this error queues behind them.
                let _ = tx.send(Err(e)).await;
            }
        }
        // tx drops here, closing the channel.
    });

    EventStream { rx, cancel }
}

/// A stream that yields a single synchronous error and ends.
pub fn error_stream(err: Error) -> EventStream {
    spawn_stream(1, move |_sink| async move { Err(err) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_arrive_in_program_order() {
        let mut stream = spawn_stream(4, |sink| async move {
            for i in 0..8 {
                sink.send(Event::TextDelta(format!("d{i}"))).await;
            }
            Ok(())
        });

        for i in 0..8 {
            let event = stream.recv().await.unwrap().unwrap();
            assert_eq!(event, Event::TextDelta(format!("d{i}")));
        }
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_error_delivered_after_buffered_events() {
        let mut stream = spawn_stream(8, |sink| async move {
            sink.send(Event::TextDelta("partial".to_string())).await;
            Err(Error::stream("connection reset"))
        });

        assert!(matches!(
            stream.recv().await,
            Some(Ok(Event::TextDelta(_)))
        ));
        assert!(matches!(stream.recv().await, Some(Err(Error::Stream(_)))));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_error_is_silent() {
        let mut stream = spawn_stream(4, |_sink| async move { Err(Error::Cancelled) });
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_producer() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<&str>();
        let mut stream = spawn_stream(4, |sink| async move {
            sink.send(Event::TextDelta("one".to_string())).await;
            sink.cancellation().cancelled().await;
            let _ = done_tx.send("cancelled");
            Err(Error::Cancelled)
        });

        assert!(stream.recv().await.is_some());
        stream.close();
        assert_eq!(done_rx.await.unwrap(), "cancelled");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_closed_stream_returns_false() {
        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<bool>();
        let mut stream = spawn_stream(1, |sink| async move {
            sink.cancellation().cancelled().await;
            let sent = sink.send(Event::Done).await;
            let _ = probe_tx.send(sent);
            Err(Error::Cancelled)
        });

        stream.close();
        assert!(!probe_rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_bounded_channel_applies_backpressure() {
        let mut stream = spawn_stream(1, |sink| async move {
            for _ in 0..4 {
                sink.send(Event::TextDelta("x".to_string())).await;
            }
            sink.send(Event::Done).await;
            Ok(())
        });

        // A slow consumer still receives everything, in order.
        let mut count = 0;
        while let Some(item) = stream.recv().await {
            item.unwrap();
            count += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_error_stream_yields_single_error() {
        let mut stream = error_stream(Error::auth("nope"));
        assert!(matches!(stream.recv().await, Some(Err(Error::Auth(_)))));
        assert!(stream.recv().await.is_none());
    }
}
