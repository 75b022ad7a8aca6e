//! Best-effort broadcast of registry-change events.
//!
//! Delivery is fire-and-forget and at-most-once. `publish()` never blocks and
//! never fails: with no publish transport it is a no-op, with no subscribers
//! the event is dropped, and a subscriber that falls more than the channel
//! capacity behind loses the overflow.

use crate::protocol::encode_line;
use crate::transport::{Connection, Listener};
use crate::types::Event;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Handle used by the dispatcher to announce registry changes.
///
/// Cheap to clone; all clones feed the same channel.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: Option<broadcast::Sender<Event>>,
}

impl EventPublisher {
    /// A publisher with a bounded fan-out channel of `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Some(tx) }
    }

    /// A publisher for servers started without a publish transport.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Sends `event` to every current subscriber, dropping it on any failure.
    pub fn publish(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.send(event) {
            Ok(receivers) => trace!(receivers, "Published registry event"),
            Err(broadcast::error::SendError(event)) => {
                trace!(name = %event.name, "No subscribers, event dropped")
            }
        }
    }

    /// Opens a new in-process subscription, or `None` when disabled.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }
}

/// Accepts subscriber connections on `listener` and streams events to each
/// until `shutdown` fires.
///
/// An accept failure is returned to the caller; a failing subscriber only
/// loses its own connection.
pub(crate) async fn serve_subscribers(
    listener: Listener,
    publisher: EventPublisher,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut subscribers = JoinSet::new();
    let streams = shutdown.child_token();

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let Some(rx) = publisher.subscribe() else {
                        break Ok(());
                    };
                    info!(peer = %peer, "Subscriber connected");
                    subscribers.spawn(stream_events(conn, peer, rx, streams.clone()));
                }
                Err(e) => break Err(e),
            },
            // Reap finished subscribers so the set does not grow unbounded
            Some(_) = subscribers.join_next(), if !subscribers.is_empty() => {}
        }
    };

    drop(listener);
    streams.cancel();
    while subscribers.join_next().await.is_some() {}
    result
}

async fn stream_events(
    mut conn: Box<dyn Connection>,
    peer: String,
    mut rx: broadcast::Receiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(peer = %peer, skipped, "Slow subscriber, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let line = match encode_line(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode event");
                continue;
            }
        };

        // A subscriber that stopped reading blocks here, not the server
        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            written = conn.write_all(&line) => written,
        };
        if let Err(e) = written {
            debug!(peer = %peer, error = %e, "Subscriber write failed, dropping subscriber");
            break;
        }
    }

    let _ = conn.shutdown().await;
    debug!(peer = %peer, "Subscriber disconnected");
}
