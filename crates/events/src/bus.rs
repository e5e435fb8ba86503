//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a pub/sub mechanism for
//! distributing coordinator events (queue changes, status snapshots) to any
//! number of consumers.
//!
//! ## Delivery
//!
//! - **Fire-and-forget**: `publish` never waits on a subscriber. A slow
//!   consumer only grows its own backlog; it cannot stall the publisher.
//! - **Per-subscriber ordering**: each subscription sees messages in publish
//!   order.
//! - **No replay**: a subscription only sees messages published after it was
//!   created. Use the coordinator's synchronous getters for the current state.
//! - **Unsubscribe by drop**: dropping a [`Subscription`] closes it; the bus
//!   prunes closed subscribers on the next publish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to an event stream.
///
/// ```ignore
/// let mut sub = coordinator.subscribe_status();
/// while let Some(status) = sub.recv().await {
///     render(status);
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout` for the next message.
    ///
    /// Returns `None` on timeout or when the bus is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<M> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drain every message that is already queued.
    pub fn drain(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Transport-agnostic event bus (pub/sub abstraction).
///
/// Each subscriber gets a copy of every message published after it
/// subscribed (broadcast semantics). The trait requires `Send + Sync`, so
/// multiple tasks can publish concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Number of live subscribers, as of the last publish/subscribe.
    fn subscriber_count(&self) -> usize;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn subscriber_count(&self) -> usize {
        (**self).subscriber_count()
    }
}
