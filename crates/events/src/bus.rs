//! Event publishing/subscription seam.
//!
//! The production transport lives outside this workspace. Consumers (saga
//! routers, DLQ retry handlers) assume at-least-once delivery with no
//! ordering across subjects, so they must be idempotent. The saga
//! coordinator's advisory `InvalidState` error is how a duplicate shows up on
//! the consuming side.

use std::sync::mpsc::Receiver;

/// Messages published after this subscription was taken.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub(crate) fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Everything buffered so far, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Fan-out bus: every subscription sees every message.
///
/// A failed `publish()` goes back to the publisher, which typically hands the
/// message to the dead letter queue for a timed retry.
pub trait EventBus<M: Clone>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Publish `message` twice, as an at-least-once transport may.
    fn redeliver(&self, message: M) -> Result<(), Self::Error> {
        self.publish(message.clone())?;
        self.publish(message)
    }
}
