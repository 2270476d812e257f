//! Publication seam for timer-driven events.
//!
//! The event bus itself lives outside this crate. Anything that can accept an event implements
//! [`EventPublisher`], which lets the [`TimerScheduler`](crate::timer::TimerScheduler) fire typed events instead of
//! arbitrary callbacks.

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Publishes events of type `E` to whoever is listening.
pub trait EventPublisher<E>: Send + Sync + 'static {
    /// Publishes a single event.
    fn publish(&self, event: E);
}

impl<E> EventPublisher<E> for mpsc::UnboundedSender<E>
where
    E: Send + 'static,
{
    fn publish(&self, event: E) {
        if self.send(event).is_err() {
            trace!("event dropped, receiver closed");
        }
    }
}

impl<E> EventPublisher<E> for broadcast::Sender<E>
where
    E: Clone + Send + 'static,
{
    fn publish(&self, event: E) {
        if self.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }
}
