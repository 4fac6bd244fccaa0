// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Event Emission
//!
//! This module provides the event primitive every supervisor in this crate
//! publishes through. An `Emitter` fans a cloneable event out to all current
//! subscribers; an `EventStream` is one subscriber's ordered view of the
//! emissions that happened after it subscribed.
//!
//! Delivery is decoupled from emission: `emit` enqueues onto a broadcast
//! channel and returns, and subscribers observe the event from their own
//! tasks. A handler reacting to a state transition therefore never runs on
//! the emitting component's stack, so it can safely call back into the
//! component it is observing.

use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 16;

/// A fan-out emitter for lifecycle events.
///
/// Events emitted while no subscriber exists are dropped; a stream obtained
/// after an emission does not observe it.
#[derive(Debug, Clone)]
pub struct Emitter<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> Emitter<E> {
    /// Creates an emitter buffering up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Emitter { tx }
    }

    /// Registers a new subscriber.
    ///
    /// The stream yields every event emitted from this point on. Dropping the
    /// stream unsubscribes.
    pub fn subscribe(&self) -> EventStream<E> {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Emits an event to all current subscribers.
    ///
    /// Returns immediately; subscribers handle the event on their own tasks.
    pub fn emit(&self, event: E) {
        // send only errs when no subscriber exists, which is not a failure
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Emitter::new(DEFAULT_CAPACITY)
    }
}

/// One subscriber's ordered view of an `Emitter`.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> EventStream<E> {
    /// Waits for the next event.
    ///
    /// Returns `None` once the emitter is gone and every buffered event has
    /// been drained. A subscriber that falls behind the channel capacity
    /// skips the overwritten events and keeps going from the oldest retained
    /// one.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscriber_registered_before_emit() {
        let emitter: Emitter<u32> = Emitter::default();
        let mut stream = emitter.subscribe();

        emitter.emit(7);

        assert_eq!(stream.next().await, Some(7));
    }

    #[tokio::test]
    async fn late_subscriber_does_not_observe_past_events() {
        let emitter: Emitter<u32> = Emitter::default();
        let mut early = emitter.subscribe();

        emitter.emit(1);

        let mut late = emitter.subscribe();
        emitter.emit(2);

        assert_eq!(early.next().await, Some(1));
        assert_eq!(early.next().await, Some(2));
        assert_eq!(late.next().await, Some(2));
    }

    #[tokio::test]
    async fn stream_ends_when_emitter_is_dropped() {
        let emitter: Emitter<u32> = Emitter::default();
        let mut stream = emitter.subscribe();

        emitter.emit(1);
        drop(emitter);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn emission_is_observed_after_the_emitting_call_returns() {
        let emitter: Emitter<&'static str> = Emitter::default();
        let mut stream = emitter.subscribe();

        let observer = tokio::spawn(async move { stream.next().await });
        emitter.emit("ready");

        assert_eq!(observer.await.unwrap(), Some("ready"));
    }

    #[test]
    fn subscriber_count_tracks_streams() {
        let emitter: Emitter<u32> = Emitter::default();
        assert_eq!(emitter.subscriber_count(), 0);

        let a = emitter.subscribe();
        let b = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        drop(a);
        drop(b);
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
