// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirmed Publishing
//!
//! This module provides a back-pressured write surface over a channel in
//! publisher-confirm mode. Each publish resolves only after the broker
//! confirmed the message; the number of outstanding confirmations is capped,
//! and producers waiting for a slot is the back-pressure signal. A publish
//! stream does not recover from failures: after the first error it is
//! terminal and should be replaced together with its channel, which is what
//! a `ChannelManager`'s next `Created` event provides.

use crate::{
    errors::AmqpError,
    events::{Emitter, EventStream},
    otel,
};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Semaphore;
use tracing::error;
use uuid::Uuid;

/// Messages persisted by the broker carry this delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A message body.
///
/// Strings are encoded UTF-8; byte payloads pass through verbatim.
#[derive(Debug, Clone, Default)]
pub struct Payload(Vec<u8>);

impl From<&str> for Payload {
    fn from(value: &str) -> Payload {
        Payload(value.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Payload {
        Payload(value.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Payload {
        Payload(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Payload {
        Payload(value.to_vec())
    }
}

/// A message to publish.
///
/// The empty default exchange routes directly by queue name, so addressing a
/// queue only takes a routing key.
///
/// # Example
/// ```
/// use amqp_resilience::publisher::OutgoingMessage;
///
/// let message = OutgoingMessage::new("orders.created", "{}")
///     .exchange("events")
///     .persistent();
/// ```
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) payload: Payload,
    pub(crate) persistent: bool,
    pub(crate) kind: Option<String>,
}

impl OutgoingMessage {
    /// Creates a message for the default exchange.
    pub fn new(routing_key: &str, payload: impl Into<Payload>) -> OutgoingMessage {
        OutgoingMessage {
            exchange: String::new(),
            routing_key: routing_key.to_owned(),
            payload: payload.into(),
            persistent: false,
            kind: None,
        }
    }

    /// Publishes through the given exchange instead of the default one.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Asks the broker to persist the message.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Tags the message with an application-level type.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.routing_key.is_empty() {
            return Err(AmqpError::MissingRoutingKey);
        }
        Ok(())
    }

    fn properties(&self) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&Context::current(), &mut headers);

        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(kind) = &self.kind {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        if self.persistent {
            props = props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        props
    }
}

/// Events emitted by a [`PublishStream`].
#[derive(Clone)]
pub enum PublishStreamEvent {
    /// The stream failed and accepts no further writes.
    Failed(AmqpError),
}

/// Options for a [`PublishStream`].
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Maximum number of outstanding broker confirmations.
    pub high_water_mark: usize,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions { high_water_mark: 8 }
    }
}

/// A back-pressured sink over a confirm channel.
pub struct PublishStream {
    channel: Arc<Channel>,
    permits: Arc<Semaphore>,
    failed: AtomicBool,
    events: Emitter<PublishStreamEvent>,
}

impl PublishStream {
    /// Creates a publish stream over a channel in confirm mode.
    ///
    /// The channel must have `confirm_select` in force — pair this with
    /// [`crate::channel::ChannelManager::with_confirms`].
    pub fn new(channel: Arc<Channel>, options: PublishOptions) -> PublishStream {
        PublishStream {
            channel,
            permits: Arc::new(Semaphore::new(options.high_water_mark.max(1))),
            failed: AtomicBool::new(false),
            events: Emitter::default(),
        }
    }

    /// Publishes a message and resolves once the broker confirmed it.
    ///
    /// With the high-water mark of confirmations outstanding, the call waits
    /// for a slot: awaiting here is the back-pressure signal. Validation
    /// failures surface before anything is sent. Any publish or confirm
    /// error fails this write and latches the whole stream into
    /// `StreamFailed`.
    pub async fn publish(&self, message: OutgoingMessage) -> Result<(), AmqpError> {
        message.validate()?;

        if self.failed.load(Ordering::SeqCst) {
            return Err(AmqpError::StreamFailed);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AmqpError::StreamFailed)?;

        let Payload(payload) = &message.payload;

        let confirm = match self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                message.properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(self.fail(AmqpError::PublishingError));
            }
            Ok(confirm) => confirm,
        };

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publish confirm");
                Err(self.fail(AmqpError::PublishingError))
            }
            Ok(Confirmation::Nack(_)) => {
                error!("broker nacked the publish");
                Err(self.fail(AmqpError::PublishNacked))
            }
            Ok(_) => Ok(()),
        }
    }

    /// Whether a publish would currently go through without waiting.
    ///
    /// False once the high-water mark of confirmations is outstanding, or
    /// permanently once the stream failed.
    pub fn is_ready(&self) -> bool {
        !self.failed.load(Ordering::SeqCst) && self.permits.available_permits() > 0
    }

    /// Whether the stream is terminally failed.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Registers a stream event subscriber.
    pub fn subscribe(&self) -> EventStream<PublishStreamEvent> {
        self.events.subscribe()
    }

    fn fail(&self, err: AmqpError) -> AmqpError {
        if !self.failed.swap(true, Ordering::SeqCst) {
            // wake producers waiting on a slot so they observe the failure
            self.permits.close();
            self.events.emit(PublishStreamEvent::Failed(err.clone()));
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_an_empty_routing_key() {
        let message = OutgoingMessage::new("", "payload");
        assert_eq!(message.validate(), Err(AmqpError::MissingRoutingKey));
    }

    #[test]
    fn string_payloads_are_utf8_encoded() {
        let message = OutgoingMessage::new("k", "héllo");
        assert_eq!(message.payload.0, "héllo".as_bytes());
    }

    #[test]
    fn byte_payloads_pass_through_verbatim() {
        let bytes: Vec<u8> = vec![0, 159, 146, 150];
        let message = OutgoingMessage::new("k", bytes.clone());
        assert_eq!(message.payload.0, bytes);
    }

    #[test]
    fn exchange_defaults_to_the_broker_default() {
        let message = OutgoingMessage::new("k", "m");
        assert_eq!(message.exchange, "");

        let message = message.exchange("events");
        assert_eq!(message.exchange, "events");
    }

    #[test]
    fn high_water_mark_defaults_to_eight() {
        assert_eq!(PublishOptions::default().high_water_mark, 8);
    }
}
