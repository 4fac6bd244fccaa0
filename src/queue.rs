// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options and Bindings
//!
//! This module provides the declarative description of a queue and of its
//! bindings to exchanges. Like exchange definitions, these are plain values
//! re-applied against every fresh channel. Dead-letter routing is part of the
//! queue options because retry tiers are built by pointing one queue's
//! rejects at the next one.

use crate::errors::AmqpError;
use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration options for a queue.
///
/// This struct implements the builder pattern. An empty queue name at
/// declaration time asks the broker to generate one; the effective name is
/// captured by the declaring consumer.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueOptions {
    /// Creates queue options with standard settings (non-durable,
    /// non-exclusive, no limits).
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive, checking for existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes messages rejected without requeue (and expired ones) to the
    /// given exchange under the given routing key.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Adds a single pass-through declaration argument.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Synthesizes the broker argument table for this queue.
    pub(crate) fn args(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = self.params.clone();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        args
    }

    /// Declares a queue with these options, returning the effective
    /// (possibly broker-generated) queue name.
    pub(crate) async fn declare(
        &self,
        channel: &Channel,
        name: &str,
    ) -> Result<String, AmqpError> {
        debug!("creating queue: {}", name);

        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: self.passive,
                    durable: self.durable,
                    exclusive: self.exclusive,
                    auto_delete: self.auto_delete,
                    nowait: self.no_wait,
                },
                FieldTable::from(self.args()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => {
                let effective = queue.name().as_str().to_owned();
                debug!("queue: {} was created", effective);
                Ok(effective)
            }
        }
    }
}

/// Configuration for binding a queue to an exchange.
///
/// The queue side is implied by the consumer declaring the binding, so a
/// binding is only the exchange plus the routing pattern.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub(crate) exchange: String,
    pub(crate) pattern: String,
}

impl QueueBinding {
    /// Creates a binding to the given exchange with an empty pattern.
    pub fn new(exchange: &str) -> QueueBinding {
        QueueBinding {
            exchange: exchange.to_owned(),
            pattern: String::new(),
        }
    }

    /// Sets the routing pattern for the binding.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = pattern.to_owned();
        self
    }

    /// Establishes this binding for the given queue.
    pub(crate) async fn bind(&self, channel: &Channel, queue_name: &str) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue_name, self.exchange, self.pattern
        );

        match channel
            .queue_bind(
                queue_name,
                &self.exchange,
                &self.pattern,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    self.exchange.clone(),
                    queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Options for the subscription a consumer runs on its queue.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub(crate) prefetch: u16,
    pub(crate) exclusive: bool,
}

impl ConsumeOptions {
    /// Creates consume options with no prefetch limit and shared access.
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Caps the number of unacked messages in flight on the channel.
    ///
    /// Note that per AMQP 0-9-1 the limit is channel-scoped: consumers that
    /// share a channel share it.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Requests exclusive consumption of the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_string(args: &BTreeMap<ShortString, AMQPValue>, key: &str) -> Option<String> {
        match args.get(&ShortString::from(key)) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            _ => None,
        }
    }

    #[test]
    fn plain_options_produce_no_args() {
        assert!(QueueOptions::new().durable().args().is_empty());
    }

    #[test]
    fn dead_letter_routing_lands_in_the_argument_table() {
        let args = QueueOptions::new()
            .dead_letter("ordersDLX", "orders-medium")
            .args();

        assert_eq!(
            long_string(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE).as_deref(),
            Some("ordersDLX")
        );
        assert_eq!(
            long_string(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders-medium")
        );
    }

    #[test]
    fn limits_land_in_the_argument_table() {
        let args = QueueOptions::new()
            .ttl(30_000)
            .max_length(1_000)
            .max_length_bytes(1 << 20)
            .args();

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(LongInt::from(30_000)))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(LongInt::from(1_000)))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES)),
            Some(&AMQPValue::LongInt(LongInt::from(1 << 20)))
        );
    }

    #[test]
    fn pass_through_params_survive_arg_synthesis() {
        let args = QueueOptions::new()
            .param(
                ShortString::from("x-queue-mode"),
                AMQPValue::LongString(LongString::from("lazy")),
            )
            .args();

        assert_eq!(long_string(&args, "x-queue-mode").as_deref(), Some("lazy"));
    }

    #[test]
    fn binding_builder_holds_exchange_and_pattern() {
        let binding = QueueBinding::new("events").pattern("orders.*");
        assert_eq!(binding.exchange, "events");
        assert_eq!(binding.pattern, "orders.*");
    }
}
