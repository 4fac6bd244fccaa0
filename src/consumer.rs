// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module runs one logical subscription on a channel. A `Consumer`
//! declares its queue, exchanges, and bindings, applies the prefetch limit,
//! starts consuming, and dispatches every delivery to the registered handler
//! with explicit acknowledgement control. When the server cancels the
//! subscription from its side, the consumer announces it so an enclosing
//! listener can resubscribe.
//!
//! A consumer is bound to the channel it was created with. When that channel
//! dies the consumer dies with it; recovery means building a fresh consumer
//! against the replacement channel, which is what `Listener` does.

use crate::{
    errors::AmqpError,
    events::{Emitter, EventStream},
    exchange::ExchangeDefinition,
    otel,
    queue::{ConsumeOptions, QueueBinding, QueueOptions},
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Receives every delivery of a consumer's subscription.
///
/// The handler owns the message: it must finalize it by calling exactly one
/// of `ack`, `requeue`, or `reject`. A message dropped without finalization
/// stays unacked on the broker until the channel closes, at which point it is
/// redelivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage);
}

/// One delivery, with its acknowledgement operations.
///
/// The finalizers take the message by value, so each delivery is acked,
/// requeued, or rejected at most once.
pub struct IncomingMessage {
    delivery: Delivery,
}

impl IncomingMessage {
    /// The message body.
    pub fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    /// The exchange the message was published to.
    pub fn exchange(&self) -> &str {
        self.delivery.exchange.as_str()
    }

    /// The routing key the message was published under.
    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// The AMQP properties carried by the message.
    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    /// Acknowledges the message, removing it from the queue.
    pub async fn ack(self) -> Result<(), AmqpError> {
        match self.delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Rejects the message and asks the broker to queue it again.
    pub async fn requeue(self) -> Result<(), AmqpError> {
        self.nack(true).await
    }

    /// Rejects the message without requeue.
    ///
    /// With a dead-letter exchange configured on the queue, this is what
    /// routes the message onward.
    pub async fn reject(self) -> Result<(), AmqpError> {
        self.nack(false).await
    }

    async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// Who initiated a consumer cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelInitiator {
    /// The broker cancelled the subscription, typically because its queue
    /// was deleted.
    Server,
}

/// Lifecycle events emitted by a [`Consumer`].
#[derive(Clone)]
pub enum ConsumerEvent {
    /// The subscription was cancelled without a local `stop_consuming` call.
    Canceled { initiator: CancelInitiator },
}

/// Declarative setup for a consumer: its queue, subscription options, and
/// the exchanges and bindings it asserts before consuming.
#[derive(Clone, Default)]
pub struct ConsumerOptions {
    pub queue: QueueOptions,
    pub consume: ConsumeOptions,
    pub exchanges: Vec<ExchangeDefinition>,
    pub binds: Vec<QueueBinding>,
}

/// A logical subscription on one channel.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Clone for Consumer {
    fn clone(&self) -> Self {
        Consumer {
            inner: self.inner.clone(),
        }
    }
}

struct ConsumerInner {
    channel: Arc<Channel>,
    queue_name: String,
    options: ConsumerOptions,
    handler: Arc<dyn MessageHandler>,
    events: Emitter<ConsumerEvent>,
    state: Mutex<ConsumerState>,
    stopping: AtomicBool,
}

#[derive(Default)]
struct ConsumerState {
    live: bool,
    // bumped on every successful consume() so a stale dispatch task cannot
    // act on the state of a newer subscription
    epoch: u64,
    tag: Option<String>,
    effective_queue: Option<String>,
}

impl Consumer {
    /// Creates a consumer for `queue_name` on the given channel.
    ///
    /// An empty queue name asks the broker to generate one; the effective
    /// name is available through [`Consumer::effective_queue`] once
    /// `consume` resolved.
    pub fn new(
        channel: Arc<Channel>,
        queue_name: &str,
        options: ConsumerOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Consumer {
        Consumer {
            inner: Arc::new(ConsumerInner {
                channel,
                queue_name: queue_name.to_owned(),
                options,
                handler,
                events: Emitter::default(),
                state: Mutex::new(ConsumerState::default()),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Declares the topology and starts the subscription.
    ///
    /// Declaration order: the queue first (capturing the effective name),
    /// then all exchanges concurrently, then all bindings concurrently. The
    /// prefetch limit is applied strictly before `basic_consume` on the same
    /// channel, so the QoS is in force when consumption starts.
    ///
    /// Idempotent while the subscription is live. A declaration conflict
    /// fails the call and usually takes the channel down with it; the
    /// enclosing listener recovers by rebuilding on the replacement channel.
    pub async fn consume(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.live {
            return Ok(());
        }

        let effective = inner
            .options
            .queue
            .declare(&inner.channel, &inner.queue_name)
            .await?;

        let declarations = join_all(
            inner
                .options
                .exchanges
                .iter()
                .map(|exchange| exchange.declare(&inner.channel)),
        )
        .await;
        for result in declarations {
            result?;
        }

        let bindings = join_all(
            inner
                .options
                .binds
                .iter()
                .map(|binding| binding.bind(&inner.channel, &effective)),
        )
        .await;
        for result in bindings {
            result?;
        }

        if inner.options.consume.prefetch > 0 {
            if let Err(err) = inner
                .channel
                .basic_qos(inner.options.consume.prefetch, BasicQosOptions::default())
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(effective));
            }
        }

        let subscription = match inner
            .channel
            .basic_consume(
                &effective,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: inner.options.consume.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(AmqpError::ConsumerDeclarationError(effective));
            }
            Ok(subscription) => subscription,
        };

        let tag = subscription.tag().to_string();
        debug!(%tag, queue = %effective, "consumer is live");

        state.live = true;
        state.epoch += 1;
        state.tag = Some(tag);
        state.effective_queue = Some(effective);
        inner.stopping.store(false, Ordering::SeqCst);

        let epoch = state.epoch;
        let dispatch_inner = inner.clone();
        tokio::spawn(async move {
            dispatch(dispatch_inner, subscription, epoch).await;
        });

        Ok(())
    }

    /// Cancels the subscription.
    ///
    /// Resolves once the server acknowledged the cancel, or immediately when
    /// the channel is already gone (the subscription is over either way, so
    /// cancel errors are swallowed). Calling this before `consume`, or a
    /// second time, is a no-op.
    pub async fn stop_consuming(&self) -> Result<(), AmqpError> {
        let tag = {
            let mut state = self.inner.state.lock().await;
            if !state.live {
                return Ok(());
            }
            self.inner.stopping.store(true, Ordering::SeqCst);
            state.live = false;
            state.tag.take()
        };

        if let Some(tag) = tag {
            if let Err(err) = self
                .inner
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                warn!(error = err.to_string(), "error to cancel consumer");
            }
        }

        self.inner.stopping.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// True between the first `stop_consuming` call and its completion.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// The queue this consumer ended up on, once `consume` resolved.
    ///
    /// Differs from the requested name when the broker generated it.
    pub async fn effective_queue(&self) -> Option<String> {
        self.inner.state.lock().await.effective_queue.clone()
    }

    /// Registers a lifecycle event subscriber.
    pub fn subscribe(&self) -> EventStream<ConsumerEvent> {
        self.inner.events.subscribe()
    }
}

async fn dispatch(inner: Arc<ConsumerInner>, mut subscription: lapin::Consumer, epoch: u64) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = subscription.next().await {
        match result {
            Ok(delivery) => {
                let name = match delivery.properties.kind() {
                    Some(kind) => kind.to_string(),
                    _ => "message".to_owned(),
                };
                let span = otel::consumer_span(&delivery.properties, &tracer, &name);

                debug!(
                    "received: {} - exchange: {}",
                    name,
                    delivery.exchange.to_string(),
                );

                inner.handler.handle(IncomingMessage { delivery }).await;
                drop(span);
            }
            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    // a subscription ending while still marked live means the server
    // cancelled it (its queue was deleted, or the broker decided so)
    let server_initiated = {
        let mut state = inner.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        let was_live = state.live;
        state.live = false;
        state.tag = None;
        was_live
    };

    if server_initiated {
        warn!("consumer was cancelled by the server");
        inner.events.emit(ConsumerEvent::Canceled {
            initiator: CancelInitiator::Server,
        });
    }
}
