// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Retry Tiers
//!
//! This module builds a chain of queues implementing delayed retries through
//! dead-lettering. Each tier is a queue whose rejected messages are routed by
//! a shared dead-letter exchange to the next tier; the delay happens on the
//! consumer side, which keeps "process" and "wait" cleanly separated and
//! needs no broker plugins.
//!
//! A failing message walks the chain: tier 0's handler fails, the message
//! waits tier 0's delay, is rejected, lands on tier 1, and so on. The last
//! tier either wraps around (circular mode) or requeues after its delay so
//! no message is ever dropped.

use crate::{
    consumer::{Consumer, ConsumerOptions, IncomingMessage, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    listener::{ConsumerFactory, Listener},
    queue::{ConsumeOptions, QueueBinding, QueueOptions},
};
use async_trait::async_trait;
use lapin::Connection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// One stage of the retry pipeline.
#[derive(Debug, Clone)]
pub struct Tier {
    pub(crate) name: String,
    pub(crate) delay: Duration,
}

impl Tier {
    /// A tier with the given name and post-failure delay.
    pub fn new(name: &str, delay: Duration) -> Tier {
        Tier {
            name: name.to_owned(),
            delay,
        }
    }
}

/// The error a tier handler reports to trigger a retry.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes deliveries on the retry tiers.
///
/// Acknowledgement is owned by the tiered listener: a handler only reads the
/// message and reports success or failure. Success acks; failure routes the
/// message toward the next tier after the current tier's delay.
#[async_trait]
pub trait TierHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), HandlerError>;
}

/// Dead-letter routing configuration for a tier chain.
#[derive(Clone, Default)]
pub struct RoutingOptions {
    /// Route failures on the last tier back to the first one. Off by
    /// default: a deterministically failing handler would cycle forever.
    pub circular: bool,
    /// The exchange carrying tier-to-tier rejects. Defaults to a durable
    /// direct exchange named after the queue base.
    pub dead_letter_exchange: Option<ExchangeDefinition>,
}

/// Options for a [`TieredListener`].
///
/// `queue` and `consume` apply to every tier queue; `exchanges` and `binds`
/// are declared for the first tier, which is where external traffic enters
/// the pipeline.
#[derive(Clone)]
pub struct TieredOptions {
    pub handler: Arc<dyn TierHandler>,
    pub routing: RoutingOptions,
    pub queue: QueueOptions,
    pub consume: ConsumeOptions,
    pub exchanges: Vec<ExchangeDefinition>,
    pub binds: Vec<QueueBinding>,
}

impl TieredOptions {
    /// Options running the given handler on every tier, with default routing
    /// and plain queues.
    pub fn new(handler: Arc<dyn TierHandler>) -> TieredOptions {
        TieredOptions {
            handler,
            routing: RoutingOptions::default(),
            queue: QueueOptions::default(),
            consume: ConsumeOptions::default(),
            exchanges: Vec::new(),
            binds: Vec::new(),
        }
    }
}

/// A listener over a chain of dead-letter linked retry tiers.
pub struct TieredListener {
    listener: Listener,
}

impl TieredListener {
    /// Creates a tiered listener.
    ///
    /// Tier `i` consumes from queue `{base}-{tier.name}`, bound to the
    /// dead-letter exchange under the tier name. All tiers but the last have
    /// their rejects routed to the following tier (circular mode also links
    /// the last tier back to the first).
    ///
    /// # Errors
    /// `AmqpError::TierListEmpty` when no tier is supplied.
    pub fn new(
        connection: Arc<Connection>,
        base: &str,
        tiers: Vec<Tier>,
        options: TieredOptions,
    ) -> Result<TieredListener, AmqpError> {
        if tiers.is_empty() {
            return Err(AmqpError::TierListEmpty);
        }

        let dlx = options
            .routing
            .dead_letter_exchange
            .clone()
            .unwrap_or_else(|| ExchangeDefinition::new(&format!("{base}DLX")).direct().durable());

        let factories = tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| {
                tier_factory(
                    base,
                    tier,
                    next_tier_name(&tiers, index, options.routing.circular),
                    &dlx,
                    index == 0,
                    &options,
                )
            })
            .collect();

        Ok(TieredListener {
            listener: Listener::new(connection, factories),
        })
    }

    /// Starts consuming on every tier. See [`Listener::listen`].
    pub async fn listen(&self) -> Result<(), AmqpError> {
        self.listener.listen().await
    }

    /// Stops every tier consumer and the underlying channel manager.
    pub async fn stop_listening(&self) {
        self.listener.stop_listening().await
    }
}

/// The routing key a tier dead-letters to, if any.
///
/// `None` marks the terminal tier of a non-circular chain: its failures are
/// requeued instead of rejected onward.
fn next_tier_name(tiers: &[Tier], index: usize, circular: bool) -> Option<String> {
    if index + 1 < tiers.len() {
        Some(tiers[index + 1].name.clone())
    } else if circular {
        Some(tiers[0].name.clone())
    } else {
        None
    }
}

fn tier_factory(
    base: &str,
    tier: &Tier,
    next: Option<String>,
    dlx: &ExchangeDefinition,
    first: bool,
    options: &TieredOptions,
) -> ConsumerFactory {
    let queue_name = format!("{base}-{}", tier.name);

    let mut queue = options.queue.clone();
    if let Some(next) = &next {
        queue = queue.dead_letter(dlx.name(), next);
    }

    // every tier declares the DLX and receives the rejects addressed to it
    let mut exchanges = vec![dlx.clone()];
    let mut binds = vec![QueueBinding::new(dlx.name()).pattern(&tier.name)];

    // external traffic enters through the first tier
    if first {
        exchanges.extend(options.exchanges.iter().cloned());
        binds.extend(options.binds.iter().cloned());
    }

    let consumer_options = ConsumerOptions {
        queue,
        consume: options.consume.clone(),
        exchanges,
        binds,
    };

    let dispatcher = Arc::new(TierDispatcher {
        tier: tier.name.clone(),
        delay: tier.delay,
        terminal: next.is_none(),
        handler: options.handler.clone(),
    });

    Arc::new(move |channel| {
        Consumer::new(
            channel,
            &queue_name,
            consumer_options.clone(),
            dispatcher.clone(),
        )
    })
}

/// Runs the user handler on one tier and finalizes each message according to
/// the outcome and the tier's position in the chain.
struct TierDispatcher {
    tier: String,
    delay: Duration,
    terminal: bool,
    handler: Arc<dyn TierHandler>,
}

#[async_trait]
impl MessageHandler for TierDispatcher {
    async fn handle(&self, message: IncomingMessage) {
        match self.handler.handle(&message).await {
            Ok(()) => {
                if let Err(err) = message.ack().await {
                    error!(error = err.to_string(), tier = %self.tier, "error to ack");
                }
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    tier = %self.tier,
                    "handler failure, delaying message"
                );

                // the wait happens off the dispatch loop so other deliveries
                // on this tier are not held up behind it
                let delay = self.delay;
                let terminal = self.terminal;
                let tier = self.tier.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;

                    let finalized = if terminal {
                        message.requeue().await
                    } else {
                        message.reject().await
                    };

                    if let Err(err) = finalized {
                        error!(
                            error = err.to_string(),
                            tier = %tier,
                            "error to route message after failure"
                        );
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<Tier> {
        vec![
            Tier::new("fast", Duration::from_millis(500)),
            Tier::new("medium", Duration::from_millis(2_000)),
            Tier::new("slow", Duration::from_millis(10_000)),
        ]
    }

    #[test]
    fn tiers_chain_to_their_successor() {
        let tiers = tiers();
        assert_eq!(next_tier_name(&tiers, 0, false).as_deref(), Some("medium"));
        assert_eq!(next_tier_name(&tiers, 1, false).as_deref(), Some("slow"));
    }

    #[test]
    fn last_tier_of_a_non_circular_chain_has_no_target() {
        let tiers = tiers();
        assert_eq!(next_tier_name(&tiers, 2, false), None);
    }

    #[test]
    fn circular_chain_wraps_to_the_front() {
        let tiers = tiers();
        assert_eq!(next_tier_name(&tiers, 2, true).as_deref(), Some("fast"));
    }

    #[test]
    fn single_tier_without_circular_is_terminal() {
        let single = vec![Tier::new("only", Duration::from_secs(1))];
        assert_eq!(next_tier_name(&single, 0, false), None);
        assert_eq!(next_tier_name(&single, 0, true).as_deref(), Some("only"));
    }
}
