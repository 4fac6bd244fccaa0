// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel-Bound Consumer Supervision
//!
//! A `Listener` binds a set of consumer factories to a channel it manages.
//! Whenever the channel is (re)created, the previous consumer set is
//! discarded and a fresh one is built from the factories, so consumers are
//! always bound to the channel that carries them. Server-initiated cancels
//! are answered by resubscribing on the same channel; channel-level failures
//! flush the whole set and the next `Created` event rebuilds it.

use crate::{
    channel::{ChannelEvent, ChannelManager},
    consumer::{Consumer, ConsumerEvent},
    errors::AmqpError,
    events::EventStream,
};
use futures_util::future::join_all;
use lapin::{Channel, Connection};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{watch, Mutex};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

/// Builds a consumer against a freshly created channel.
pub type ConsumerFactory = Arc<dyn Fn(Arc<Channel>) -> Consumer + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Startup {
    Pending,
    Ready,
    Stopped,
}

/// Supervises a set of consumers over channel recreations.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    manager: ChannelManager,
    factories: Vec<ConsumerFactory>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    startup: watch::Sender<Startup>,
    epoch: Mutex<ConsumerEpoch>,
}

/// The consumer set built against one channel incarnation.
#[derive(Default)]
struct ConsumerEpoch {
    consumers: Vec<Consumer>,
    watchers: Option<CancellationToken>,
}

impl Listener {
    /// Creates a listener over the given connection.
    ///
    /// Each factory is invoked once per channel incarnation to produce the
    /// consumer it contributes.
    pub fn new(connection: Arc<Connection>, factories: Vec<ConsumerFactory>) -> Listener {
        let (startup, _) = watch::channel(Startup::Pending);

        Listener {
            inner: Arc::new(ListenerInner {
                manager: ChannelManager::no_confirms(connection),
                factories,
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                startup,
                epoch: Mutex::new(ConsumerEpoch::default()),
            }),
        }
    }

    /// Starts listening.
    ///
    /// Resolves once every factory's consumer has started at least once.
    /// Later channel recreations rebuild the consumer set silently.
    ///
    /// # Errors
    /// `AmqpError::ConnectionClosed` when the connection is already dead,
    /// `AmqpError::InterruptedStartup` when `stop_listening` is called before
    /// the first full startup completed.
    pub async fn listen(&self) -> Result<(), AmqpError> {
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            // subscribe before starting the manager so the first Created
            // event cannot be missed
            let events = self.inner.manager.subscribe();
            if let Err(err) = self.inner.manager.start() {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(err);
            }

            let inner = self.inner.clone();
            self.inner.tasks.spawn(async move {
                supervise(inner, events).await;
            });
        }

        let mut startup = self.inner.startup.subscribe();
        loop {
            match *startup.borrow_and_update() {
                Startup::Ready => return Ok(()),
                Startup::Stopped => return Err(AmqpError::InterruptedStartup),
                Startup::Pending => {}
            }
            if startup.changed().await.is_err() {
                return Err(AmqpError::InterruptedStartup);
            }
        }
    }

    /// Stops every consumer, the owned channel manager, and the supervisor.
    pub async fn stop_listening(&self) {
        self.inner.startup.send_if_modified(|state| {
            if *state == Startup::Pending {
                *state = Startup::Stopped;
                true
            } else {
                false
            }
        });

        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.manager.stop().await;
    }
}

async fn supervise(inner: Arc<ListenerInner>, mut events: EventStream<ChannelEvent>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(ChannelEvent::Created(channel)) => rebuild(&inner, channel).await,
                Some(ChannelEvent::Closed) => halt_epoch(&inner).await,
                None => break,
            },
        }
    }

    halt_epoch(&inner).await;
}

/// Discards the previous consumer set and builds a fresh one against the
/// given channel.
async fn rebuild(inner: &Arc<ListenerInner>, channel: Arc<Channel>) {
    halt_epoch(inner).await;

    debug!(
        consumers = inner.factories.len(),
        "building consumers against fresh channel"
    );

    let consumers: Vec<Consumer> = inner
        .factories
        .iter()
        .map(|factory| factory(channel.clone()))
        .collect();

    // consumers share the channel's RPC queue: starting them one at a time
    // keeps each one's qos/consume pair adjacent on the wire
    let mut all_started = true;
    for consumer in &consumers {
        if let Err(err) = consumer.consume().await {
            all_started = false;
            // a declaration conflict usually kills the channel too; the
            // manager recreates it and this listener rebuilds then. Logged
            // because a deterministic conflict would otherwise loop quietly.
            error!(
                error = err.to_string(),
                "failure to start consumer, awaiting channel recreation"
            );
        }
    }

    let watchers = CancellationToken::new();
    for consumer in &consumers {
        watch_cancels(inner, consumer.clone(), watchers.clone());
    }

    {
        let mut epoch = inner.epoch.lock().await;
        epoch.consumers = consumers;
        epoch.watchers = Some(watchers);
    }

    if all_started {
        inner.startup.send_if_modified(|state| {
            if *state == Startup::Pending {
                *state = Startup::Ready;
                true
            } else {
                false
            }
        });
    }
}

/// Resubscribes a consumer whenever the server cancels it, for as long as
/// its epoch lives.
fn watch_cancels(inner: &Arc<ListenerInner>, consumer: Consumer, epoch_token: CancellationToken) {
    let mut events = consumer.subscribe();

    inner.tasks.spawn(async move {
        loop {
            let event = tokio::select! {
                _ = epoch_token.cancelled() => return,
                event = events.next() => event,
            };

            match event {
                Some(ConsumerEvent::Canceled { .. }) => {
                    if consumer.is_stopping() {
                        continue;
                    }
                    warn!("server cancelled consumer, resubscribing");
                    if let Err(err) = consumer.consume().await {
                        error!(error = err.to_string(), "failure to resubscribe consumer");
                    }
                }
                None => return,
            }
        }
    });
}

/// Stops every consumer of the current epoch and its cancel watchers.
async fn halt_epoch(inner: &Arc<ListenerInner>) {
    let (consumers, watchers) = {
        let mut epoch = inner.epoch.lock().await;
        (
            std::mem::take(&mut epoch.consumers),
            epoch.watchers.take(),
        )
    };

    if let Some(watchers) = watchers {
        watchers.cancel();
    }

    if consumers.is_empty() {
        return;
    }

    debug!(consumers = consumers.len(), "halting consumer epoch");
    join_all(consumers.iter().map(|consumer| consumer.stop_consuming())).await;
}
