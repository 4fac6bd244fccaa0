// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module keeps one channel open on a given connection. A
//! `ChannelManager` creates its channel (plain or in publisher-confirm mode),
//! watches it, and recreates it after a drop; observers learn about every
//! replacement through `ChannelEvent`s and re-issue their declarations
//! against the fresh channel. When the underlying connection dies the
//! manager becomes terminal: connection recovery belongs to the `Connector`.

use crate::{
    errors::AmqpError,
    events::{Emitter, EventStream},
};
use lapin::{options::ConfirmSelectOptions, Channel, Connection};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error};

/// Delay before recreating a channel that dropped mid-life.
pub const RECREATE_DELAY: Duration = Duration::from_secs(3);
/// Delay before retrying after a failed channel creation.
pub const CREATE_RETRY_DELAY: Duration = Duration::from_secs(5);

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Lifecycle events emitted by a [`ChannelManager`].
///
/// `Created` and `Closed` strictly alternate over the lifetime of a manager.
#[derive(Clone)]
pub enum ChannelEvent {
    /// A channel was opened and is ready for declarations and publishing.
    Created(Arc<Channel>),
    /// The live channel was lost or deliberately closed.
    Closed,
}

/// Maintains one open channel on a connection.
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connection: Arc<Connection>,
    confirm: bool,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    events: Emitter<ChannelEvent>,
    current: Mutex<Option<Arc<Channel>>>,
}

impl ChannelManager {
    /// A manager for a plain, fire-and-forget channel.
    pub fn no_confirms(connection: Arc<Connection>) -> ChannelManager {
        ChannelManager::new(connection, false)
    }

    /// A manager for a channel in publisher-confirm mode.
    ///
    /// `confirm_select` is issued before the channel is announced, so every
    /// channel observed through `Created` already confirms publishes.
    pub fn with_confirms(connection: Arc<Connection>) -> ChannelManager {
        ChannelManager::new(connection, true)
    }

    fn new(connection: Arc<Connection>, confirm: bool) -> ChannelManager {
        ChannelManager {
            inner: Arc::new(ManagerInner {
                connection,
                confirm,
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                events: Emitter::default(),
                current: Mutex::new(None),
            }),
        }
    }

    /// Begins channel creation.
    ///
    /// Idempotent while the manager runs.
    ///
    /// # Errors
    /// `AmqpError::ConnectionClosed` when the underlying connection is
    /// already dead.
    pub fn start(&self) -> Result<(), AmqpError> {
        if !self.inner.connection.status().connected() {
            return Err(AmqpError::ConnectionClosed);
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            supervise(inner).await;
        });

        Ok(())
    }

    /// Stops the manager, closing a live channel and cancelling any pending
    /// recreation.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Registers a lifecycle event subscriber.
    pub fn subscribe(&self) -> EventStream<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// The currently open channel, if any.
    pub fn current(&self) -> Option<Arc<Channel>> {
        self.inner.current.lock().unwrap().clone()
    }
}

async fn supervise(inner: Arc<ManagerInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }

        if !inner.connection.status().connected() {
            debug!("connection closed, channel manager is terminal");
            return;
        }

        debug!("creating amqp channel...");

        let created = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            result = create_channel(&inner) => result,
        };

        match created {
            Ok(channel) => {
                debug!("channel created");
                let channel = Arc::new(channel);

                *inner.current.lock().unwrap() = Some(channel.clone());
                inner.events.emit(ChannelEvent::Created(channel.clone()));

                let deliberate = tokio::select! {
                    _ = inner.shutdown.cancelled() => true,
                    _ = dropped(&channel) => false,
                };

                inner.current.lock().unwrap().take();

                if deliberate {
                    if let Err(err) = channel.close(CLOSE_REPLY_SUCCESS, "shutting down").await {
                        debug!(error = err.to_string(), "error on graceful channel close");
                    }
                    inner.events.emit(ChannelEvent::Closed);
                    return;
                }

                error!("amqp channel dropped");
                inner.events.emit(ChannelEvent::Closed);

                if !inner.connection.status().connected() {
                    debug!("connection closed, channel manager is terminal");
                    return;
                }

                if wait_or_shutdown(&inner, RECREATE_DELAY).await {
                    return;
                }
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if wait_or_shutdown(&inner, CREATE_RETRY_DELAY).await {
                    return;
                }
            }
        }
    }
}

async fn create_channel(inner: &ManagerInner) -> Result<Channel, lapin::Error> {
    let channel = inner.connection.create_channel().await?;

    if inner.confirm {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
    }

    Ok(channel)
}

/// Resolves when the channel's status reports it is no longer open.
async fn dropped(channel: &Channel) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        if !channel.status().connected() {
            return;
        }
    }
}

/// Sleeps for `delay`; returns true when shutdown interrupted the wait.
async fn wait_or_shutdown(inner: &ManagerInner, delay: Duration) -> bool {
    tokio::select! {
        _ = inner.shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
