// Copyright 2025 The Casbin Authors. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use casbin::{CoreApi, Enforcer, EventData};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, PushInfo, PushKind, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::options::{RetryPolicy, WatcherOptions};
use crate::session::{BrokerSession, Dialer};

// Type aliases to reduce complexity
type UpdateCallback = Box<dyn Fn(&str) + Send + Sync>;
pub(crate) type CallbackArc = Arc<RwLock<Option<UpdateCallback>>>;
type ConnectionSlot = Arc<RwLock<Option<MultiplexedConnection>>>;

// Guards of these slots are never held across an await.

/// Payload published by [`Watcher::update`].
pub const UPDATE_MESSAGE: &str = "casbin rules updated";

const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(1);

// ========== Error Types ==========

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Redis authentication failed: {0}")]
    Auth(#[source] redis::RedisError),

    #[error("Failed to publish to channel {channel}: {reason}")]
    Publish { channel: String, reason: String },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, WatcherError>;

// ========== Health ==========

/// State of the background subscription loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherHealth {
    /// Issuing `SUBSCRIBE` (initial state).
    Subscribing,
    /// Subscribed and waiting for notifications.
    Receiving,
    /// The last attempt failed; waiting before trying again.
    Retrying { attempt: u32, last_error: String },
    /// The retry policy is exhausted and the loop has stopped.
    Failed { attempts: u32, last_error: String },
    /// The watcher was closed.
    Closed,
}

// ========== Default Update Callback ==========

/// Default update callback: reloads the policy of an enforcer wrapped in `Arc<Mutex<>>`.
pub fn default_update_callback(
    enforcer: Arc<Mutex<Enforcer>>,
) -> impl Fn(&str) + Send + Sync + 'static {
    move |msg: &str| {
        log::debug!("Policy change notification received: {}", msg);

        let enforcer = enforcer.clone();
        tokio::spawn(async move {
            let mut guard = enforcer.lock().await;
            if let Err(e) = guard.load_policy().await {
                log::error!("Failed to reload policy: {}", e);
            }
        });
    }
}

/// Trait for watcher implementations
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Set update callback function, replacing any previous one
    async fn set_update_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static;

    /// Tell every instance on the channel, this one included, that the policy changed
    async fn update(&self) -> Result<()>;

    /// Close the watcher
    async fn close(&mut self) -> Result<()>;
}

// ========== Redis Watcher Implementation ==========

pub struct RedisWatcher {
    options: WatcherOptions,
    connection: ConnectionSlot,
    callback: CallbackArc,
    shutdown: watch::Sender<bool>,
    health: Arc<watch::Sender<WatcherHealth>>,
    subscription_handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl RedisWatcher {
    /// Create a new Redis watcher.
    ///
    /// `addr` is a `host:port` target (or a socket path for the `unix`
    /// protocol). It is ignored when `options` carries a session, which is
    /// adopted as-is. The subscription loop starts before this returns.
    pub async fn new(addr: &str, mut options: WatcherOptions) -> Result<Self> {
        let (session, dialer) = match options.session.take() {
            Some(session) => (session, None),
            None => {
                let dialer = Dialer::new(addr, &options)?;
                let session = dialer.dial().await?;
                log::info!("Connected to Redis at {}", addr);
                (session, Some(dialer))
            }
        };

        let BrokerSession {
            connection,
            pushes,
        } = session;
        let connection = Arc::new(RwLock::new(Some(connection)));
        let callback: CallbackArc = Arc::new(RwLock::new(None));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (health, _) = watch::channel(WatcherHealth::Subscribing);
        let health = Arc::new(health);

        let subscription = SubscriptionLoop {
            channel: options.channel.clone(),
            connection: connection.clone(),
            pushes,
            dialer,
            callback: callback.clone(),
            retry: options.retry.clone(),
            health: health.clone(),
            shutdown: shutdown_rx,
            stale: false,
        };
        let handle = tokio::spawn(subscription.run());

        Ok(Self {
            options,
            connection,
            callback,
            shutdown,
            health,
            subscription_handle: Some(handle),
            closed: false,
        })
    }

    /// Channel this watcher publishes and listens on.
    pub fn channel(&self) -> &str {
        &self.options.channel
    }

    /// Follow the state of the subscription loop.
    pub fn health(&self) -> watch::Receiver<WatcherHealth> {
        self.health.subscribe()
    }

    fn store_callback(&self, callback: UpdateCallback) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }
}

#[async_trait]
impl Watcher for RedisWatcher {
    async fn set_update_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.store_callback(Box::new(callback));
    }

    /// Publish the update marker. The publishing connection is subscribed
    /// too, so this instance's callback runs as well as everyone else's.
    async fn update(&self) -> Result<()> {
        let conn = connection_in(&self.connection)
            .ok_or_else(|| publish_error(&self.options.channel, "watcher closed"))?;
        publish_update(conn, &self.options.channel).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.shutdown.send_replace(true);
        if let Some(handle) = self.subscription_handle.take() {
            if let Err(e) = handle.await {
                log::error!("Subscription task ended abnormally: {}", e);
            }
        }

        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.health.send_replace(WatcherHealth::Closed);
        log::info!("Watcher on channel {} closed", self.options.channel);
        Ok(())
    }
}

/// Lets an [`Enforcer`] drive the watcher through `set_watcher`: every policy
/// mutation it reports publishes the update marker on the channel.
impl casbin::Watcher for RedisWatcher {
    fn set_update_callback(&mut self, callback: Box<dyn FnMut(String) + Send + Sync>) {
        let callback = std::sync::Mutex::new(callback);
        self.store_callback(Box::new(move |msg: &str| {
            let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
            (*callback)(msg.to_string());
        }));
    }

    fn update(&mut self, d: EventData) {
        log::debug!(
            "Enforcer reported a policy change ({}), notifying {}",
            d,
            self.options.channel
        );

        let Some(conn) = connection_in(&self.connection) else {
            log::warn!(
                "Watcher on channel {} is closed, dropping policy change notification",
                self.options.channel
            );
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!(
                    "Cannot notify channel {} outside a Tokio runtime: {}",
                    self.options.channel,
                    e
                );
                return;
            }
        };

        let channel = self.options.channel.clone();
        runtime.spawn(async move {
            if let Err(e) = publish_update(conn, &channel).await {
                log::error!("{}", e);
            }
        });
    }
}

impl Drop for RedisWatcher {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shutdown.send_replace(true);
        if let Some(handle) = self.subscription_handle.take() {
            handle.abort();
        }
        log::debug!(
            "Watcher on channel {} dropped without close, releasing connection",
            self.options.channel
        );
    }
}

fn connection_in(slot: &ConnectionSlot) -> Option<MultiplexedConnection> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn publish_error(channel: &str, reason: impl Into<String>) -> WatcherError {
    WatcherError::Publish {
        channel: channel.to_string(),
        reason: reason.into(),
    }
}

async fn publish_update(mut conn: MultiplexedConnection, channel: &str) -> Result<()> {
    let receivers: i64 = conn
        .publish(channel, UPDATE_MESSAGE)
        .await
        .map_err(|e| publish_error(channel, e.to_string()))?;

    log::debug!("Published update on {} to {} subscriber(s)", channel, receivers);
    Ok(())
}

// ========== Subscription Loop ==========

/// How a receive phase ended without error.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReceiveEnd {
    /// No channel is subscribed on the connection anymore.
    Unsubscribed,
    Shutdown,
}

/// What a single push means to the watcher.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushEvent {
    Message(String),
    SubscriptionCount(i64),
    Disconnected,
    Ignored,
}

struct SubscriptionLoop {
    channel: String,
    connection: ConnectionSlot,
    pushes: UnboundedReceiver<PushInfo>,
    dialer: Option<Dialer>,
    callback: CallbackArc,
    retry: RetryPolicy,
    health: Arc<watch::Sender<WatcherHealth>>,
    shutdown: watch::Receiver<bool>,
    // Set when the connection must be replaced before the next attempt.
    stale: bool,
}

impl SubscriptionLoop {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.cycle(&mut attempt).await {
                Ok(ReceiveEnd::Shutdown) => break,
                Ok(ReceiveEnd::Unsubscribed) => {
                    log::debug!("No channels left subscribed, resubscribing to {}", self.channel);
                }
                Err(e) => {
                    log::error!("Failure from Redis subscription on {}: {}", self.channel, e);
                    self.unsubscribe().await;
                    self.stale = self.dialer.is_some();

                    attempt = attempt.saturating_add(1);
                    if self.retry.is_exhausted(attempt) {
                        log::warn!(
                            "Giving up on channel {} after {} failed attempts",
                            self.channel,
                            attempt
                        );
                        self.health.send_replace(WatcherHealth::Failed {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                        return;
                    }

                    self.health.send_replace(WatcherHealth::Retrying {
                        attempt,
                        last_error: e.to_string(),
                    });
                    let delay = self.retry.delay_for_attempt(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }

        self.unsubscribe().await;
        self.health.send_replace(WatcherHealth::Closed);
    }

    /// One pass through `Subscribing` and `Receiving`.
    async fn cycle(&mut self, attempt: &mut u32) -> Result<ReceiveEnd> {
        if self.stale {
            self.reconnect().await?;
        }

        self.health.send_replace(WatcherHealth::Subscribing);
        self.subscribe().await?;
        *attempt = 0;

        self.health.send_replace(WatcherHealth::Receiving);
        receive_notifications(
            &mut self.pushes,
            &self.channel,
            &self.callback,
            &mut self.shutdown,
        )
        .await
    }

    async fn reconnect(&mut self) -> Result<()> {
        let Some(dialer) = &self.dialer else {
            return Ok(());
        };

        let BrokerSession {
            connection,
            pushes,
        } = dialer.dial().await?;
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        self.pushes = pushes;
        self.stale = false;

        log::info!("Reconnected to Redis for channel {}", self.channel);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<()> {
        // Pushes left over from a previous subscription would be misread.
        while self.pushes.try_recv().is_ok() {}

        let mut conn = self.current_connection()?;
        conn.subscribe(&self.channel).await.map_err(|e| {
            WatcherError::Subscription(format!("SUBSCRIBE {} failed: {}", self.channel, e))
        })?;

        log::debug!("Subscribed to channel {}", self.channel);
        Ok(())
    }

    /// Best-effort; failures are only logged.
    async fn unsubscribe(&self) {
        let Ok(mut conn) = self.current_connection() else {
            return;
        };

        match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, conn.unsubscribe(&self.channel)).await {
            Ok(Ok(())) => log::debug!("Unsubscribed from channel {}", self.channel),
            Ok(Err(e)) => log::debug!("Ignoring UNSUBSCRIBE failure on {}: {}", self.channel, e),
            Err(_) => log::debug!("UNSUBSCRIBE on {} timed out", self.channel),
        }
    }

    fn current_connection(&self) -> Result<MultiplexedConnection> {
        connection_in(&self.connection)
            .ok_or_else(|| WatcherError::Subscription("connection released".to_string()))
    }
}

/// Deliver notifications until the subscription ends, fails, or shutdown is signalled.
pub(crate) async fn receive_notifications(
    pushes: &mut UnboundedReceiver<PushInfo>,
    channel: &str,
    callback: &CallbackArc,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ReceiveEnd> {
    loop {
        let push = tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(ReceiveEnd::Shutdown),
            push = pushes.recv() => push,
        };

        let Some(push) = push else {
            return Err(WatcherError::Subscription(
                "push stream from Redis closed".to_string(),
            ));
        };

        match classify_push(&push, channel) {
            PushEvent::Message(payload) => deliver(callback, &payload),
            PushEvent::SubscriptionCount(0) => return Ok(ReceiveEnd::Unsubscribed),
            PushEvent::SubscriptionCount(count) => {
                log::debug!("{} channel(s) subscribed on connection", count)
            }
            PushEvent::Disconnected => {
                return Err(WatcherError::Subscription(
                    "connection to Redis lost".to_string(),
                ))
            }
            PushEvent::Ignored => log::debug!("Ignoring push {:?}", push.kind),
        }
    }
}

fn deliver(callback: &CallbackArc, payload: &str) {
    match callback.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
        Some(cb) => cb(payload),
        None => log::debug!("No update callback set, dropping notification"),
    }
}

pub(crate) fn classify_push(push: &PushInfo, channel: &str) -> PushEvent {
    match push.kind {
        PushKind::Message => match push.data.as_slice() {
            [from, payload] if value_text(from).as_deref() == Some(channel) => {
                value_text(payload).map_or(PushEvent::Ignored, PushEvent::Message)
            }
            _ => PushEvent::Ignored,
        },
        // The count covers every channel on the connection, not just ours.
        PushKind::Subscribe | PushKind::Unsubscribe => match push.data.as_slice() {
            [_, Value::Int(count)] => PushEvent::SubscriptionCount(*count),
            _ => PushEvent::Ignored,
        },
        PushKind::Disconnection => PushEvent::Disconnected,
        _ => PushEvent::Ignored,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(text) => Some(text.clone()),
        _ => None,
    }
}
