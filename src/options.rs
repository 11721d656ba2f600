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

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;

use crate::session::BrokerSession;
use crate::watcher::{Result, WatcherError};

/// Channel used when none is configured.
pub const DEFAULT_CHANNEL: &str = "/casbin";

/// Network protocol used when none is configured.
pub const DEFAULT_PROTOCOL: &str = "tcp";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration options for the Redis watcher.
///
/// Options are built by applying setters over the defaults, in order:
///
/// ```rust
/// use redis_watcher::WatcherOptions;
///
/// let options = WatcherOptions::default()
///     .with_channel("/policies")
///     .with_password("secret");
/// assert_eq!(options.channel, "/policies");
/// ```
#[derive(Deserialize)]
#[serde(default)]
pub struct WatcherOptions {
    /// Redis channel for pub/sub
    pub channel: String,

    /// Network protocol used to reach the broker (`tcp`, `tcp4`, `tcp6` or `unix`)
    pub protocol: String,

    /// Shared password sent during the connection handshake
    pub password: Option<String>,

    /// Pre-established session adopted instead of dialing
    #[serde(skip)]
    pub session: Option<BrokerSession>,

    /// Upper bound on how long dialing the broker may take
    #[serde(rename = "connect_timeout_ms", deserialize_with = "duration_from_millis")]
    pub connect_timeout: Duration,

    /// Backoff applied when the subscription loop fails
    pub retry: RetryPolicy,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            password: None,
            session: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for WatcherOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherOptions")
            .field("channel", &self.channel)
            .field("protocol", &self.protocol)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("session", &self.session)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl WatcherOptions {
    /// Create new WatcherOptions with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON document.
    ///
    /// Missing fields keep their defaults. Durations are given in
    /// milliseconds (`connect_timeout_ms`, `retry.initial_delay_ms`,
    /// `retry.max_delay_ms`).
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| WatcherError::Configuration(e.to_string()))
    }

    /// Set the Redis pub/sub channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the network protocol
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the password used to authenticate against the broker
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Hand over an already established session.
    ///
    /// The watcher takes ownership and neither dials nor authenticates.
    pub fn with_session(mut self, session: BrokerSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Set the dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the retry policy of the subscription loop
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff for the subscription loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(rename = "initial_delay_ms", deserialize_with = "duration_from_millis")]
    pub initial_delay: Duration,

    /// Ceiling for the doubled delay
    #[serde(rename = "max_delay_ms", deserialize_with = "duration_from_millis")]
    pub max_delay: Duration,

    /// Consecutive failures tolerated before the loop gives up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Set the delay before the first retry
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay ceiling
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Give up after `retries` consecutive failures
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether `attempt` consecutive failures exceed the policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt > max)
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = WatcherOptions::default();
        assert_eq!(options.channel, "/casbin");
        assert_eq!(options.protocol, "tcp");
        assert!(options.password.is_none());
        assert!(options.session.is_none());
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.retry, RetryPolicy::default());
    }

    #[test]
    fn test_setters_apply_in_order() {
        let options = WatcherOptions::new()
            .with_channel("/first")
            .with_channel("/second")
            .with_protocol("unix")
            .with_password("pass")
            .with_connect_timeout(Duration::from_millis(250));

        assert_eq!(options.channel, "/second");
        assert_eq!(options.protocol, "unix");
        assert_eq!(options.password.as_deref(), Some("pass"));
        assert_eq!(options.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_debug_redacts_password() {
        let options = WatcherOptions::default().with_password("hunter2");
        let rendered = format!("{:?}", options);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_from_json() {
        let options = WatcherOptions::from_json(
            r#"{
                "channel": "/tenants",
                "password": "pw",
                "connect_timeout_ms": 1500,
                "retry": { "initial_delay_ms": 50, "max_retries": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(options.channel, "/tenants");
        assert_eq!(options.protocol, "tcp");
        assert_eq!(options.password.as_deref(), Some("pw"));
        assert_eq!(options.connect_timeout, Duration::from_millis(1500));
        assert_eq!(options.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(options.retry.max_delay, Duration::from_secs(30));
        assert_eq!(options.retry.max_retries, Some(3));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = WatcherOptions::from_json("{ \"channel\": 7 }").unwrap_err();
        assert!(matches!(err, WatcherError::Configuration(_)));
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let retry = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));

        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_exhaustion() {
        assert!(!RetryPolicy::default().is_exhausted(u32::MAX));

        let retry = RetryPolicy::default().with_max_retries(2);
        assert!(!retry.is_exhausted(2));
        assert!(retry.is_exhausted(3));
    }
}
