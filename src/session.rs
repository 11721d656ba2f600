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

use redis::aio::MultiplexedConnection;
use redis::{
    AsyncConnectionConfig, Client, ConnectionAddr, ConnectionInfo, ErrorKind, ProtocolVersion,
    PushInfo, RedisConnectionInfo, RedisError,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::options::WatcherOptions;
use crate::watcher::{Result, WatcherError};

const DEFAULT_REDIS_PORT: u16 = 6379;

/// One broker connection together with the stream of pub/sub pushes it delivers.
///
/// The connection speaks RESP3, so the same connection can publish while it
/// is subscribed; pushes for subscribed channels arrive on `pushes`.
pub struct BrokerSession {
    pub(crate) connection: MultiplexedConnection,
    pub(crate) pushes: UnboundedReceiver<PushInfo>,
}

impl BrokerSession {
    /// Open a push-enabled connection from an existing client.
    ///
    /// The client must be configured for RESP3 (for example with a
    /// `redis://host:port/?protocol=resp3` URL). A RESP2 client makes this
    /// call fail right away with `ErrorKind::InvalidClientConfig`, before any
    /// command is sent: push senders are only accepted on RESP3 connections.
    pub async fn open(client: &Client) -> redis::RedisResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = AsyncConnectionConfig::new().set_push_sender(tx);
        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        Ok(Self::from_parts(connection, rx))
    }

    /// Assemble a session from a connection and the receiver its push sender feeds.
    pub fn from_parts(
        connection: MultiplexedConnection,
        pushes: UnboundedReceiver<PushInfo>,
    ) -> Self {
        Self { connection, pushes }
    }
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

/// Dials the broker, and redials it after a connection loss.
#[derive(Clone)]
pub(crate) struct Dialer {
    client: Client,
    connect_timeout: Duration,
}

impl Dialer {
    pub(crate) fn new(addr: &str, options: &WatcherOptions) -> Result<Self> {
        let info = ConnectionInfo {
            addr: resolve_addr(&options.protocol, addr)?,
            redis: RedisConnectionInfo {
                password: options.password.clone(),
                protocol: ProtocolVersion::RESP3,
                ..Default::default()
            },
        };
        let client = Client::open(info)?;

        Ok(Self {
            client,
            connect_timeout: options.connect_timeout,
        })
    }

    pub(crate) async fn dial(&self) -> Result<BrokerSession> {
        let session = tokio::time::timeout(self.connect_timeout, BrokerSession::open(&self.client))
            .await
            .map_err(|_| {
                WatcherError::Connection(RedisError::from((
                    ErrorKind::IoError,
                    "Timed out connecting to Redis",
                    format!("{:?}", self.connect_timeout),
                )))
            })?;

        session.map_err(|e| {
            if is_auth_failure(&e) {
                WatcherError::Auth(e)
            } else {
                WatcherError::Connection(e)
            }
        })
    }
}

fn is_auth_failure(err: &RedisError) -> bool {
    err.kind() == ErrorKind::AuthenticationFailed
        || matches!(err.code(), Some("WRONGPASS") | Some("NOAUTH"))
}

/// Turn a broker address into a connection address for the given protocol.
pub(crate) fn resolve_addr(protocol: &str, addr: &str) -> Result<ConnectionAddr> {
    match protocol {
        "tcp" | "tcp4" | "tcp6" => {
            let (host, port) = split_host_port(addr)?;
            Ok(ConnectionAddr::Tcp(host, port))
        }
        #[cfg(unix)]
        "unix" => {
            if addr.is_empty() {
                return Err(invalid_addr(addr));
            }
            Ok(ConnectionAddr::Unix(addr.into()))
        }
        other => Err(WatcherError::Configuration(format!(
            "Unsupported protocol: {}",
            other
        ))),
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') => {
            (host, port.parse().map_err(|_| invalid_addr(addr))?)
        }
        // Bare hosts, including unbracketed IPv6 literals.
        _ => (addr, DEFAULT_REDIS_PORT),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid_addr(addr));
    }

    Ok((host.to_string(), port))
}

fn invalid_addr(addr: &str) -> WatcherError {
    WatcherError::Connection(RedisError::from((
        ErrorKind::InvalidClientConfig,
        "Invalid broker address",
        addr.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tcp() {
        assert_eq!(
            resolve_addr("tcp", "127.0.0.1:6380").unwrap(),
            ConnectionAddr::Tcp("127.0.0.1".to_string(), 6380)
        );
        assert_eq!(
            resolve_addr("tcp4", "redis.internal").unwrap(),
            ConnectionAddr::Tcp("redis.internal".to_string(), 6379)
        );
        assert_eq!(
            resolve_addr("tcp6", "[::1]:7000").unwrap(),
            ConnectionAddr::Tcp("::1".to_string(), 7000)
        );
    }

    #[test]
    fn test_resolve_rejects_bad_addresses() {
        for addr in ["", ":6379", "localhost:port", "localhost:70000"] {
            let err = resolve_addr("tcp", addr).unwrap_err();
            assert!(
                matches!(err, WatcherError::Connection(_)),
                "{} gave {:?}",
                addr,
                err
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_unix() {
        assert_eq!(
            resolve_addr("unix", "/var/run/redis.sock").unwrap(),
            ConnectionAddr::Unix("/var/run/redis.sock".into())
        );
        assert!(resolve_addr("unix", "").is_err());
    }

    #[test]
    fn test_resolve_unknown_protocol() {
        let err = resolve_addr("udp", "127.0.0.1:6379").unwrap_err();
        assert!(matches!(err, WatcherError::Configuration(_)));
    }

    #[test]
    fn test_auth_failure_classification() {
        let wrong_pass = RedisError::from((
            ErrorKind::AuthenticationFailed,
            "Password authentication failed",
        ));
        assert!(is_auth_failure(&wrong_pass));

        let refused = RedisError::from((ErrorKind::IoError, "Connection refused"));
        assert!(!is_auth_failure(&refused));
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        let options = WatcherOptions::default().with_connect_timeout(Duration::from_secs(2));
        // Port 1 is reserved and nothing listens on it in test environments.
        let dialer = Dialer::new("127.0.0.1:1", &options).unwrap();

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, WatcherError::Connection(_)), "{:?}", err);
    }
}
