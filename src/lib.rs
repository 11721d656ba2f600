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

//! Redis Watcher for Casbin-RS
//!
//! Notifies every enforcer instance subscribed to a Redis channel that the
//! shared policy changed, so each one can reload it. One instance calls
//! [`Watcher::update`]; every subscribed instance, the publisher included,
//! receives the notification and runs its registered callback.
//!
//! [`RedisWatcher`] also implements [`casbin::Watcher`], so it can be handed
//! to an enforcer with `set_watcher`. The enforcer then publishes on every
//! policy mutation by itself.
//!
//! # Examples
//!
//! ```rust,no_run
//! use redis_watcher::{default_update_callback, RedisWatcher, Watcher, WatcherOptions};
//! use casbin::{CoreApi, Enforcer};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> redis_watcher::Result<()> {
//!     let options = WatcherOptions::default().with_channel("/casbin-policy-updates");
//!     let mut watcher = RedisWatcher::new("127.0.0.1:6379", options).await?;
//!
//!     let enforcer = Enforcer::new("rbac_model.conf", "rbac_policy.csv").await.unwrap();
//!     let enforcer = Arc::new(Mutex::new(enforcer));
//!
//!     watcher
//!         .set_update_callback(default_update_callback(enforcer.clone()))
//!         .await;
//!
//!     // Tell every instance, this one included, to reload
//!     watcher.update().await?;
//!
//!     watcher.close().await?;
//!     Ok(())
//! }
//! ```

mod options;
mod session;
mod watcher;


pub use options::{RetryPolicy, WatcherOptions, DEFAULT_CHANNEL, DEFAULT_PROTOCOL};
pub use session::BrokerSession;
pub use watcher::{default_update_callback, RedisWatcher, Watcher, WatcherHealth, UPDATE_MESSAGE};

/// Re-export for convenience
pub use watcher::{Result, WatcherError};
