//! Redis-backed store.
//!
//! Each procedure is a Lua script run with `EVALSHA` (falling back to `EVAL`
//! when the server has not cached it yet). Redis runs a script to completion
//! before serving any other command, which is what makes the limiters safe
//! across processes.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, error, info};

use super::{AtomicStore, StoreError};
use crate::config::StoreConfig;
use crate::ratelimit::{Procedure, Reply};

/// The four procedure scripts, hashed once.
struct Scripts {
    take_token: Script,
    peek_bucket: Script,
    record_request: Script,
    inspect_window: Script,
}

impl Scripts {
    fn load() -> Self {
        use crate::ratelimit::{sliding_window, token_bucket};

        Self {
            take_token: Script::new(token_bucket::TAKE_TOKEN_SCRIPT),
            peek_bucket: Script::new(token_bucket::PEEK_BUCKET_SCRIPT),
            record_request: Script::new(sliding_window::RECORD_REQUEST_SCRIPT),
            inspect_window: Script::new(sliding_window::INSPECT_WINDOW_SCRIPT),
        }
    }

    fn for_procedure(&self, procedure: &Procedure) -> &Script {
        match procedure {
            Procedure::TakeToken(_) => &self.take_token,
            Procedure::PeekBucket(_) => &self.peek_bucket,
            Procedure::RecordRequest { .. } => &self.record_request,
            Procedure::InspectWindow(_) => &self.inspect_window,
        }
    }
}

/// A handle to a Redis server, shared by every limiter in the process.
///
/// Cloning the inner connection manager is cheap; it multiplexes commands
/// over one connection and reconnects on failure.
pub struct RedisStore {
    manager: ConnectionManager,
    scripts: Scripts,
    command_timeout: Duration,
    /// Connection URL with any password masked, for logs.
    display_url: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.display_url)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let display_url = config.redacted_url();
        info!(url = %display_url, "Connecting to Redis");

        let client = Client::open(config.connection_url())
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis URL: {}", e)))?;

        let connect_timeout = config.connect_timeout();
        let manager = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))?
            .map_err(|e| {
                error!(url = %display_url, error = %e, "Failed to connect to Redis");
                StoreError::from(e)
            })?;

        let store = Self {
            manager,
            scripts: Scripts::load(),
            command_timeout: config.command_timeout(),
            display_url,
        };
        store.ping().await?;

        info!(url = %store.display_url, "Connected to Redis");
        Ok(store)
    }

    /// Close the connection.
    ///
    /// In-flight commands on clones of the manager finish first; the socket
    /// closes once the last clone drops.
    pub async fn disconnect(self) {
        let Self {
            manager,
            display_url,
            ..
        } = self;
        drop(manager);
        info!(url = %display_url, "Disconnected from Redis");
    }

    /// Bound a store round-trip by the command timeout.
    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => {
                error!(
                    operation = what,
                    timeout = ?self.command_timeout,
                    "Redis command timed out"
                );
                Err(StoreError::Timeout(self.command_timeout))
            }
        }
    }
}

#[async_trait::async_trait]
impl AtomicStore for RedisStore {
    async fn execute(&self, key: &str, procedure: &Procedure) -> Result<Reply, StoreError> {
        let script = self.scripts.for_procedure(procedure);
        let mut invocation = script.prepare_invoke();
        invocation.key(key);
        for arg in procedure.args() {
            invocation.arg(arg);
        }

        let mut conn = self.manager.clone();
        let fields: Vec<String> = self
            .bounded(procedure.name(), invocation.invoke_async(&mut conn))
            .await?;

        debug!(key = %key, procedure = procedure.name(), reply = ?fields, "Script executed");
        procedure.decode_reply(&fields)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let cmd = redis::cmd("DEL").arg(key).clone();
        let deleted: i64 = self.bounded("del", cmd.query_async(&mut conn)).await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let cmd = redis::cmd("PING");
        let _pong: String = self.bounded("ping", cmd.query_async(&mut conn)).await?;
        Ok(())
    }
}
