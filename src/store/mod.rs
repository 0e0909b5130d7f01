//! The shared store that serializes every admission decision.
//!
//! Limiters never read-modify-write state themselves. They hand a
//! [`Procedure`] to an [`AtomicStore`], which runs the whole load, compute and
//! store sequence without interleaving with any other procedure on the same
//! key. Procedures on different keys may run in parallel.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::{Procedure, Reply};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors surfaced by a store.
///
/// None of these are ever turned into an allow or a deny by the limiters;
/// the caller decides whether to fail open or closed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("store command failed: {0}")]
    Redis(::redis::RedisError),
    #[error("malformed reply from {procedure}: {reason}")]
    MalformedReply {
        procedure: &'static str,
        reason: String,
    },
    #[error("key {key} holds state of another kind")]
    WrongType { key: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Redis(err)
        }
    }
}

/// Trait for stores able to run procedures atomically.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run `procedure` against `key` as one indivisible step.
    ///
    /// A failure means the procedure may or may not have been applied; it is
    /// never reported as a partial result.
    async fn execute(&self, key: &str, procedure: &Procedure) -> Result<Reply, StoreError>;

    /// Delete `key`. Returns whether a live key existed.
    async fn delete_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Round-trip to the store.
    async fn ping(&self) -> Result<(), StoreError>;
}
