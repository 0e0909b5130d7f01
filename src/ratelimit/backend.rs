//! The contract shared by both admission algorithms.

use async_trait::async_trait;

use super::key::Algorithm;
use super::procedure::{Decision, Usage};
use super::quota::Quota;
use crate::error::Result;

/// Trait for admission algorithms.
///
/// Implemented by [`TokenBucketLimiter`](super::TokenBucketLimiter) and
/// [`SlidingWindowLimiter`](super::SlidingWindowLimiter). Implementations hold
/// no state of their own; every call reads and writes the shared store in a
/// single atomic procedure and propagates store failures unchanged.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Which algorithm this is.
    fn algorithm(&self) -> Algorithm;

    /// Decide whether `identifier` may proceed, consuming a permit if so.
    async fn check(&self, identifier: &str, quota: &Quota) -> Result<Decision>;

    /// Report current usage without consuming.
    async fn status(&self, identifier: &str, quota: &Quota) -> Result<Usage>;

    /// Forget all state for `identifier`. Returns whether any existed.
    async fn reset(&self, identifier: &str) -> Result<bool>;
}
