//! The rate limiter facade used by request layers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::backend::Admission;
use super::key::Algorithm;
use super::procedure::{Decision, Usage};
use super::quota::Quota;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::AtomicStore;

/// Validates input, selects the algorithm and delegates to it.
///
/// Cheap to share: wrap in an `Arc` and hand it to every task. All state
/// lives in the store.
pub struct RateLimiter {
    store: Arc<dyn AtomicStore>,
    token_bucket: TokenBucketLimiter,
    sliding_window: SlidingWindowLimiter,
}

impl RateLimiter {
    /// Create a rate limiter over `store` using the system clock.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            token_bucket: TokenBucketLimiter::new(store.clone(), clock.clone()),
            sliding_window: SlidingWindowLimiter::new(store.clone(), clock),
            store,
        }
    }

    /// The limiter for `algorithm`.
    pub fn limiter(&self, algorithm: Algorithm) -> &dyn Admission {
        match algorithm {
            Algorithm::TokenBucket => &self.token_bucket,
            Algorithm::SlidingWindow => &self.sliding_window,
        }
    }

    /// Check and, if allowed, consume one permit for `identifier`.
    pub async fn check(
        &self,
        identifier: &str,
        algorithm: Algorithm,
        limit: u64,
        window_seconds: u64,
    ) -> Result<Decision> {
        validate_identifier(identifier)?;
        let quota = Quota::new(limit, window_seconds)?;

        let decision = self.limiter(algorithm).check(identifier, &quota).await?;

        if !decision.allowed {
            warn!(
                identifier = %identifier,
                algorithm = %algorithm,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Current usage for `identifier`; never consumes.
    pub async fn status(
        &self,
        identifier: &str,
        algorithm: Algorithm,
        limit: u64,
        window_seconds: u64,
    ) -> Result<Usage> {
        validate_identifier(identifier)?;
        let quota = Quota::new(limit, window_seconds)?;

        debug!(identifier = %identifier, algorithm = %algorithm, "Status check");
        self.limiter(algorithm).status(identifier, &quota).await
    }

    /// Clear state for one algorithm, or for all when `algorithm` is `None`.
    ///
    /// Returns how many algorithms actually had state for `identifier`.
    pub async fn reset(&self, identifier: &str, algorithm: Option<Algorithm>) -> Result<usize> {
        validate_identifier(identifier)?;

        let targets: &[Algorithm] = match algorithm {
            Some(ref one) => std::slice::from_ref(one),
            None => &Algorithm::ALL,
        };

        let mut cleared = 0;
        for target in targets {
            if self.limiter(*target).reset(identifier).await? {
                cleared += 1;
            }
        }

        info!(
            identifier = %identifier,
            algorithm = %algorithm.map_or("all".to_string(), |a| a.to_string()),
            cleared = cleared,
            "Rate limit reset"
        );

        Ok(cleared)
    }

    /// Whether the store answers a ping.
    pub async fn is_healthy(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Health check failed: store not reachable");
                false
            }
        }
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(TollgateError::InvalidInput(
            "identifier must not be empty".to_string(),
        ));
    }
    Ok(())
}
