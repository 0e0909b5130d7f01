//! Token bucket limiter.
//!
//! Each identifier owns a bucket of at most `capacity` tokens that refills
//! continuously at `capacity / window_seconds` tokens per second. A check
//! consumes one whole token; fractional tokens accumulate between checks.
//! Bursts up to `capacity` are allowed, the long-run rate is bounded by the
//! refill rate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, trace};

use super::backend::Admission;
use super::key::{Algorithm, RateLimitKey};
use super::procedure::{Decision, Procedure, Usage};
use super::quota::Quota;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::AtomicStore;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Persisted bucket state (a Redis hash with `tokens`, `refill_s` and `refill_ns`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently in the bucket, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Epoch nanoseconds up to which refill has been accounted
    pub last_refill_ns: i64,
}

/// Arguments for the bucket procedures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    pub window_seconds: u64,
    /// Caller's clock, epoch nanoseconds
    pub now_ns: i64,
    pub ttl_seconds: u64,
}

impl BucketParams {
    pub fn new(quota: &Quota, now_ns: i64) -> Self {
        Self {
            capacity: quota.limit() as f64,
            window_seconds: quota.window_seconds(),
            now_ns,
            ttl_seconds: quota.state_ttl_seconds(),
        }
    }

    /// `now_ns` split into whole seconds and the nanoseconds past them, each
    /// exact as a Lua number.
    pub fn now_parts(&self) -> (i64, i64) {
        (
            self.now_ns.div_euclid(NANOS_PER_SEC),
            self.now_ns.rem_euclid(NANOS_PER_SEC),
        )
    }

    /// Tokens earned over `elapsed_ns`.
    ///
    /// The integer elapsed time is multiplied by the capacity before the
    /// division, so waiting one full refill interval earns at least one token.
    fn tokens_earned(&self, elapsed_ns: i64) -> f64 {
        elapsed_ns as f64 * self.capacity / (self.window_seconds as f64 * NANOS_PER_SEC as f64)
    }

    /// Seconds needed to earn `tokens`.
    fn seconds_to_earn(&self, tokens: f64) -> f64 {
        tokens * self.window_seconds as f64 / self.capacity
    }
}

/// Tokens available at `params.now_ns`, and the instant refill is accounted up to.
///
/// A missing bucket starts full. If `now_ns` lies before the stored refill
/// instant (another instance's clock runs ahead) no tokens are added and the
/// stored instant is kept, so skew can delay refill but never double it.
fn refill(state: Option<&BucketState>, params: &BucketParams) -> (f64, i64) {
    match state {
        None => (params.capacity, params.now_ns),
        Some(state) => {
            let elapsed_ns = params.now_ns - state.last_refill_ns;
            if elapsed_ns > 0 {
                let tokens = (state.tokens + params.tokens_earned(elapsed_ns)).min(params.capacity);
                (tokens, params.now_ns)
            } else {
                (state.tokens, state.last_refill_ns)
            }
        }
    }
}

fn seconds_until_full(tokens: f64, params: &BucketParams) -> f64 {
    if tokens < params.capacity {
        params.seconds_to_earn(params.capacity - tokens)
    } else {
        0.0
    }
}

/// Refill, then consume one token if a whole one is available.
///
/// The refill instant advances on denial too; otherwise the next call would
/// count the same elapsed time twice.
pub fn take_token(state: Option<BucketState>, params: &BucketParams) -> (BucketState, Decision) {
    let (mut tokens, last_refill_ns) = refill(state.as_ref(), params);

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    let decision = Decision {
        allowed,
        remaining: tokens.floor() as u64,
        reset_in_seconds: seconds_until_full(tokens, params),
        retry_after: (!allowed).then(|| params.seconds_to_earn(1.0 - tokens)),
    };

    (BucketState { tokens, last_refill_ns }, decision)
}

/// Refill preview. Nothing is consumed or written.
pub fn peek_bucket(state: Option<&BucketState>, params: &BucketParams) -> Usage {
    if state.is_none() {
        return Usage {
            used: 0,
            remaining: params.capacity as u64,
            reset_in_seconds: 0.0,
        };
    }

    let (tokens, _) = refill(state, params);
    Usage {
        used: (params.capacity - tokens).floor() as u64,
        remaining: tokens.floor() as u64,
        reset_in_seconds: seconds_until_full(tokens, params),
    }
}

/// KEYS[1] bucket key; ARGV capacity, window_seconds, now_s, now_ns, ttl.
pub const TAKE_TOKEN_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now_s = tonumber(ARGV[3])
local now_ns = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'refill_s', 'refill_ns')
local tokens = tonumber(bucket[1])
local refill_s = tonumber(bucket[2])
local refill_ns = tonumber(bucket[3])

if tokens == nil or refill_s == nil or refill_ns == nil then
    tokens = capacity
    refill_s = now_s
    refill_ns = now_ns
end

local elapsed_ns = (now_s - refill_s) * 1000000000 + (now_ns - refill_ns)
if elapsed_ns > 0 then
    tokens = math.min(capacity, tokens + elapsed_ns * capacity / (window * 1000000000))
    refill_s = now_s
    refill_ns = now_ns
end

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

local reset_in = 0
if tokens < capacity then
    reset_in = (capacity - tokens) * window / capacity
end

local retry_after = 0
if allowed == 0 then
    retry_after = (1 - tokens) * window / capacity
end

redis.call('HSET', key,
    'tokens', string.format('%.17g', tokens),
    'refill_s', string.format('%.0f', refill_s),
    'refill_ns', string.format('%.0f', refill_ns))
redis.call('EXPIRE', key, ttl)

return {
    tostring(allowed),
    string.format('%.17g', math.floor(tokens)),
    string.format('%.17g', reset_in),
    string.format('%.17g', retry_after)
}
"#;

/// KEYS[1] bucket key; ARGV capacity, window_seconds, now_s, now_ns.
pub const PEEK_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now_s = tonumber(ARGV[3])
local now_ns = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'refill_s', 'refill_ns')
local tokens = tonumber(bucket[1])
local refill_s = tonumber(bucket[2])
local refill_ns = tonumber(bucket[3])

if tokens == nil or refill_s == nil or refill_ns == nil then
    return {'0', string.format('%.17g', capacity), '0'}
end

local elapsed_ns = (now_s - refill_s) * 1000000000 + (now_ns - refill_ns)
if elapsed_ns > 0 then
    tokens = math.min(capacity, tokens + elapsed_ns * capacity / (window * 1000000000))
end

local reset_in = 0
if tokens < capacity then
    reset_in = (capacity - tokens) * window / capacity
end

return {
    string.format('%.17g', math.floor(capacity - tokens)),
    string.format('%.17g', math.floor(tokens)),
    string.format('%.17g', reset_in)
}
"#;

/// Token bucket admission over a shared atomic store.
pub struct TokenBucketLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter over an injected store handle and clock.
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn key(identifier: &str) -> String {
        RateLimitKey::new(Algorithm::TokenBucket, identifier).to_store_key()
    }

    /// Refill and try to consume one token for `identifier`.
    pub async fn check(&self, identifier: &str, quota: &Quota) -> Result<Decision> {
        let key = Self::key(identifier);
        let procedure = Procedure::TakeToken(BucketParams::new(quota, self.clock.now_nanos()));

        trace!(
            key = %key,
            capacity = quota.limit(),
            window_seconds = quota.window_seconds(),
            "Checking token bucket"
        );

        let reply = self.store.execute(&key, &procedure).await.map_err(|e| {
            error!(key = %key, error = %e, "Token bucket check failed");
            e
        })?;
        let decision = reply.into_decision(&procedure)?;

        if !decision.allowed {
            debug!(
                key = %key,
                retry_after = ?decision.retry_after,
                "Token bucket exhausted"
            );
        }

        Ok(decision)
    }

    /// Report the bucket's refilled level without consuming.
    pub async fn status(&self, identifier: &str, quota: &Quota) -> Result<Usage> {
        let key = Self::key(identifier);
        let procedure = Procedure::PeekBucket(BucketParams::new(quota, self.clock.now_nanos()));

        let reply = self.store.execute(&key, &procedure).await.map_err(|e| {
            error!(key = %key, error = %e, "Token bucket status failed");
            e
        })?;
        Ok(reply.into_usage(&procedure)?)
    }

    /// Delete the bucket. Returns whether one existed.
    pub async fn reset(&self, identifier: &str) -> Result<bool> {
        let key = Self::key(identifier);
        let existed = self.store.delete_key(&key).await.map_err(|e| {
            error!(key = %key, error = %e, "Token bucket reset failed");
            e
        })?;

        info!(key = %key, existed = existed, "Reset token bucket");
        Ok(existed)
    }
}

#[async_trait]
impl Admission for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn check(&self, identifier: &str, quota: &Quota) -> Result<Decision> {
        self.check(identifier, quota).await
    }

    async fn status(&self, identifier: &str, quota: &Quota) -> Result<Usage> {
        self.status(identifier, quota).await
    }

    async fn reset(&self, identifier: &str) -> Result<bool> {
        self.reset(identifier).await
    }
}
