//! Sliding window log limiter.
//!
//! Every admitted request is logged with its millisecond timestamp in an
//! ordered set. A check prunes entries that left the trailing window, counts
//! what is left and logs the new request only if the count is under the
//! limit. The count is exact with no fixed-window boundary effects, at the
//! price of O(limit) entries per active identifier.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use super::backend::Admission;
use super::key::{Algorithm, RateLimitKey};
use super::procedure::{Decision, Procedure, Usage};
use super::quota::Quota;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::AtomicStore;

/// Arguments for the window procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub limit: u64,
    pub window_seconds: u64,
    /// Caller's clock, epoch milliseconds
    pub now_ms: i64,
    pub ttl_seconds: u64,
}

impl WindowParams {
    pub fn new(quota: &Quota, now_ms: i64) -> Self {
        Self {
            limit: quota.limit(),
            window_seconds: quota.window_seconds(),
            now_ms,
            ttl_seconds: quota.state_ttl_seconds(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_seconds as i64 * 1000
    }

    /// Entries stamped at or before this instant are outside the window.
    pub fn window_start(&self) -> i64 {
        self.now_ms - self.window_ms()
    }
}

/// The request log for one key, ordered like a Redis sorted set:
/// by timestamp, then by member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowLog {
    entries: BTreeSet<(i64, String)>,
}

impl WindowLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log a request. Same-millisecond requests stay distinct through the nonce.
    pub fn insert(&mut self, timestamp_ms: i64, nonce: &str) {
        self.entries
            .insert((timestamp_ms, format!("{}:{}", timestamp_ms, nonce)));
    }

    /// Drop every entry stamped at or before `window_start`.
    pub fn prune(&mut self, window_start: i64) {
        self.entries = self.entries.split_off(&(window_start + 1, String::new()));
    }

    pub fn oldest(&self) -> Option<i64> {
        self.entries.first().map(|(ts, _)| *ts)
    }

    /// Seconds until every current entry has left the window; the full
    /// window when the log is empty.
    fn seconds_until_empty(&self, params: &WindowParams) -> f64 {
        match self.oldest() {
            Some(oldest) => {
                let ms = (oldest + params.window_ms() - params.now_ms).max(0);
                ms as f64 / 1000.0
            }
            None => params.window_seconds as f64,
        }
    }
}

/// Prune, count, and log the request if the window has room.
pub fn record_request(log: &mut WindowLog, params: &WindowParams, nonce: &str) -> Decision {
    log.prune(params.window_start());
    let count = log.len() as u64;

    let allowed = count < params.limit;
    if allowed {
        log.insert(params.now_ms, nonce);
    }

    let reset_in_seconds = log.seconds_until_empty(params);

    Decision {
        allowed,
        remaining: if allowed { params.limit - count - 1 } else { 0 },
        reset_in_seconds,
        // On denial nothing was inserted, so the oldest entry is also the
        // first one to free a slot.
        retry_after: (!allowed).then_some(reset_in_seconds),
    }
}

/// Prune and count without logging.
pub fn inspect_window(log: &mut WindowLog, params: &WindowParams) -> Usage {
    log.prune(params.window_start());
    let count = log.len() as u64;

    Usage {
        used: count,
        remaining: params.limit.saturating_sub(count),
        reset_in_seconds: log.seconds_until_empty(params),
    }
}

/// KEYS[1] log key; ARGV limit, window_ms, now_ms, nonce, ttl.
pub const RECORD_REQUEST_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local nonce = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local count = redis.call('ZCARD', key)

local allowed = 0
local remaining = 0
if count < limit then
    redis.call('ZADD', key, now, ARGV[3] .. ':' .. nonce)
    allowed = 1
    remaining = limit - count - 1
end

local reset_in = window_ms / 1000
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest >= 2 then
    reset_in = math.max(0, tonumber(oldest[2]) + window_ms - now) / 1000
end

local retry_after = 0
if allowed == 0 then
    retry_after = reset_in
end

redis.call('EXPIRE', key, ttl)

return {
    tostring(allowed),
    string.format('%.17g', remaining),
    string.format('%.17g', reset_in),
    string.format('%.17g', retry_after)
}
"#;

/// KEYS[1] log key; ARGV limit, window_ms, now_ms.
pub const INSPECT_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local count = redis.call('ZCARD', key)

local reset_in = window_ms / 1000
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest >= 2 then
    reset_in = math.max(0, tonumber(oldest[2]) + window_ms - now) / 1000
end

return {
    string.format('%.17g', count),
    string.format('%.17g', math.max(0, limit - count)),
    string.format('%.17g', reset_in)
}
"#;

/// Sliding window log admission over a shared atomic store.
pub struct SlidingWindowLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter over an injected store handle and clock.
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn key(identifier: &str) -> String {
        RateLimitKey::new(Algorithm::SlidingWindow, identifier).to_store_key()
    }

    /// Count the trailing window and log this request if it is admitted.
    pub async fn check(&self, identifier: &str, quota: &Quota) -> Result<Decision> {
        let key = Self::key(identifier);
        let procedure = Procedure::RecordRequest {
            params: WindowParams::new(quota, self.clock.now_millis()),
            nonce: Uuid::new_v4().simple().to_string(),
        };

        trace!(
            key = %key,
            limit = quota.limit(),
            window_seconds = quota.window_seconds(),
            "Checking sliding window"
        );

        let reply = self.store.execute(&key, &procedure).await.map_err(|e| {
            error!(key = %key, error = %e, "Sliding window check failed");
            e
        })?;
        let decision = reply.into_decision(&procedure)?;

        if !decision.allowed {
            debug!(
                key = %key,
                retry_after = ?decision.retry_after,
                "Sliding window full"
            );
        }

        Ok(decision)
    }

    /// Count the trailing window without logging a request.
    pub async fn status(&self, identifier: &str, quota: &Quota) -> Result<Usage> {
        let key = Self::key(identifier);
        let procedure = Procedure::InspectWindow(WindowParams::new(quota, self.clock.now_millis()));

        let reply = self.store.execute(&key, &procedure).await.map_err(|e| {
            error!(key = %key, error = %e, "Sliding window status failed");
            e
        })?;
        Ok(reply.into_usage(&procedure)?)
    }

    /// Delete the log. Returns whether one existed.
    pub async fn reset(&self, identifier: &str) -> Result<bool> {
        let key = Self::key(identifier);
        let existed = self.store.delete_key(&key).await.map_err(|e| {
            error!(key = %key, error = %e, "Sliding window reset failed");
            e
        })?;

        info!(key = %key, existed = existed, "Reset sliding window");
        Ok(existed)
    }
}

#[async_trait]
impl Admission for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
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
