//! Validated limit and window pairs.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Largest accepted `limit`.
pub const MAX_LIMIT: u64 = 100_000;
/// Largest accepted window, one day.
pub const MAX_WINDOW_SECONDS: u64 = 86_400;

/// A limit of `limit` permits per `window_seconds`.
///
/// Both values are checked on construction, so the algorithms never divide
/// by a zero window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawQuota")]
pub struct Quota {
    limit: u64,
    window_seconds: u64,
}

#[derive(Deserialize)]
struct RawQuota {
    limit: u64,
    window_seconds: u64,
}

impl TryFrom<RawQuota> for Quota {
    type Error = TollgateError;

    fn try_from(raw: RawQuota) -> Result<Self> {
        Quota::new(raw.limit, raw.window_seconds)
    }
}

impl Quota {
    /// Validate and build a quota.
    pub fn new(limit: u64, window_seconds: u64) -> Result<Self> {
        if limit == 0 || limit > MAX_LIMIT {
            return Err(TollgateError::InvalidInput(format!(
                "limit must be between 1 and {}, got {}",
                MAX_LIMIT, limit
            )));
        }
        if window_seconds == 0 || window_seconds > MAX_WINDOW_SECONDS {
            return Err(TollgateError::InvalidInput(format!(
                "window_seconds must be between 1 and {}, got {}",
                MAX_WINDOW_SECONDS, window_seconds
            )));
        }

        Ok(Self {
            limit,
            window_seconds,
        })
    }

    /// Maximum permits per window (the bucket capacity for token buckets).
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in seconds.
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Inactivity expiry applied to stored state: twice the window.
    pub fn state_ttl_seconds(&self) -> u64 {
        self.window_seconds * 2
    }
}
