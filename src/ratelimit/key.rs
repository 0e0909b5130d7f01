//! Algorithm selection and store key derivation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TollgateError;

/// The admission algorithms Tollgate supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Bursts up to capacity, refilled continuously
    TokenBucket,
    /// Exact count over a trailing window
    SlidingWindow,
}

impl Algorithm {
    /// Every supported algorithm, in reset order.
    pub const ALL: [Algorithm; 2] = [Algorithm::TokenBucket, Algorithm::SlidingWindow];

    /// The fixed key prefix under which this algorithm keeps its state.
    pub fn prefix(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.prefix() == prefix)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for Algorithm {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_prefix(s.trim()).ok_or_else(|| {
            TollgateError::InvalidInput(format!(
                "unknown algorithm '{}', expected 'token_bucket' or 'sliding_window'",
                s
            ))
        })
    }
}

/// A key that uniquely addresses one limiter's state for one identifier.
///
/// Two algorithms never share a key for the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The algorithm owning this state
    pub algorithm: Algorithm,
    /// The caller's opaque identifier
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a new key.
    pub fn new(algorithm: Algorithm, identifier: &str) -> Self {
        Self {
            algorithm,
            identifier: identifier.to_string(),
        }
    }

    /// Render the store key: `"<prefix>:<identifier>"`.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.algorithm.prefix(), self.identifier)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = RateLimitKey::new(Algorithm::TokenBucket, "user_123");
        assert_eq!(key.to_store_key(), "token_bucket:user_123");

        let key = RateLimitKey::new(Algorithm::SlidingWindow, "192.168.1.1");
        assert_eq!(key.to_store_key(), "sliding_window:192.168.1.1");
    }

    #[test]
    fn test_algorithms_never_share_keys() {
        let a = RateLimitKey::new(Algorithm::TokenBucket, "same");
        let b = RateLimitKey::new(Algorithm::SlidingWindow, "same");
        assert_ne!(a.to_store_key(), b.to_store_key());
    }

    #[test]
    fn test_identifier_colons_kept_verbatim() {
        let key = RateLimitKey::new(Algorithm::SlidingWindow, "2001:db8::1");
        assert_eq!(key.to_store_key(), "sliding_window:2001:db8::1");
        assert_eq!(key.to_string(), key.to_store_key());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("token_bucket".parse::<Algorithm>().unwrap(), Algorithm::TokenBucket);
        assert_eq!(" sliding_window ".parse::<Algorithm>().unwrap(), Algorithm::SlidingWindow);

        let err = "leaky_bucket".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, TollgateError::InvalidInput(_)));
    }

    #[test]
    fn test_algorithm_serde_names() {
        let json = serde_json::to_string(&Algorithm::SlidingWindow).unwrap();
        assert_eq!(json, "\"sliding_window\"");

        let parsed: Algorithm = serde_json::from_str("\"token_bucket\"").unwrap();
        assert_eq!(parsed, Algorithm::TokenBucket);
    }
}
