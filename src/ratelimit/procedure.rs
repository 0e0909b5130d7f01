//! Atomic procedures run by the shared store.
//!
//! Every admission decision is one procedure call: the store loads the key's
//! state, computes the outcome and writes the new state back without any
//! other procedure interleaving on that key. Each procedure has a Lua script
//! (for Redis) next to its native implementation (for [`MemoryStore`]), and
//! the two must agree.
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use serde::{Deserialize, Serialize};

use super::sliding_window::{self, WindowLog, WindowParams};
use super::token_bucket::{self, BucketParams, BucketState};
use crate::store::StoreError;

/// The outcome of a consuming check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Whole permits left after this decision
    pub remaining: u64,
    /// Seconds until the limiter is back to its idle state
    pub reset_in_seconds: f64,
    /// Seconds until a retry could succeed, present only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

/// A read-only snapshot of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Permits consumed within the current horizon
    pub used: u64,
    /// Whole permits still available
    pub remaining: u64,
    /// Seconds until the limiter is back to its idle state
    pub reset_in_seconds: f64,
}

/// What a procedure returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Decision(Decision),
    Usage(Usage),
}

/// State held under one key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredState {
    Bucket(BucketState),
    Log(WindowLog),
}

/// The closed set of procedures the limiters need.
#[derive(Debug, Clone, PartialEq)]
pub enum Procedure {
    /// Refill, then consume one token if available
    TakeToken(BucketParams),
    /// Refill preview without consuming or persisting
    PeekBucket(BucketParams),
    /// Prune, count, and log the request if under the limit
    RecordRequest { params: WindowParams, nonce: String },
    /// Prune and count without logging
    InspectWindow(WindowParams),
}

impl Procedure {
    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::TakeToken(_) => "take_token",
            Procedure::PeekBucket(_) => "peek_bucket",
            Procedure::RecordRequest { .. } => "record_request",
            Procedure::InspectWindow(_) => "inspect_window",
        }
    }

    /// Script arguments (`ARGV`), in the order the Lua source reads them.
    pub fn args(&self) -> Vec<String> {
        match self {
            Procedure::TakeToken(p) => {
                let (now_s, now_ns) = p.now_parts();
                vec![
                    p.capacity.to_string(),
                    p.window_seconds.to_string(),
                    now_s.to_string(),
                    now_ns.to_string(),
                    p.ttl_seconds.to_string(),
                ]
            }
            Procedure::PeekBucket(p) => {
                let (now_s, now_ns) = p.now_parts();
                vec![
                    p.capacity.to_string(),
                    p.window_seconds.to_string(),
                    now_s.to_string(),
                    now_ns.to_string(),
                ]
            }
            Procedure::RecordRequest { params, nonce } => vec![
                params.limit.to_string(),
                params.window_ms().to_string(),
                params.now_ms.to_string(),
                nonce.clone(),
                params.ttl_seconds.to_string(),
            ],
            Procedure::InspectWindow(p) => vec![
                p.limit.to_string(),
                p.window_ms().to_string(),
                p.now_ms.to_string(),
            ],
        }
    }

    /// Expiry refreshed on the key by this procedure, if any.
    pub fn ttl_seconds(&self) -> Option<u64> {
        match self {
            Procedure::TakeToken(p) => Some(p.ttl_seconds),
            Procedure::RecordRequest { params, .. } => Some(params.ttl_seconds),
            Procedure::PeekBucket(_) | Procedure::InspectWindow(_) => None,
        }
    }

    /// Run the procedure against in-process state.
    ///
    /// `slot` is the key's current live state; the procedure may fill,
    /// replace or empty it. The caller must hold exclusive access to the key
    /// for the whole call.
    pub fn apply(&self, key: &str, slot: &mut Option<StoredState>) -> Result<Reply, StoreError> {
        match self {
            Procedure::TakeToken(params) => {
                let current = match slot {
                    None => None,
                    Some(StoredState::Bucket(state)) => Some(*state),
                    Some(_) => return Err(wrong_type(key)),
                };
                let (state, decision) = token_bucket::take_token(current, params);
                *slot = Some(StoredState::Bucket(state));
                Ok(Reply::Decision(decision))
            }
            Procedure::PeekBucket(params) => {
                let current = match slot {
                    None => None,
                    Some(StoredState::Bucket(state)) => Some(&*state),
                    Some(_) => return Err(wrong_type(key)),
                };
                Ok(Reply::Usage(token_bucket::peek_bucket(current, params)))
            }
            Procedure::RecordRequest { params, nonce } => {
                let log = log_slot(key, slot)?;
                let decision = sliding_window::record_request(log, params, nonce);
                Ok(Reply::Decision(decision))
            }
            Procedure::InspectWindow(params) => {
                let log = log_slot(key, slot)?;
                let usage = sliding_window::inspect_window(log, params);
                if log.is_empty() {
                    *slot = None;
                }
                Ok(Reply::Usage(usage))
            }
        }
    }

    /// Decode the string array a Lua script returned.
    pub fn decode_reply(&self, fields: &[String]) -> Result<Reply, StoreError> {
        match self {
            Procedure::TakeToken(_) | Procedure::RecordRequest { .. } => {
                let [allowed, remaining, reset, retry] = self.numbers::<4>(fields)?;
                let allowed = allowed >= 1.0;
                Ok(Reply::Decision(Decision {
                    allowed,
                    remaining: remaining.max(0.0) as u64,
                    reset_in_seconds: reset.max(0.0),
                    retry_after: (!allowed).then(|| retry.max(0.0)),
                }))
            }
            Procedure::PeekBucket(_) | Procedure::InspectWindow(_) => {
                let [used, remaining, reset] = self.numbers::<3>(fields)?;
                Ok(Reply::Usage(Usage {
                    used: used.max(0.0) as u64,
                    remaining: remaining.max(0.0) as u64,
                    reset_in_seconds: reset.max(0.0),
                }))
            }
        }
    }

    fn numbers<const N: usize>(&self, fields: &[String]) -> Result<[f64; N], StoreError> {
        if fields.len() != N {
            return Err(StoreError::MalformedReply {
                procedure: self.name(),
                reason: format!("expected {} fields, got {}", N, fields.len()),
            });
        }

        let mut out = [0.0; N];
        for (slot, field) in out.iter_mut().zip(fields) {
            *slot = field.trim().parse().map_err(|_| StoreError::MalformedReply {
                procedure: self.name(),
                reason: format!("'{}' is not a number", field),
            })?;
        }
        Ok(out)
    }
}

fn log_slot<'a>(key: &str, slot: &'a mut Option<StoredState>) -> Result<&'a mut WindowLog, StoreError> {
    let state = slot.get_or_insert_with(|| StoredState::Log(WindowLog::default()));
    match state {
        StoredState::Log(log) => Ok(log),
        StoredState::Bucket(_) => Err(wrong_type(key)),
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

impl Reply {
    /// Unwrap a decision, or report which procedure answered with the wrong shape.
    pub fn into_decision(self, procedure: &Procedure) -> Result<Decision, StoreError> {
        match self {
            Reply::Decision(decision) => Ok(decision),
            Reply::Usage(_) => Err(StoreError::MalformedReply {
                procedure: procedure.name(),
                reason: "expected a decision, got usage".to_string(),
            }),
        }
    }

    /// Unwrap a usage snapshot.
    pub fn into_usage(self, procedure: &Procedure) -> Result<Usage, StoreError> {
        match self {
            Reply::Usage(usage) => Ok(usage),
            Reply::Decision(_) => Err(StoreError::MalformedReply {
                procedure: procedure.name(),
                reason: "expected usage, got a decision".to_string(),
            }),
        }
    }
}
