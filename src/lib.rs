//! Tollgate - Distributed Rate Limiting
//!
//! This crate grants or denies permission to proceed for callers identified
//! by an opaque key. Decisions are made by a token bucket or a sliding window
//! log whose state lives in a shared store (Redis), updated by atomic
//! server-side scripts so that any number of service instances enforce one
//! consistent limit without a distributed lock.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
