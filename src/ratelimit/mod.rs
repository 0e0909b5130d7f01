//! Admission algorithms and the procedures they run on the shared store.

mod backend;
mod key;
mod limiter;
mod procedure;
mod quota;
pub mod sliding_window;
pub mod token_bucket;

pub use backend::Admission;
pub use key::{Algorithm, RateLimitKey};
pub use limiter::RateLimiter;
pub use procedure::{Decision, Procedure, Reply, StoredState, Usage};
pub use quota::{Quota, MAX_LIMIT, MAX_WINDOW_SECONDS};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
