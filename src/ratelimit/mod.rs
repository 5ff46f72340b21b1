//! Rate limiting logic and state management.

mod backend;
mod key;
mod limiter;
mod policy;
mod shared;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{SharedOutcome, SharedWindowStore};
pub use key::RateLimitKey;
pub use limiter::{Backend, RateLimitDecision, RateLimiter, SharedStoreStatus};
pub use policy::RateLimitPolicy;
pub use shared::RedisWindowStore;
pub use window::{LocalWindowStore, WindowSnapshot};
