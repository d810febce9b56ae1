//! Rate limiting logic and state management.

mod backend;
mod distributed;
mod identity;
mod limiter;
mod memory;
mod policy;

pub use backend::{open_store, AttemptResult, Store};
pub use distributed::{ban_key, count_key, RedisStore};
pub use identity::{IdentityKey, RequestIdentity, Scope};
pub use limiter::{Decision, RateLimiter};
pub use memory::MemoryStore;
pub use policy::{parse_token_limits, Policy, RateRule, Strategy, TokenRuleConfig, WINDOW};
