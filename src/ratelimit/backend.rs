//! Store trait for abstracting the in-process and Redis implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::distributed::RedisStore;
use super::identity::Scope;
use super::memory::MemoryStore;
use super::policy::RateRule;
use crate::config::{StoreConfig, StoreDriver};
use crate::error::Result;

/// Outcome of one atomic check-increment-ban sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Quota left in the current window (meaningful when allowed)
    pub remaining: u64,
    /// Time left on the ban (meaningful when denied)
    pub retry_after: Duration,
    /// When the window counter returns to zero (set when allowed)
    pub window_reset: Option<DateTime<Utc>>,
}

impl AttemptResult {
    /// An admitted attempt.
    pub fn allowed(remaining: u64, window_reset: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
            window_reset,
        }
    }

    /// A rejected attempt.
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
            window_reset: None,
        }
    }
}

/// Trait for rate limit store implementations.
///
/// `attempt` is the only mutating entry point. For a fixed identity it must
/// behave as one indivisible step: check the ban, bump the window counter,
/// and install a ban when the counter crosses the limit.
#[async_trait]
pub trait Store: Send + Sync {
    /// Record one attempt for `scope`/`key` under `rule`.
    async fn attempt(&self, scope: Scope, key: &str, rule: &RateRule) -> Result<AttemptResult>;

    /// Release backend resources. Calling it more than once is harmless.
    async fn close(&self) -> Result<()>;
}

/// Build the store selected by configuration.
///
/// The Redis store connects and pings eagerly, so an unreachable server
/// fails here rather than on the first request.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.driver {
        StoreDriver::Memory => {
            let store = MemoryStore::new();
            if let Some(interval) = config.sweep_interval {
                store.spawn_sweeper(interval);
            }
            info!(sweep_interval = ?config.sweep_interval, "Using in-memory store");
            Ok(Arc::new(store))
        }
        StoreDriver::Redis => Ok(Arc::new(RedisStore::connect(&config.redis).await?)),
    }
}
