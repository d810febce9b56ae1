//! In-process store backed by one mutex-guarded table.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{AttemptResult, Store};
use super::identity::{IdentityKey, Scope};
use super::policy::RateRule;
use crate::error::{Result, TurnstileError};

/// Fixed-window counter for one identity.
#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    window_end: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    counters: HashMap<IdentityKey, Counter>,
    bans: HashMap<IdentityKey, Instant>,
}

impl Tables {
    fn attempt(&mut self, key: IdentityKey, rule: &RateRule, now: Instant) -> AttemptResult {
        if let Some(&until) = self.bans.get(&key) {
            if now < until {
                return AttemptResult::denied(until - now);
            }
            self.bans.remove(&key);
        }

        let counter = self
            .counters
            .entry(key.clone())
            .and_modify(|c| {
                if now > c.window_end {
                    *c = Counter {
                        count: 0,
                        window_end: now + rule.window(),
                    };
                }
            })
            .or_insert(Counter {
                count: 0,
                window_end: now + rule.window(),
            });

        counter.count += 1;

        if counter.count <= rule.limit() {
            let remaining = rule.limit() - counter.count;
            let reset = Utc::now()
                + chrono::Duration::from_std(counter.window_end - now)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            return AttemptResult::allowed(remaining, Some(reset));
        }

        if rule.ban().is_zero() {
            return AttemptResult::denied(Duration::ZERO);
        }

        // The ban replaces the window; whoever returns after it starts fresh.
        self.counters.remove(&key);
        let until = now + rule.ban();
        self.bans.insert(key, until);
        AttemptResult::denied(until - now)
    }

    /// Drop expired bans and counters whose window has closed.
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.counters.len() + self.bans.len();
        self.bans.retain(|_, until| now < *until);
        self.counters.retain(|_, c| now <= c.window_end);
        before - (self.counters.len() + self.bans.len())
    }
}

/// A store holding all counters and bans in process memory.
///
/// One lock covers every identity. The critical section is a few map
/// operations with no I/O, so coarse locking is cheaper than per-key locks.
#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that drops expired entries every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_sweeper(interval: Duration) -> Self {
        let store = Self::new();
        store.spawn_sweeper(interval);
        store
    }

    /// Start a background task that removes expired entries periodically.
    ///
    /// Expiry is also handled lazily on read, so this only bounds memory.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let tables = Arc::clone(&self.tables);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = tables.lock().sweep(Instant::now());
                if removed > 0 {
                    debug!(removed = removed, "Swept expired rate limit entries");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Number of identities with a live or stale counter.
    pub fn counter_count(&self) -> usize {
        self.tables.lock().counters.len()
    }

    /// Number of identities with a ban entry, expired or not.
    pub fn ban_count(&self) -> usize {
        self.tables.lock().bans.len()
    }

    fn attempt_at(&self, scope: Scope, key: &str, rule: &RateRule, now: Instant) -> AttemptResult {
        let identity = IdentityKey::new(scope, key);
        trace!(key = %identity, limit = rule.limit(), "Checking in-memory rate limit");
        self.tables.lock().attempt(identity, rule, now)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn attempt(&self, scope: Scope, key: &str, rule: &RateRule) -> Result<AttemptResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TurnstileError::BackendUnavailable(
                "store is closed".to_string(),
            ));
        }
        Ok(self.attempt_at(scope, key, rule, Instant::now()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
