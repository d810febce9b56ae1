//! The decision engine: picks an identity and rule, then asks the store.

use axum::http::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{AttemptResult, Store};
use super::identity::{RequestIdentity, Scope};
use super::policy::{Policy, RateRule, Strategy};
use crate::error::Result;

/// The admission decision handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Time left on the ban when denied
    pub retry_after: Duration,
    /// Quota left in the current window when allowed
    pub remaining: u64,
}

impl Decision {
    /// A decision made without consulting the store.
    pub fn permissive() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining: 0,
        }
    }
}

impl From<AttemptResult> for Decision {
    fn from(res: AttemptResult) -> Self {
        Self {
            allowed: res.allowed,
            retry_after: res.retry_after,
            remaining: res.remaining,
        }
    }
}

/// The rate limiter applying a [`Policy`] against one [`Store`].
///
/// The limiter itself is immutable; every bit of serialisation needed for
/// correctness lives in the store.
pub struct RateLimiter {
    policy: Policy,
    store: Arc<dyn Store>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(policy: Policy, store: Arc<dyn Store>) -> Self {
        Self { policy, store }
    }

    /// Pull the identity candidates out of a request.
    pub fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestIdentity {
        RequestIdentity::extract(headers, peer, &self.policy.api_key_header)
    }

    /// Decide whether a request from `identity` is admitted.
    ///
    /// At most one store call is made. Store errors are returned unchanged.
    pub async fn evaluate(&self, identity: &RequestIdentity) -> Result<Decision> {
        let Some((scope, key, rule)) = self.select(identity) else {
            debug!(
                strategy = ?self.policy.strategy,
                "No rate limit rule applies, allowing request"
            );
            return Ok(Decision::permissive());
        };

        trace!(scope = %scope, key = %key, limit = rule.limit(), "Evaluating request");

        let result = self.store.attempt(scope, key, &rule).await?;
        if !result.allowed {
            debug!(
                scope = %scope,
                key = %key,
                retry_after_ms = result.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        Ok(result.into())
    }

    /// Choose which identity and rule a request is counted under.
    fn select<'a>(&self, identity: &'a RequestIdentity) -> Option<(Scope, &'a str, RateRule)> {
        let policy = &self.policy;

        if policy.strategy.uses_token() {
            if let Some(token) = identity.credential.as_deref() {
                if let Some(rule) = policy.token_rules.get(token) {
                    return Some((Scope::Token, token, *rule));
                }
                if policy.strategy == Strategy::Token {
                    if let Some(rule) = policy.token_default {
                        return Some((Scope::Token, token, rule));
                    }
                }
            }
        }

        if policy.strategy.uses_ip() {
            if let Some(rule) = policy.ip_rule {
                return Some((Scope::Ip, identity.address.as_str(), rule));
            }
        }

        None
    }
}
