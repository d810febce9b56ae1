//! Rate rules and the resolved admission policy.
//!
//! Configuration is loose (plain integers and durations); everything here is
//! validated so that a rule with a zero limit never reaches a store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LimitsConfig;
use crate::error::{Result, TurnstileError};

/// Every window is one second wide; only limit and ban vary between rules.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Which identities are evaluated for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Client address only
    Ip,
    /// Credential only
    Token,
    /// Credential rules first, then the client address
    #[default]
    Both,
}

impl Strategy {
    pub fn uses_token(&self) -> bool {
        matches!(self, Strategy::Token | Strategy::Both)
    }

    pub fn uses_ip(&self) -> bool {
        matches!(self, Strategy::Ip | Strategy::Both)
    }
}

/// A validated rate rule: `limit` requests per `window`, then `ban`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    limit: u64,
    window: Duration,
    ban: Duration,
}

impl RateRule {
    /// Create a rule. Fails with `InvalidRule` when limit or window is zero.
    ///
    /// A zero `ban` is allowed and means rejections install no ban.
    pub fn new(limit: u64, window: Duration, ban: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::InvalidRule(
                "limit must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::InvalidRule(
                "window must be greater than zero".to_string(),
            ));
        }
        Ok(Self { limit, window, ban })
    }

    /// A rule over the fixed one-second window.
    pub fn per_second(limit: u64, ban: Duration) -> Result<Self> {
        Self::new(limit, WINDOW, ban)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn ban(&self) -> Duration {
        self.ban
    }
}

/// The immutable policy consulted by the rate limiter.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Which identities to evaluate
    pub strategy: Strategy,
    /// Header carrying the credential
    pub api_key_header: String,
    /// Default rule for client addresses (absent under `token` strategy)
    pub ip_rule: Option<RateRule>,
    /// Default rule for credentials, only applied under `token` strategy
    pub token_default: Option<RateRule>,
    /// Bespoke per-credential rules
    pub token_rules: HashMap<String, RateRule>,
}

impl Policy {
    /// Resolve and validate the policy from configuration.
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        let ip_rule = if config.strategy.uses_ip() {
            let rule = RateRule::per_second(config.ip_limit_per_second, config.ip_ban)
                .map_err(context("ip rule"))?;
            Some(rule)
        } else {
            None
        };

        // A zero default limit means "not configured" for credentials.
        let token_default = if config.token_default_limit_per_second > 0 {
            Some(
                RateRule::per_second(
                    config.token_default_limit_per_second,
                    config.token_default_ban,
                )
                .map_err(context("default token rule"))?,
            )
        } else {
            None
        };

        let mut token_rules = HashMap::new();
        for (token, rule) in config.resolved_token_rules() {
            let resolved = RateRule::per_second(rule.limit_per_second, rule.ban)
                .map_err(context(&format!("token rule {token:?}")))?;
            token_rules.insert(token, resolved);
        }

        if config.strategy == Strategy::Token && token_default.is_none() {
            warn!(
                "Strategy is 'token' without a default token limit; \
                 requests with unknown or missing credentials will be allowed"
            );
        }

        info!(
            strategy = ?config.strategy,
            token_rules = token_rules.len(),
            "Rate limit policy resolved"
        );

        Ok(Self {
            strategy: config.strategy,
            api_key_header: config.api_key_header.clone(),
            ip_rule,
            token_default,
            token_rules,
        })
    }
}

fn context(label: &str) -> impl FnOnce(TurnstileError) -> TurnstileError + '_ {
    move |err| match err {
        TurnstileError::InvalidRule(msg) => TurnstileError::InvalidRule(format!("{label}: {msg}")),
        other => other,
    }
}

/// A credential rule as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRuleConfig {
    /// Requests allowed per second
    pub limit_per_second: u64,
    /// Ban applied after the limit is exceeded
    #[serde(default, with = "humantime_serde")]
    pub ban: Duration,
}

/// Parse the compact `token:limit:duration,...` form.
///
/// Malformed entries are skipped with a warning.
pub fn parse_token_limits(raw: &str) -> HashMap<String, TokenRuleConfig> {
    let mut rules = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
        let [token, limit, ban] = fields.as_slice() else {
            warn!(entry = %entry, "Skipping token limit entry without three fields");
            continue;
        };

        let limit = limit.parse::<u64>();
        let ban = humantime::parse_duration(ban);
        match (limit, ban) {
            (Ok(limit_per_second), Ok(ban)) if !token.is_empty() => {
                rules.insert(
                    token.to_string(),
                    TokenRuleConfig {
                        limit_per_second,
                        ban,
                    },
                );
            }
            _ => warn!(entry = %entry, "Skipping malformed token limit entry"),
        }
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_rejects_zero_limit() {
        let err = RateRule::per_second(0, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule(_)));
    }

    #[test]
    fn test_rule_rejects_zero_window() {
        let err = RateRule::new(5, Duration::ZERO, Duration::ZERO).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule(_)));
    }

    #[test]
    fn test_rule_allows_zero_ban() {
        let rule = RateRule::per_second(3, Duration::ZERO).unwrap();
        assert_eq!(rule.limit(), 3);
        assert_eq!(rule.window(), WINDOW);
        assert!(rule.ban().is_zero());
    }

    #[test]
    fn test_strategy_flags() {
        assert!(Strategy::Both.uses_ip() && Strategy::Both.uses_token());
        assert!(Strategy::Ip.uses_ip() && !Strategy::Ip.uses_token());
        assert!(!Strategy::Token.uses_ip() && Strategy::Token.uses_token());
    }

    #[test]
    fn test_parse_token_limits() {
        let rules = parse_token_limits("abc123:10:1m, premium : 100 : 30s");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["abc123"].limit_per_second, 10);
        assert_eq!(rules["abc123"].ban, Duration::from_secs(60));
        assert_eq!(rules["premium"].limit_per_second, 100);
        assert_eq!(rules["premium"].ban, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_token_limits_skips_malformed() {
        let rules = parse_token_limits("good:5:1s,bad:x:1s,short:5,:5:1s,late:5:soon,,");
        assert_eq!(rules.len(), 1);
        assert!(rules.contains_key("good"));
    }

    #[test]
    fn test_policy_rejects_zero_ip_limit() {
        let config = LimitsConfig {
            strategy: Strategy::Ip,
            ip_limit_per_second: 0,
            ..LimitsConfig::default()
        };
        let err = Policy::from_config(&config).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule(_)));
    }

    #[test]
    fn test_policy_ignores_ip_limit_under_token_strategy() {
        let config = LimitsConfig {
            strategy: Strategy::Token,
            ip_limit_per_second: 0,
            ..LimitsConfig::default()
        };
        let policy = Policy::from_config(&config).unwrap();
        assert!(policy.ip_rule.is_none());
        assert!(policy.token_default.is_none());
    }

    #[test]
    fn test_policy_rejects_zero_bespoke_limit() {
        let mut config = LimitsConfig::default();
        config.token_rules.insert(
            "free".to_string(),
            TokenRuleConfig {
                limit_per_second: 0,
                ban: Duration::from_secs(1),
            },
        );
        let err = Policy::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("free"));
    }

    #[test]
    fn test_policy_merges_compact_token_limits() {
        let config = LimitsConfig {
            token_limits: Some("abc123:3:300ms".to_string()),
            ..LimitsConfig::default()
        };
        let policy = Policy::from_config(&config).unwrap();
        let rule = policy.token_rules["abc123"];
        assert_eq!(rule.limit(), 3);
        assert_eq!(rule.ban(), Duration::from_millis(300));
    }
}
