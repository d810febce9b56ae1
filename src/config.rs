//! Configuration management for Turnstile.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional YAML file, then `TURNSTILE__`-prefixed environment variables
//! (`TURNSTILE__LIMITS__IP_LIMIT_PER_SECOND=10`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{parse_token_limits, Strategy, TokenRuleConfig};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting policy
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Store selection and connection parameters
    #[serde(default)]
    pub store: StoreConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting policy as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Which identities to evaluate
    #[serde(default)]
    pub strategy: Strategy,

    /// Header carrying the API credential
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Requests per second allowed for one client address
    #[serde(default = "default_ip_limit")]
    pub ip_limit_per_second: u64,

    /// Ban applied to an address that exceeds its limit
    #[serde(default = "default_ip_ban", with = "humantime_serde")]
    pub ip_ban: Duration,

    /// Default credential limit under the `token` strategy (0 disables)
    #[serde(default)]
    pub token_default_limit_per_second: u64,

    /// Ban applied by the default credential rule
    #[serde(default, with = "humantime_serde")]
    pub token_default_ban: Duration,

    /// Bespoke per-credential rules
    #[serde(default)]
    pub token_rules: HashMap<String, TokenRuleConfig>,

    /// Compact `token:limit:duration,...` rules, merged into `token_rules`
    #[serde(default)]
    pub token_limits: Option<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            api_key_header: default_api_key_header(),
            ip_limit_per_second: default_ip_limit(),
            ip_ban: default_ip_ban(),
            token_default_limit_per_second: 0,
            token_default_ban: Duration::ZERO,
            token_rules: HashMap::new(),
            token_limits: None,
        }
    }
}

impl LimitsConfig {
    /// Bespoke rules from both the structured map and the compact form.
    ///
    /// Entries in `token_rules` win over the compact form.
    pub fn resolved_token_rules(&self) -> HashMap<String, TokenRuleConfig> {
        let mut rules = self
            .token_limits
            .as_deref()
            .map(parse_token_limits)
            .unwrap_or_default();
        rules.extend(self.token_rules.iter().map(|(k, v)| (k.clone(), *v)));
        rules
    }
}

fn default_api_key_header() -> String {
    "API_KEY".to_string()
}

fn default_ip_limit() -> u64 {
    5
}

fn default_ip_ban() -> Duration {
    Duration::from_secs(300)
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// In-process, single instance
    Memory,
    /// Shared Redis instance
    #[default]
    Redis,
}

impl std::str::FromStr for StoreDriver {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreDriver::Memory),
            "redis" => Ok(StoreDriver::Redis),
            other => Err(TurnstileError::Config(format!("unknown store driver {other:?}"))),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub driver: StoreDriver,

    /// How often the memory store drops expired entries (off when unset)
    #[serde(default, with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,

    /// Redis connection parameters
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `host:port` of the Redis server
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Bound on connecting and the startup ping
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Bound on each rate limit round trip
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: None,
            db: 0,
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}/{}", password, self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }
}

fn default_redis_addr() -> String {
    "redis:6379".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }

        let mut config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        // Credentials are case-sensitive map keys; restore the file's spelling.
        if let Some(path) = path.filter(|p| p.exists()) {
            let from_file = Self::from_file(path)?.limits.token_rules;
            config.limits.token_rules =
                restore_token_case(std::mem::take(&mut config.limits.token_rules), &from_file);
        }

        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

/// Re-key layered token rules with the exact credentials written in the file.
///
/// Values come from the layered map, so environment overrides still apply.
/// Entries only present in the environment keep the key they arrived with.
fn restore_token_case(
    layered: HashMap<String, TokenRuleConfig>,
    from_file: &HashMap<String, TokenRuleConfig>,
) -> HashMap<String, TokenRuleConfig> {
    let mut rules = HashMap::with_capacity(layered.len().max(from_file.len()));

    for (key, rule) in layered {
        let exact = from_file
            .keys()
            .find(|candidate| candidate.eq_ignore_ascii_case(&key))
            .cloned()
            .unwrap_or(key);
        rules.insert(exact, rule);
    }

    for (key, rule) in from_file {
        rules.entry(key.clone()).or_insert(*rule);
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.limits.strategy, Strategy::Both);
        assert_eq!(config.limits.api_key_header, "API_KEY");
        assert_eq!(config.limits.ip_limit_per_second, 5);
        assert_eq!(config.limits.ip_ban, Duration::from_secs(300));
        assert_eq!(config.limits.token_default_limit_per_second, 0);
        assert_eq!(config.store.driver, StoreDriver::Redis);
        assert_eq!(config.store.redis.addr, "redis:6379");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: 127.0.0.1:9000
limits:
  strategy: token
  api_key_header: X-Api-Key
  token_default_limit_per_second: 20
  token_default_ban: 30s
  token_rules:
    abc123:
      limit_per_second: 3
      ban: 300ms
store:
  driver: memory
  sweep_interval: 1m
logging:
  format: json
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.limits.strategy, Strategy::Token);
        assert_eq!(config.limits.api_key_header, "X-Api-Key");
        assert_eq!(config.limits.token_default_ban, Duration::from_secs(30));
        assert_eq!(
            config.limits.token_rules["abc123"].ban,
            Duration::from_millis(300)
        );
        assert_eq!(config.store.driver, StoreDriver::Memory);
        assert_eq!(config.store.sweep_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_structured_rules_win_over_compact_form() {
        let mut limits = LimitsConfig {
            token_limits: Some("abc:1:1s,def:2:2s".to_string()),
            ..LimitsConfig::default()
        };
        limits.token_rules.insert(
            "abc".to_string(),
            TokenRuleConfig {
                limit_per_second: 9,
                ban: Duration::from_secs(9),
            },
        );

        let rules = limits.resolved_token_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["abc"].limit_per_second, 9);
        assert_eq!(rules["def"].limit_per_second, 2);
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://redis:6379/0");

        redis.password = Some("s3cret".to_string());
        redis.db = 2;
        assert_eq!(redis.url(), "redis://:s3cret@redis:6379/2");
    }

    #[test]
    fn test_store_driver_from_str() {
        assert_eq!("Memory".parse::<StoreDriver>().unwrap(), StoreDriver::Memory);
        assert_eq!("redis".parse::<StoreDriver>().unwrap(), StoreDriver::Redis);
        assert!("etcd".parse::<StoreDriver>().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.limits.ip_limit_per_second, 5);
    }

    #[test]
    fn test_load_keeps_credential_case() {
        let path = std::env::temp_dir().join(format!(
            "turnstile-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "limits:\n  ip_limit_per_second: 7\n  token_rules:\n    AbC123:\n      limit_per_second: 3\n      ban: 1s\n",
        )
        .unwrap();

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limits.ip_limit_per_second, 7);
        assert_eq!(config.limits.token_rules["AbC123"].limit_per_second, 3);
    }

    #[test]
    fn test_load_merges_env_token_rules_with_file() {
        let path = std::env::temp_dir().join(format!(
            "turnstile-merge-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "limits:\n  token_rules:\n    FileTok:\n      limit_per_second: 3\n      ban: 1s\n",
        )
        .unwrap();
        std::env::set_var("TURNSTILE__LIMITS__TOKEN_RULES__ENVTOK__LIMIT_PER_SECOND", "9");

        let config = TurnstileConfig::load(Some(&path));
        std::env::remove_var("TURNSTILE__LIMITS__TOKEN_RULES__ENVTOK__LIMIT_PER_SECOND");
        std::fs::remove_file(&path).unwrap();
        let rules = config.unwrap().limits.token_rules;

        assert_eq!(rules["FileTok"].limit_per_second, 3);
        assert_eq!(rules["envtok"].limit_per_second, 9);
        assert!(rules["envtok"].ban.is_zero());
    }

    #[test]
    fn test_restore_token_case() {
        let rule = |limit| TokenRuleConfig {
            limit_per_second: limit,
            ban: Duration::ZERO,
        };
        let layered = HashMap::from([("abc".to_string(), rule(5)), ("gold".to_string(), rule(9))]);
        let from_file = HashMap::from([("AbC".to_string(), rule(3))]);

        let rules = restore_token_case(layered, &from_file);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["AbC"].limit_per_second, 5, "environment value wins");
        assert_eq!(rules["gold"].limit_per_second, 9);
    }
}
