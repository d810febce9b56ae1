//! Distributed store backed by Redis.
//!
//! The check-increment-ban sequence runs as a single Lua script, so Redis
//! serialises it against every other client touching the same keys. No
//! client-side locking is involved and any number of instances can share
//! one server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::backend::{AttemptResult, Store};
use super::identity::Scope;
use super::policy::RateRule;
use crate::config::RedisConfig;
use crate::error::{Result, TurnstileError};

/// Returns `{allowed, retry_after_ms, remaining, reset_epoch_ms}`.
const ATTEMPT_SCRIPT: &str = r#"
local count_key = KEYS[1]
local ban_key = KEYS[2]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local ban_ms = tonumber(ARGV[3])

local ttl = redis.call('PTTL', ban_key)
if ttl > 0 then
  return {0, ttl, 0, 0}
end

local current = redis.call('INCR', count_key)
if current == 1 then
  redis.call('PEXPIRE', count_key, window_ms)
end

if current > limit then
  if ban_ms <= 0 then
    return {0, 0, 0, 0}
  end
  redis.call('DEL', count_key)
  redis.call('SET', ban_key, 1, 'PX', ban_ms)
  return {0, redis.call('PTTL', ban_key), 0, 0}
end

local window_ttl = redis.call('PTTL', count_key)
local now = redis.call('TIME')
local reset_ms = tonumber(now[1]) * 1000 + math.floor(tonumber(now[2]) / 1000) + window_ttl
return {1, 0, limit - current, reset_ms}
"#;

/// Redis key holding the window counter for an identity.
pub fn count_key(scope: Scope, key: &str) -> String {
    format!("rl:count:{}:{}", scope, key)
}

/// Redis key whose presence (and TTL) marks an active ban.
pub fn ban_key(scope: Scope, key: &str) -> String {
    format!("rl:block:{}:{}", scope, key)
}

/// A store keeping counters and bans in a shared Redis instance.
pub struct RedisStore {
    connection: Mutex<Option<ConnectionManager>>,
    script: Script,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis and verify it answers before returning.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url()).map_err(|e| {
            TurnstileError::Config(format!("invalid redis address {:?}: {}", config.addr, e))
        })?;

        let connect = async {
            let mut manager = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut manager).await?;
            Ok::<_, redis::RedisError>(manager)
        };

        let manager = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                warn!(addr = %config.addr, "Timed out connecting to Redis");
                TurnstileError::BackendUnavailable(format!(
                    "timed out connecting to {} after {:?}",
                    config.addr, config.connect_timeout
                ))
            })?
            .map_err(|e| {
                warn!(addr = %config.addr, error = %e, "Failed to connect to Redis");
                TurnstileError::BackendUnavailable(format!(
                    "failed to connect to {}: {}",
                    config.addr, e
                ))
            })?;

        info!(addr = %config.addr, db = config.db, "Connected to Redis");

        Ok(Self {
            connection: Mutex::new(Some(manager)),
            script: Script::new(ATTEMPT_SCRIPT),
            command_timeout: config.command_timeout,
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| TurnstileError::BackendUnavailable("store is closed".to_string()))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn attempt(&self, scope: Scope, key: &str, rule: &RateRule) -> Result<AttemptResult> {
        let mut conn = self.connection()?;

        trace!(scope = %scope, key = %key, limit = rule.limit(), "Checking distributed rate limit");

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(count_key(scope, key))
            .key(ban_key(scope, key))
            .arg(rule.limit())
            .arg(duration_ms(rule.window()))
            .arg(duration_ms(rule.ban()));

        let reply: Value = tokio::time::timeout(
            self.command_timeout,
            invocation.invoke_async(&mut conn),
        )
        .await
        .map_err(|_| {
            TurnstileError::BackendUnavailable(format!(
                "rate limit script timed out after {:?}",
                self.command_timeout
            ))
        })??;

        let result = parse_reply(&reply)?;
        if !result.allowed {
            debug!(
                scope = %scope,
                key = %key,
                retry_after_ms = result.retry_after.as_millis() as u64,
                "Distributed rate limit exceeded"
            );
        }
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        // Dropping the last manager handle shuts the connection down.
        if self.connection.lock().take().is_some() {
            info!("Redis store closed");
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Turn the script's 4-element reply into an `AttemptResult`.
fn parse_reply(reply: &Value) -> Result<AttemptResult> {
    let items = match reply {
        Value::Array(items) if items.len() == 4 => items,
        other => {
            return Err(TurnstileError::BackendProtocol(format!(
                "unexpected script result: {:?}",
                other
            )))
        }
    };

    let mut fields = [0i64; 4];
    for (slot, item) in fields.iter_mut().zip(items) {
        *slot = match item {
            Value::Int(n) => *n,
            other => {
                return Err(TurnstileError::BackendProtocol(format!(
                    "non-integer field in script result: {:?}",
                    other
                )))
            }
        };
    }

    let [allowed, retry_after_ms, remaining, reset_epoch_ms] = fields;
    if remaining < 0 {
        return Err(TurnstileError::BackendProtocol(format!(
            "negative remaining quota in script result: {}",
            remaining
        )));
    }

    match allowed {
        1 => {
            let reset = (reset_epoch_ms > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(reset_epoch_ms))
                .flatten();
            Ok(AttemptResult::allowed(remaining as u64, reset))
        }
        0 => {
            let retry_after = Duration::from_millis(retry_after_ms.max(0) as u64);
            Ok(AttemptResult::denied(retry_after))
        }
        other => Err(TurnstileError::BackendProtocol(format!(
            "unexpected allow flag in script result: {}",
            other
        ))),
    }
}
