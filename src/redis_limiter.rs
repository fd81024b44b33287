//! Redis-backed sliding-window limiter.
//!
//! Each key is a sorted set of admission entries scored by their timestamp
//! in milliseconds. One `EVAL` trims entries that left the window, counts
//! the rest and records the new entry only when there is room. Redis runs
//! scripts atomically, so every process sharing the instance sees one
//! serialized history per key.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::rate_limit::{Limiter, LimiterError, LimiterPolicy, now_millis};
use crate::{Result, TrafficError};

/// Trims, counts and conditionally records in a single round trip.
///
/// `KEYS[1]` the key, `ARGV` = window in ms, max requests, now in ms,
/// unique member. Returns 1 when limited, 0 when admitted.
const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= threshold then
    return 1
end
redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)
return 0
";

/// Per-process sequence that keeps same-millisecond members distinct.
static MEMBER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sliding-window limiter whose state lives entirely in Redis.
///
/// Nothing is cached locally; every evaluation is one script invocation.
#[derive(Clone)]
pub struct RedisSlidingWindowLimiter {
    conn: ConnectionManager,
    script: Script,
    policy: LimiterPolicy,
    key_prefix: String,
}

impl std::fmt::Debug for RedisSlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSlidingWindowLimiter")
            .field("policy", &self.policy)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisSlidingWindowLimiter {
    /// Opens a managed connection to the Redis instance at `url`.
    ///
    /// Supports both `redis://` and `rediss://` URLs.
    pub async fn connect(url: &str, policy: LimiterPolicy, key_prefix: &str) -> Result<Self> {
        let conn = open_connection(url).await?;
        Ok(Self::with_connection(conn, policy, key_prefix))
    }

    /// Builds a limiter over an existing connection, so several limiters
    /// with different policies can share one connection.
    pub fn with_connection(
        conn: ConnectionManager,
        policy: LimiterPolicy,
        key_prefix: &str,
    ) -> Self {
        Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            policy,
            key_prefix: key_prefix.to_owned(),
        }
    }

    pub fn policy(&self) -> LimiterPolicy {
        self.policy
    }
}

/// Opens a managed, auto-reconnecting connection to `url`.
pub async fn open_connection(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)
        .map_err(|e| TrafficError::Config(format!("invalid redis url {url:?}: {e}")))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| TrafficError::Config(format!("failed to connect to redis: {e}")))
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

fn next_member(now_ms: u64) -> String {
    let seq = MEMBER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{now_ms}-{}-{seq}", process::id())
}

#[async_trait]
impl Limiter for RedisSlidingWindowLimiter {
    async fn limit(&self, key: &str) -> std::result::Result<bool, LimiterError> {
        let full_key = namespaced_key(&self.key_prefix, key);
        let now_ms = now_millis();
        let mut conn = self.conn.clone();

        let limited: i64 = self
            .script
            .key(&full_key)
            .arg(self.policy.window_ms())
            .arg(self.policy.max_requests())
            .arg(now_ms)
            .arg(next_member(now_ms))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %full_key, limited = limited != 0, "sliding window evaluated");
        Ok(limited != 0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;

    /// Connects to the server named by `REDIS_URL`, or returns `None` so the
    /// live-server tests are skipped when none is configured.
    async fn live_limiter(window_ms: u64, max_requests: u32) -> Option<RedisSlidingWindowLimiter> {
        let url = std::env::var("REDIS_URL").ok()?;
        let policy = LimiterPolicy::new(Duration::from_millis(window_ms), max_requests).unwrap();
        let prefix = format!("turnstile-test:{}:{}:", process::id(), next_member(now_millis()));
        Some(
            RedisSlidingWindowLimiter::connect(&url, policy, &prefix)
                .await
                .expect("REDIS_URL must point at a reachable server"),
        )
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(namespaced_key("turnstile:", "global"), "turnstile:global");
        assert_eq!(
            namespaced_key("rl:", "/UserService/GetById:42"),
            "rl:/UserService/GetById:42"
        );
    }

    #[test]
    fn members_are_unique_within_one_millisecond() {
        let members: HashSet<String> =
            (0..1_000).map(|_| next_member(1_700_000_000_000)).collect();
        assert_eq!(members.len(), 1_000);
    }

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let policy = LimiterPolicy::new(Duration::from_secs(1), 10).unwrap();
        let err = RedisSlidingWindowLimiter::connect("not a redis url", policy, "rl:")
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::Config(_)));
    }

    #[tokio::test]
    async fn live_quota_limits_then_recovers() {
        let Some(limiter) = live_limiter(300, 3).await else {
            return;
        };

        for _ in 0..3 {
            assert!(!limiter.limit("k").await.unwrap());
        }
        assert!(limiter.limit("k").await.unwrap());
        assert!(!limiter.limit("other").await.unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!limiter.limit("k").await.unwrap());
    }

    #[tokio::test]
    async fn live_idle_keys_expire() {
        let Some(limiter) = live_limiter(100, 1).await else {
            return;
        };
        assert!(!limiter.limit("idle").await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let mut conn = limiter.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(namespaced_key(&limiter.key_prefix, "idle"))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(exists, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn live_concurrent_callers_split_exactly() {
        const QUOTA: u32 = 100;
        let Some(limiter) = live_limiter(60_000, QUOTA).await else {
            return;
        };
        let start = Arc::new(Barrier::new(QUOTA as usize * 2));

        let tasks: Vec<_> = (0..QUOTA * 2)
            .map(|_| {
                let limiter = limiter.clone();
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    limiter.limit("shared").await.unwrap()
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if !task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, QUOTA);
    }
}
