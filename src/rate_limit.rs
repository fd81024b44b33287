//! Sliding-window rate limiting.
//!
//! A [`Limiter`] answers one question per call: has `key` already used up
//! its quota of `max_requests` within the trailing `window`? Evaluation and
//! recording happen in one atomic step inside the backing store, so two
//! concurrent callers can never both observe the last free slot.
//!
//! Two stores are provided:
//!
//! - [`RedisSlidingWindowLimiter`](crate::RedisSlidingWindowLimiter) runs the
//!   evaluation as a server-side script and is shared by every process
//!   talking to the same Redis instance.
//! - [`MemorySlidingWindowLimiter`] keeps per-key timestamp logs in a
//!   sharded concurrent map and is limited to the current process.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{Result, TrafficError};

/// Quota of one limiter: at most `max_requests` within any trailing
/// `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterPolicy {
    window: Duration,
    max_requests: u32,
}

impl LimiterPolicy {
    /// Both the window and the request ceiling must be non-zero.
    pub fn new(window: Duration, max_requests: u32) -> Result<Self> {
        if window.is_zero() {
            return Err(TrafficError::Config(
                "rate limit window must be non-zero".into(),
            ));
        }
        if max_requests == 0 {
            return Err(TrafficError::Config(
                "rate limit max_requests must be non-zero".into(),
            ));
        }
        Ok(Self {
            window,
            max_requests,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

/// The limiter could not decide. Distinct from being limited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterError {
    message: String,
}

impl LimiterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for LimiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LimiterError {}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        Self::new(format!("redis: {err}"))
    }
}

/// Keyed admission quota.
#[async_trait]
pub trait Limiter: fmt::Debug + Send + Sync {
    /// Evaluates and, when admitted, records one request for `key`.
    ///
    /// Returns `Ok(true)` if the request is limited, `Ok(false)` if it was
    /// admitted, and `Err` if the quota could not be evaluated.
    async fn limit(&self, key: &str) -> std::result::Result<bool, LimiterError>;
}

/// Milliseconds since the Unix epoch, as shared by every process.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// In-process sliding-window limiter.
///
/// Every key owns a log of admission timestamps. Evaluate-and-record runs
/// under the map's entry guard for that key, so callers of one key are
/// serialized while other keys proceed in parallel. Stale keys are dropped
/// by [`retain_recent`](Self::retain_recent), meant to run from a periodic
/// background task.
#[derive(Debug, Clone)]
pub struct MemorySlidingWindowLimiter {
    policy: LimiterPolicy,
    logs: Arc<DashMap<String, VecDeque<u64>>>,
}

impl MemorySlidingWindowLimiter {
    pub fn new(policy: LimiterPolicy) -> Self {
        Self {
            policy,
            logs: Arc::new(DashMap::new()),
        }
    }

    pub fn policy(&self) -> LimiterPolicy {
        self.policy
    }

    /// Evaluates `key` as of `now_ms`. Returns `true` if limited.
    pub fn limit_at(&self, key: &str, now_ms: u64) -> bool {
        self.evaluate(key, || now_ms)
    }

    /// The clock is read under the entry guard so each log stays ordered.
    fn evaluate(&self, key: &str, clock: impl FnOnce() -> u64) -> bool {
        let window_ms = self.policy.window_ms();
        let mut log = self.logs.entry(key.to_owned()).or_default();
        let now_ms = clock();

        while log
            .front()
            .is_some_and(|&ts| ts.saturating_add(window_ms) <= now_ms)
        {
            log.pop_front();
        }

        if log.len() >= self.policy.max_requests as usize {
            return true;
        }
        log.push_back(now_ms);
        false
    }

    /// Drops keys whose every entry has left the window.
    pub fn retain_recent(&self) {
        let window_ms = self.policy.window_ms();
        let now_ms = now_millis();
        self.logs.retain(|_, log| {
            log.back()
                .is_some_and(|&ts| ts.saturating_add(window_ms) > now_ms)
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }
}

#[async_trait]
impl Limiter for MemorySlidingWindowLimiter {
    async fn limit(&self, key: &str) -> std::result::Result<bool, LimiterError> {
        Ok(self.evaluate(key, now_millis))
    }
}
