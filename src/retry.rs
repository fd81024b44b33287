//! Failover and bounded retries.
//!
//! The [`RetryCoordinator`] drives one call through repeated
//! select-then-dispatch attempts. A failed attempt is retried only if its
//! status code is listed in the policy, the attempt budget is not spent,
//! the caller has not cancelled and the backoff still ends before the
//! call's deadline. Every attempt selects afresh, so smooth weighted
//! round-robin naturally moves retries onto other nodes.
//!
//! Nodes are never excluded here. Health tracking belongs to discovery.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::WeightedSelector;
use crate::call::{Call, Reply};
use crate::status::{Code, Status};
use crate::transport::Transport;
use crate::{Result, TrafficError};

/// Default attempt budget, counting the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default wait before the second attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Default ceiling on any single wait.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Default growth factor between consecutive waits.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Immutable retry configuration of one call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    retryable: HashSet<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retryable: HashSet::from([Code::Unavailable]),
        }
    }
}

impl RetryPolicy {
    /// Validates and builds a policy.
    ///
    /// `max_attempts` counts the first attempt and must be at least 1; the
    /// multiplier must be finite and at least 1; `initial_backoff` must not
    /// exceed `max_backoff`.
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        retryable: impl IntoIterator<Item = Code>,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(TrafficError::Config(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(TrafficError::Config(format!(
                "retry backoff_multiplier must be a finite number >= 1, got {backoff_multiplier}"
            )));
        }
        if initial_backoff > max_backoff {
            return Err(TrafficError::Config(format!(
                "retry initial_backoff ({initial_backoff:?}) exceeds max_backoff ({max_backoff:?})"
            )));
        }

        Ok(Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            retryable: retryable.into_iter().collect(),
        })
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            retryable: HashSet::new(),
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable.contains(&code)
    }

    /// Wait after failed attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt - 1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Runs calls under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatches `call` to nodes chosen by `selector` until one attempt
    /// succeeds or retrying is no longer allowed.
    ///
    /// Each attempt is bounded by the time left before `deadline`.
    /// Cancelling `cancel` aborts the in-flight attempt or backoff and
    /// returns [`TrafficError::Cancelled`]. An empty pool fails immediately
    /// with [`TrafficError::EmptyPool`]. Otherwise a failed call yields
    /// [`TrafficError::Call`] carrying the last status and the number of
    /// attempts made.
    pub async fn invoke<T>(
        &self,
        selector: &WeightedSelector,
        transport: &T,
        call: &Call,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Reply>
    where
        T: Transport + ?Sized,
    {
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(TrafficError::Cancelled);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TrafficError::Call {
                    attempts: attempt - 1,
                    status: Status::deadline_exceeded("deadline passed before dispatch"),
                });
            }

            let node = selector.select()?;
            debug!(attempt, node = %node, method = %call.method, "dispatching call");

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TrafficError::Cancelled),
                res = tokio::time::timeout(remaining, transport.dispatch(&node, call)) => {
                    res.unwrap_or_else(|_| {
                        Err(Status::deadline_exceeded(format!(
                            "no response from {node} within {remaining:?}"
                        )))
                    })
                }
            };

            let status = match outcome {
                Ok(reply) => {
                    if attempt > 1 {
                        info!(
                            attempt,
                            node = %node,
                            method = %call.method,
                            "call succeeded after retry"
                        );
                    }
                    return Ok(reply);
                }
                Err(status) => status,
            };

            if !self.policy.is_retryable(status.code()) {
                warn!(attempt, node = %node, %status, "call failed with non-retryable status");
                return Err(TrafficError::Call {
                    attempts: attempt,
                    status,
                });
            }
            if attempt >= self.policy.max_attempts {
                warn!(attempt, node = %node, %status, "retry budget exhausted");
                return Err(TrafficError::Call {
                    attempts: attempt,
                    status,
                });
            }

            let backoff = self.policy.backoff(attempt);
            if Instant::now() + backoff >= deadline {
                warn!(
                    attempt,
                    node = %node,
                    %status,
                    ?backoff,
                    "next attempt would overrun the deadline"
                );
                return Err(TrafficError::Call {
                    attempts: attempt,
                    status,
                });
            }

            debug!(attempt, node = %node, %status, ?backoff, "retrying call");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TrafficError::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}
