//! Multi-granularity admission control.
//!
//! An [`AdmissionChain`] is an ordered list of checks. Each check pairs a
//! predicate deciding whether it applies to a call (and which key it
//! charges) with the [`Limiter`] enforcing its quota. Checks run in order
//! and the first denial ends evaluation, so a call rejected by the global
//! ceiling never touches the service or business-key limiters.
//!
//! When a limiter cannot evaluate its quota the chain consults its
//! [`FailPolicy`]. The default denies the call; continuing instead is an
//! explicit opt-in that trades the quota guarantee for availability.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::call::Call;
use crate::rate_limit::Limiter;
use crate::{Result, TrafficError};

/// Granularity of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Flat ceiling across all traffic through the chain.
    Global,
    /// Ceiling for every method under a service prefix.
    Service,
    /// Ceiling per business entity, keyed by a payload field.
    BusinessKey,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Service => "service",
            Self::BusinessKey => "business_key",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a limiter fails to evaluate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Deny the call. An unverifiable quota counts as exceeded.
    #[default]
    FailClosed,
    /// Skip the failing check and continue with the next one. Weakens the
    /// quota guarantee while the store is unreachable.
    FailOpen,
}

/// Which calls a check applies to, and the key it charges.
#[derive(Debug, Clone)]
enum Matcher {
    Always { key: String },
    MethodPrefix { prefix: String, key: String },
    Field { method: String, field: String },
}

impl Matcher {
    fn key_for(&self, call: &Call) -> Option<String> {
        match self {
            Self::Always { key } => Some(key.clone()),
            Self::MethodPrefix { prefix, key } => {
                call.method.starts_with(prefix.as_str()).then(|| key.clone())
            }
            Self::Field { method, field } => {
                if call.method != *method {
                    return None;
                }
                let value = match call.field(field)? {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some(format!("{method}:{value}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Check {
    tier: Tier,
    matcher: Matcher,
    limiter: Arc<dyn Limiter>,
}

/// Ordered admission checks with a shared limiter-error policy.
#[derive(Debug, Clone, Default)]
pub struct AdmissionChain {
    checks: Vec<Check>,
    on_error: FailPolicy,
}

impl AdmissionChain {
    pub fn builder() -> AdmissionChainBuilder {
        AdmissionChainBuilder::default()
    }

    /// A chain that admits everything.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.on_error
    }

    /// Decides whether `call` may proceed.
    ///
    /// Returns [`TrafficError::Limited`] naming the denying tier, or
    /// [`TrafficError::LimiterUnavailable`] when a limiter failed under
    /// [`FailPolicy::FailClosed`].
    pub async fn admit(&self, call: &Call) -> Result<()> {
        for check in &self.checks {
            let Some(key) = check.matcher.key_for(call) else {
                continue;
            };

            match check.limiter.limit(&key).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!(tier = %check.tier, %key, method = %call.method, "call rate limited");
                    return Err(TrafficError::Limited { tier: check.tier });
                }
                Err(cause) => match self.on_error {
                    FailPolicy::FailClosed => {
                        error!(
                            tier = %check.tier,
                            %key,
                            error = %cause,
                            "limiter evaluation failed, denying call"
                        );
                        return Err(TrafficError::LimiterUnavailable {
                            tier: check.tier,
                            cause,
                        });
                    }
                    FailPolicy::FailOpen => {
                        warn!(
                            tier = %check.tier,
                            %key,
                            error = %cause,
                            "limiter evaluation failed, skipping check"
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// Runs `next` only if `call` is admitted.
    pub async fn intercept<F, Fut, T>(&self, call: &Call, next: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(call).await?;
        next().await
    }
}

/// Assembles an [`AdmissionChain`]. Checks run in the order they are added.
#[derive(Debug, Default)]
pub struct AdmissionChainBuilder {
    checks: Vec<Check>,
    on_error: FailPolicy,
}

impl AdmissionChainBuilder {
    /// Flat ceiling charged to `key` for every call.
    pub fn global(mut self, key: impl Into<String>, limiter: Arc<dyn Limiter>) -> Self {
        self.checks.push(Check {
            tier: Tier::Global,
            matcher: Matcher::Always { key: key.into() },
            limiter,
        });
        self
    }

    /// Ceiling charged to `key` for calls whose method starts with `prefix`.
    pub fn service(
        mut self,
        prefix: impl Into<String>,
        key: impl Into<String>,
        limiter: Arc<dyn Limiter>,
    ) -> Self {
        self.checks.push(Check {
            tier: Tier::Service,
            matcher: Matcher::MethodPrefix {
                prefix: prefix.into(),
                key: key.into(),
            },
            limiter,
        });
        self
    }

    /// Ceiling per value of payload `field` on calls to exactly `method`,
    /// charged to `"<method>:<value>"`. Calls whose payload lacks the field
    /// or holds a non-scalar value are not charged.
    pub fn business_key(
        mut self,
        method: impl Into<String>,
        field: impl Into<String>,
        limiter: Arc<dyn Limiter>,
    ) -> Self {
        self.checks.push(Check {
            tier: Tier::BusinessKey,
            matcher: Matcher::Field {
                method: method.into(),
                field: field.into(),
            },
            limiter,
        });
        self
    }

    pub fn fail_policy(mut self, policy: FailPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn build(self) -> AdmissionChain {
        AdmissionChain {
            checks: self.checks,
            on_error: self.on_error,
        }
    }
}
