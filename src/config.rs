//! Configuration loading, validation, and limiter construction.
//!
//! The gateway reads its YAML configuration exactly once at startup. The
//! raw [`Config`] mirrors the on-disk schema; [`Config::into_runtime`]
//! validates every field into a [`RuntimeConfig`] so that malformed
//! weights, quotas or retry policies are rejected before anything is
//! served.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionChain, FailPolicy};
use crate::discovery::{DEFAULT_LEASE_TTL, DEFAULT_REAP_INTERVAL};
use crate::node::Endpoint;
use crate::rate_limit::{Limiter, LimiterPolicy, MemorySlidingWindowLimiter};
use crate::redis_limiter::{self, RedisSlidingWindowLimiter};
use crate::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
    RetryPolicy,
};
use crate::status::Code;
use crate::transport::PoolSettings;
use crate::{Result, TrafficError};

/// Default maximum request body size: 1 MiB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Default connect timeout for establishing node TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline of one call, covering every attempt and backoff.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout for pooled connections before they are closed.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per node.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default maximum number of concurrent in-flight requests the gateway
/// will handle before returning 503 Service Unavailable.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default weight assigned to nodes when none is specified.
pub const DEFAULT_NODE_WEIGHT: i64 = 1;

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";

/// Default namespace of rate-limit keys in Redis.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:8100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Statically configured nodes. These never expire.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Maximum allowed request body size in bytes (default: 1 MiB).
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Connect timeout in milliseconds for node connections (default: 5000).
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Deadline of one call in milliseconds, retries included
    /// (default: 10000).
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds for pooled connections (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum idle connections kept per node (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Maximum concurrent in-flight requests before returning 503
    /// (default: 1000).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    /// Admission control. When absent, every call is admitted.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Failover policy. When absent, the defaults of [`RetryConfig`] apply.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Lease handling for registry-managed nodes.
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
}

/// A single node entry in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Base URI of the node, e.g. `http://10.0.0.7:8090`.
    pub address: String,
    /// Share of traffic relative to the other nodes (default: 1).
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    DEFAULT_NODE_WEIGHT
}

/// Where sliding-window state lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-process; quotas are per gateway instance.
    #[default]
    Memory,
    /// Shared through Redis; quotas hold across instances.
    Redis,
}

/// Which side of the call path runs the admission chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyTo {
    /// Inbound requests, before they become outgoing calls.
    #[default]
    Server,
    /// Outgoing calls from the client.
    Client,
    Both,
}

impl ApplyTo {
    pub fn server(self) -> bool {
        matches!(self, Self::Server | Self::Both)
    }

    pub fn client(self) -> bool {
        matches!(self, Self::Client | Self::Both)
    }
}

/// A quota: at most `max_requests` in any trailing `window_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl LimitConfig {
    fn policy(self) -> Result<LimiterPolicy> {
        LimiterPolicy::new(Duration::from_millis(self.window_ms), self.max_requests)
    }
}

/// A quota shared by every method whose name starts with `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceLimitConfig {
    /// Method prefix, e.g. `/UserService/`.
    pub prefix: String,
    pub window_ms: u64,
    pub max_requests: u32,
}

/// A quota per value of a payload field on one method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusinessKeyConfig {
    /// Exact method, e.g. `/UserService/GetById`.
    pub method: String,
    /// Top-level key, or a JSON pointer when it starts with `/`.
    pub field: String,
    pub window_ms: u64,
    pub max_requests: u32,
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Backing store (default: `memory`).
    #[serde(default)]
    pub store: StoreKind,
    /// Redis URL, required when `store` is `redis`.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Namespace of every rate-limit key (default: `"turnstile:"`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Decision when a limiter cannot be evaluated (default: `fail_closed`).
    #[serde(default)]
    pub on_error: FailPolicy,
    /// Side running the chain (default: `server`).
    #[serde(default)]
    pub apply_to: ApplyTo,
    /// Flat ceiling over every call.
    #[serde(default)]
    pub global: Option<LimitConfig>,
    /// Per-service ceilings, checked in order after the global one.
    #[serde(default)]
    pub services: Vec<ServiceLimitConfig>,
    /// Per-business-key ceilings, checked last.
    #[serde(default)]
    pub business_keys: Vec<BusinessKeyConfig>,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.into()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            on_error: FailPolicy::default(),
            apply_to: ApplyTo::default(),
            global: None,
            services: Vec::new(),
            business_keys: Vec::new(),
        }
    }
}

/// Failover configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Attempt budget including the first attempt (default: 4).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff after the first failed attempt (default: 10).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling (default: 100).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive backoffs (default: 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Status codes worth another attempt (default: `[UNAVAILABLE]`).
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<Code>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF.as_millis() as u64
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF.as_millis() as u64
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_retryable_codes() -> Vec<Code> {
    vec![Code::Unavailable]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_codes: default_retryable_codes(),
        }
    }
}

/// Lease handling for nodes announced by a registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// A node not renewed within this many milliseconds is removed
    /// (default: 5000).
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Interval between expiry sweeps in milliseconds (default: 1000).
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    DEFAULT_LEASE_TTL.as_millis() as u64
}

fn default_reap_interval_ms() -> u64 {
    DEFAULT_REAP_INTERVAL.as_millis() as u64
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    pub nodes: Vec<Endpoint>,
    /// Maximum request body size in bytes. Larger bodies yield 413.
    pub max_body_size: u64,
    /// Deadline of one call, retries included.
    pub request_timeout: Duration,
    pub pool: PoolSettings,
    /// Maximum concurrent in-flight requests. Overflow yields 503.
    pub max_concurrent_requests: usize,
    /// `None` admits every call.
    pub rate_limit: Option<RateLimitRules>,
    pub retry: RetryPolicy,
    pub lease_ttl: Duration,
    pub reap_interval: Duration,
}

/// Validated admission control rules.
#[derive(Debug, Clone)]
pub struct RateLimitRules {
    pub store: LimiterStore,
    pub key_prefix: String,
    pub on_error: FailPolicy,
    pub apply_to: ApplyTo,
    pub global: Option<LimiterPolicy>,
    /// `(method prefix, quota)` pairs.
    pub services: Vec<(String, LimiterPolicy)>,
    pub business_keys: Vec<BusinessKeyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterStore {
    Memory,
    Redis { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessKeyRule {
    pub method: String,
    pub field: String,
    pub policy: LimiterPolicy,
}

/// Admission chains ready to install, plus the in-process limiters that
/// need periodic cleanup.
#[derive(Debug, Default)]
pub struct Admission {
    pub server: AdmissionChain,
    pub client: AdmissionChain,
    pub memory_limiters: Vec<MemorySlidingWindowLimiter>,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`TrafficError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            TrafficError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| TrafficError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    ///
    /// At least one node must be configured.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.nodes.is_empty() {
            return Err(TrafficError::Config(
                "at least one node must be configured".into(),
            ));
        }

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            TrafficError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let nodes = self
            .nodes
            .iter()
            .map(|n| Endpoint::new(&n.address, n.weight))
            .collect::<Result<Vec<_>>>()?;

        let request_timeout = self
            .request_timeout_ms
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);
        if request_timeout.is_zero() {
            return Err(TrafficError::Config(
                "request_timeout_ms must be non-zero".into(),
            ));
        }

        let pool = PoolSettings {
            connect_timeout: self
                .connect_timeout_ms
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
            idle_timeout: self
                .pool_idle_timeout_ms
                .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis),
            max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
        };

        let max_concurrent_requests = self
            .max_concurrent_requests
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
        if max_concurrent_requests == 0 {
            return Err(TrafficError::Config(
                "max_concurrent_requests must be non-zero".into(),
            ));
        }

        let rate_limit = self.rate_limit.map(RateLimitConfig::validate).transpose()?;

        let retry = self.retry.unwrap_or_default();
        let retry = RetryPolicy::new(
            retry.max_attempts,
            Duration::from_millis(retry.initial_backoff_ms),
            Duration::from_millis(retry.max_backoff_ms),
            retry.backoff_multiplier,
            retry.retryable_codes,
        )?;

        let discovery = self.discovery.unwrap_or_default();
        if discovery.lease_ttl_ms == 0 || discovery.reap_interval_ms == 0 {
            return Err(TrafficError::Config(
                "discovery lease_ttl_ms and reap_interval_ms must be non-zero".into(),
            ));
        }

        Ok(RuntimeConfig {
            listen,
            nodes,
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            request_timeout,
            pool,
            max_concurrent_requests,
            rate_limit,
            retry,
            lease_ttl: Duration::from_millis(discovery.lease_ttl_ms),
            reap_interval: Duration::from_millis(discovery.reap_interval_ms),
        })
    }
}

impl RateLimitConfig {
    fn validate(self) -> Result<RateLimitRules> {
        let store = match self.store {
            StoreKind::Memory => LimiterStore::Memory,
            StoreKind::Redis => {
                let url = self.redis_url.filter(|u| !u.is_empty()).ok_or_else(|| {
                    TrafficError::Config(
                        "rate_limit.redis_url is required for the redis store".into(),
                    )
                })?;
                LimiterStore::Redis { url }
            }
        };

        let global = self.global.map(LimitConfig::policy).transpose()?;

        let services = self
            .services
            .into_iter()
            .map(|s| {
                if s.prefix.is_empty() {
                    return Err(TrafficError::Config(
                        "service limit prefix must not be empty".into(),
                    ));
                }
                let policy = LimitConfig {
                    window_ms: s.window_ms,
                    max_requests: s.max_requests,
                }
                .policy()?;
                Ok((s.prefix, policy))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(prefix) = first_duplicate(services.iter().map(|(prefix, _)| prefix)) {
            return Err(TrafficError::Config(format!(
                "service limit prefix {prefix} is configured more than once"
            )));
        }

        let business_keys = self
            .business_keys
            .into_iter()
            .map(|b| {
                if b.field.is_empty() {
                    return Err(TrafficError::Config(format!(
                        "business key field for {} must not be empty",
                        b.method
                    )));
                }
                let policy = LimitConfig {
                    window_ms: b.window_ms,
                    max_requests: b.max_requests,
                }
                .policy()?;
                let method = if b.method.starts_with('/') {
                    b.method
                } else {
                    format!("/{}", b.method)
                };
                Ok(BusinessKeyRule {
                    method,
                    field: b.field,
                    policy,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(method) = first_duplicate(business_keys.iter().map(|rule| &rule.method)) {
            return Err(TrafficError::Config(format!(
                "business key limit for {method} is configured more than once"
            )));
        }

        Ok(RateLimitRules {
            store,
            key_prefix: self.key_prefix,
            on_error: self.on_error,
            apply_to: self.apply_to,
            global,
            services,
            business_keys,
        })
    }
}

/// Limiter keys are derived from the prefix or method alone, so two rules
/// sharing one would count into the same window.
fn first_duplicate<'a>(mut items: impl Iterator<Item = &'a String>) -> Option<&'a String> {
    let mut seen = HashSet::new();
    items.find(|item| !seen.insert(*item))
}

impl RateLimitRules {
    /// Creates the limiters and assembles the chains for each side.
    ///
    /// For the Redis store this opens one shared connection and fails with
    /// [`TrafficError::Config`] if Redis cannot be reached.
    pub async fn build(&self) -> Result<Admission> {
        let mut factory = match &self.store {
            LimiterStore::Memory => LimiterFactory::Memory(Vec::new()),
            LimiterStore::Redis { url } => LimiterFactory::Redis {
                conn: redis_limiter::open_connection(url).await?,
                prefix: self.key_prefix.clone(),
            },
        };

        let server = if self.apply_to.server() {
            self.chain("server", &mut factory)
        } else {
            AdmissionChain::permissive()
        };
        let client = if self.apply_to.client() {
            self.chain("client", &mut factory)
        } else {
            AdmissionChain::permissive()
        };

        let memory_limiters = match factory {
            LimiterFactory::Memory(limiters) => limiters,
            LimiterFactory::Redis { .. } => Vec::new(),
        };
        Ok(Admission {
            server,
            client,
            memory_limiters,
        })
    }

    fn chain(&self, side: &str, factory: &mut LimiterFactory) -> AdmissionChain {
        let mut builder = AdmissionChain::builder().fail_policy(self.on_error);
        if let Some(policy) = self.global {
            builder = builder.global("global", factory.make(side, policy));
        }
        for (prefix, policy) in &self.services {
            let limiter = factory.make(side, *policy);
            builder = builder.service(prefix, format!("service:{prefix}"), limiter);
        }
        for rule in &self.business_keys {
            let limiter = factory.make(side, rule.policy);
            builder = builder.business_key(&rule.method, &rule.field, limiter);
        }
        builder.build()
    }
}

enum LimiterFactory {
    Memory(Vec<MemorySlidingWindowLimiter>),
    Redis {
        conn: redis::aio::ConnectionManager,
        prefix: String,
    },
}

impl LimiterFactory {
    /// Each side gets its own key space so server and client quotas are
    /// counted separately.
    fn make(&mut self, side: &str, policy: LimiterPolicy) -> Arc<dyn Limiter> {
        match self {
            Self::Memory(created) => {
                let limiter = MemorySlidingWindowLimiter::new(policy);
                created.push(limiter.clone());
                Arc::new(limiter)
            }
            Self::Redis { conn, prefix } => Arc::new(RedisSlidingWindowLimiter::with_connection(
                conn.clone(),
                policy,
                &format!("{prefix}{side}:"),
            )),
        }
    }
}
