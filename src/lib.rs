//! Traffic control for RPC calls to a pool of backend nodes.
//!
//! A call passes an [`AdmissionChain`] of sliding-window rate limits, is
//! routed by smooth weighted round-robin ([`WeightedSelector`]) and is
//! retried on other nodes by the [`RetryCoordinator`] when a node is
//! unavailable. Rate-limit state lives either in Redis, shared by every
//! gateway instance, or in process.
//!
//! The bundled binary runs an HTTP/1 gateway in front of the pool, built
//! on [Hyper].
//!
//! [Hyper]: https://hyper.rs/

pub mod admission;
pub mod balancer;
pub mod call;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod node;
pub mod rate_limit;
pub mod redis_limiter;
pub mod retry;
pub mod server;
pub mod status;
pub mod transport;

pub use admission::{AdmissionChain, FailPolicy, Tier};
pub use balancer::WeightedSelector;
pub use call::{Call, Reply};
pub use client::RpcClient;
pub use config::{Config, RuntimeConfig};
pub use discovery::{Discovery, DiscoveryEvent};
pub use error::TrafficError;
pub use gateway::{Gateway, handle_request};
pub use node::{Endpoint, Node, NodeSet};
pub use rate_limit::{Limiter, LimiterError, LimiterPolicy, MemorySlidingWindowLimiter};
pub use redis_limiter::RedisSlidingWindowLimiter;
pub use retry::{RetryCoordinator, RetryPolicy};
pub use status::{Code, Status};
pub use transport::{HttpTransport, PoolSettings, Transport};

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrafficError>;
