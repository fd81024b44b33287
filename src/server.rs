//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP listener
//! and the per-request gateway handler. Kept apart from `main()` so the
//! server can be started from tests without signal handling or
//! `std::process::exit`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::balancer::WeightedSelector;
use crate::client::RpcClient;
use crate::config::{Admission, RuntimeConfig};
use crate::discovery::Discovery;
use crate::gateway::{Gateway, handle_request};
use crate::rate_limit::MemorySlidingWindowLimiter;
use crate::retry::RetryCoordinator;
use crate::transport::HttpTransport;
use crate::{Result, TrafficError};

/// Interval between sweeps of idle in-process rate-limit keys.
pub const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// Request handler state shared by all connections.
    pub gateway: Arc<Gateway>,
    /// Bounds the number of concurrent in-flight requests.
    pub semaphore: Arc<Semaphore>,
    /// Cached value of the semaphore capacity, used in error messages.
    pub concurrency_limit: usize,
}

impl ServerState {
    pub fn new(gateway: Gateway, concurrency_limit: usize) -> Self {
        Self {
            gateway: Arc::new(gateway),
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
        }
    }
}

/// Everything [`bootstrap`] wires together.
pub struct Bootstrap {
    pub state: ServerState,
    /// Applies registry events to the node pool. Feed it with
    /// [`Discovery::spawn_watch`].
    pub discovery: Discovery,
    /// Lease reaper and limiter cleanup tasks.
    pub tasks: Vec<JoinHandle<()>>,
}

/// Builds the node pool, limiters, client and gateway described by
/// `config`, and starts their background tasks.
pub async fn bootstrap(config: &RuntimeConfig) -> Result<Bootstrap> {
    let selector = WeightedSelector::from_endpoints(config.nodes.iter().cloned())?;

    let Admission {
        server,
        client,
        memory_limiters,
    } = match &config.rate_limit {
        Some(rules) => rules.build().await?,
        None => Admission::default(),
    };

    let rpc_client = RpcClient::new(
        client,
        selector.clone(),
        RetryCoordinator::new(config.retry.clone()),
        Arc::new(HttpTransport::new(config.pool)),
        config.request_timeout,
    );
    let gateway = Gateway::new(server, rpc_client, config.max_body_size);

    let discovery = Discovery::new(selector, config.lease_ttl);
    let mut tasks = vec![discovery.clone().spawn_reaper(config.reap_interval)];
    if !memory_limiters.is_empty() {
        tasks.push(spawn_rate_limit_cleanup(
            memory_limiters,
            RATE_LIMIT_CLEANUP_INTERVAL,
        ));
    }

    info!(
        nodes = config.nodes.len(),
        rate_limited = config.rate_limit.is_some(),
        max_attempts = config.retry.max_attempts(),
        "gateway initialised"
    );

    Ok(Bootstrap {
        state: ServerState::new(gateway, config.max_concurrent_requests),
        discovery,
        tasks,
    })
}

/// Accepts connections on `listener` and dispatches them through the
/// gateway using the shared `state`.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: impl Future<Output = ()>) {
    let ServerState {
        gateway,
        semaphore,
        concurrency_limit,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let gateway = Arc::clone(&gateway);
                let semaphore = Arc::clone(&semaphore);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let gateway = Arc::clone(&gateway);
                        let semaphore = Arc::clone(&semaphore);
                        async move {
                            let resp =
                                respond(req, gateway, &semaphore, concurrency_limit, client_addr)
                                    .await;
                            Ok::<_, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

async fn respond(
    req: hyper::Request<Incoming>,
    gateway: Arc<Gateway>,
    semaphore: &Semaphore,
    concurrency_limit: usize,
    client_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let Ok(_permit) = semaphore.try_acquire() else {
        warn!(
            limit = concurrency_limit,
            "concurrency limit reached, rejecting request"
        );
        return TrafficError::ServiceUnavailable {
            limit: concurrency_limit,
        }
        .into_response();
    };

    handle_request(req, gateway, client_addr)
        .await
        .unwrap_or_else(TrafficError::into_response)
}

/// Spawns a background task that periodically prunes idle keys from the
/// in-process limiters, preventing unbounded memory growth.
pub fn spawn_rate_limit_cleanup(
    limiters: Vec<MemorySlidingWindowLimiter>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let before: usize = limiters.iter().map(|l| l.tracked_keys()).sum();
            limiters.iter().for_each(|l| l.retain_recent());
            let after: usize = limiters.iter().map(|l| l.tracked_keys()).sum();
            if before != after {
                info!(
                    before,
                    after,
                    pruned = before - after,
                    "rate limiter cleanup completed"
                );
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(%e, "failed to register SIGTERM handler, waiting for SIGINT only");
                    if ctrl_c.await.is_ok() {
                        info!("received SIGINT, initiating graceful shutdown");
                    }
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(%e, "failed to listen for Ctrl+C");
            return;
        }
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
