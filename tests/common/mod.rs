//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway backend nodes, gateway constructors, and utility
//! functions used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use turnstile::config::{NodeConfig, RateLimitConfig, RetryConfig};
use turnstile::server::{Bootstrap, bootstrap};
use turnstile::{Config, Gateway, handle_request};

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// A local backend node. Dropping it shuts the server down.
pub struct Backend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    _shutdown: oneshot::Sender<()>,
}

impl Backend {
    /// The node address as it appears in configuration.
    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests this node has received.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn node(&self, weight: i64) -> NodeConfig {
        NodeConfig {
            address: self.address(),
            weight,
        }
    }
}

/// Starts a backend that answers every call with `status`. Successful
/// answers are a JSON object naming the node, the called method, and the
/// received payload; failing answers carry a plain-text message.
pub async fn start_backend(status: StatusCode, name: &'static str) -> Backend {
    start_backend_with_delay(status, name, Duration::ZERO).await
}

/// Like [`start_backend`], but every answer is delayed by `delay`.
pub async fn start_backend_with_delay(
    status: StatusCode,
    name: &'static str,
    delay: Duration,
) -> Backend {
    let (tx, rx) = oneshot::channel::<()>();
    let hits = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let counter = Arc::clone(&counter);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            Ok::<_, std::convert::Infallible>(answer(req, status, name).await)
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    Backend {
        addr,
        hits,
        _shutdown: tx,
    }
}

async fn answer(req: Request<Incoming>, status: StatusCode, name: &str) -> Response<Full<Bytes>> {
    if !status.is_success() {
        return Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(format!("{name} failing"))))
            .expect("test response must build");
    }

    let method = req.uri().path().to_owned();
    let tenant = req
        .headers()
        .get("x-tenant")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = req.into_body().collect().await.unwrap().to_bytes();
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();

    let reply = serde_json::json!({
        "node": name,
        "method": method,
        "payload": payload,
        "tenant": tenant,
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(reply.to_string())))
        .expect("test response must build")
}

/// An address nothing listens on.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind probe listener");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Retry settings with short backoffs so tests stay fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..Default::default()
    }
}

/// Builds a config over `nodes` with fast retries.
pub fn test_config(nodes: Vec<NodeConfig>, rate_limit: Option<RateLimitConfig>) -> Config {
    Config {
        nodes,
        rate_limit,
        retry: Some(fast_retry()),
        request_timeout_ms: Some(2_000),
        ..Default::default()
    }
}

/// Validates `config` and wires up a gateway with its background tasks.
pub async fn test_bootstrap(config: Config) -> Bootstrap {
    let runtime = config.into_runtime().expect("test config must be valid");
    bootstrap(&runtime).await.expect("bootstrap must succeed")
}

pub async fn test_gateway(config: Config) -> Arc<Gateway> {
    Arc::clone(&test_bootstrap(config).await.state.gateway)
}

/// Sends one JSON call through the gateway, rendering errors the way the
/// server does.
pub async fn post_call(
    gateway: &Arc<Gateway>,
    method: &str,
    payload: serde_json::Value,
) -> Response<Full<Bytes>> {
    let req = Request::builder()
        .method(Method::POST)
        .uri(method)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap();
    handle_request(req, Arc::clone(gateway), test_addr())
        .await
        .unwrap_or_else(|e| e.into_response())
}

/// Collects a response body and parses it as JSON.
pub async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("failed to collect response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}
