//! Client-side call path: admission, then selection with failover.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::admission::AdmissionChain;
use crate::balancer::WeightedSelector;
use crate::call::{Call, Reply};
use crate::retry::RetryCoordinator;
use crate::transport::Transport;

/// An RPC client bound to one node pool.
///
/// Every call first passes the client admission chain, then goes through
/// the [`RetryCoordinator`] with a deadline of `request_timeout` from the
/// moment the call was admitted.
#[derive(Clone)]
pub struct RpcClient {
    chain: AdmissionChain,
    selector: WeightedSelector,
    coordinator: RetryCoordinator,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("chain", &self.chain)
            .field("selector", &self.selector)
            .field("coordinator", &self.coordinator)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(
        chain: AdmissionChain,
        selector: WeightedSelector,
        coordinator: RetryCoordinator,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            selector,
            coordinator,
            transport,
            request_timeout,
        }
    }

    pub fn selector(&self) -> &WeightedSelector {
        &self.selector
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Performs `call`, aborting when `cancel` fires.
    pub async fn call(&self, call: &Call, cancel: &CancellationToken) -> Result<Reply> {
        self.chain
            .intercept(call, || async {
                let deadline = Instant::now() + self.request_timeout;
                self.coordinator
                    .invoke(&self.selector, &*self.transport, call, deadline, cancel)
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::StatusCode;
    use hyper::header::HeaderMap;
    use serde_json::json;

    use super::*;
    use crate::TrafficError;
    use crate::admission::Tier;
    use crate::node::Endpoint;
    use crate::rate_limit::{LimiterPolicy, MemorySlidingWindowLimiter};
    use crate::retry::RetryPolicy;
    use crate::status::{Code, Status};

    #[derive(Default)]
    struct Recorder {
        dispatched: AtomicUsize,
        down: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn dispatch(
            &self,
            node: &Endpoint,
            _call: &Call,
        ) -> std::result::Result<Reply, Status> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            if self.down.lock().unwrap().iter().any(|a| a == node.address()) {
                return Err(Status::unavailable("down"));
            }
            Ok(Reply {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from(node.address().to_owned()),
            })
        }
    }

    fn selector() -> WeightedSelector {
        WeightedSelector::from_endpoints([
            Endpoint::new("http://a:1", 1).unwrap(),
            Endpoint::new("http://b:1", 1).unwrap(),
        ])
        .unwrap()
    }

    fn client(chain: AdmissionChain, transport: Arc<Recorder>) -> RpcClient {
        RpcClient::new(
            chain,
            selector(),
            RetryCoordinator::new(RetryPolicy::default()),
            transport,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn admitted_call_reaches_a_node() {
        let transport = Arc::new(Recorder::default());
        let client = client(AdmissionChain::permissive(), Arc::clone(&transport));

        let reply = client
            .call(&Call::new("/S/M", json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.body, Bytes::from_static(b"http://a:1"));
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn limited_call_is_never_dispatched() {
        let policy = LimiterPolicy::new(Duration::from_secs(60), 1).unwrap();
        let chain = AdmissionChain::builder()
            .global("client", Arc::new(MemorySlidingWindowLimiter::new(policy)))
            .build();
        let transport = Arc::new(Recorder::default());
        let client = client(chain, Arc::clone(&transport));
        let cancel = CancellationToken::new();

        client.call(&Call::new("/S/M", json!({})), &cancel).await.unwrap();
        let err = client
            .call(&Call::new("/S/M", json!({})), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, TrafficError::Limited { tier: Tier::Global }));
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_node_fails_over() {
        let transport = Arc::new(Recorder::default());
        transport.down.lock().unwrap().push("http://a:1".into());
        let client = client(AdmissionChain::permissive(), Arc::clone(&transport));

        let reply = client
            .call(&Call::new("/S/M", json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.body, Bytes::from_static(b"http://b:1"));
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn every_node_down_reports_last_status() {
        let transport = Arc::new(Recorder::default());
        transport
            .down
            .lock()
            .unwrap()
            .extend(["http://a:1".to_owned(), "http://b:1".to_owned()]);
        let client = client(AdmissionChain::permissive(), Arc::clone(&transport));

        let err = client
            .call(&Call::new("/S/M", json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TrafficError::Call { attempts, status } => {
                assert_eq!(attempts, 4);
                assert_eq!(status.code(), Code::Unavailable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
