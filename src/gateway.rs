//! Inbound HTTP handler turning requests into calls.
//!
//! A request `POST /<Service>/<Method>` with a JSON body becomes a
//! [`Call`] whose method is the request path and whose metadata are the
//! request headers. The call passes the server-side admission chain, then
//! goes out through the [`RpcClient`]. The node's reply is returned as is;
//! every failure becomes a JSON error response.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::admission::AdmissionChain;
use crate::call::{Call, Reply};
use crate::client::RpcClient;
use crate::transport::is_hop_by_hop;
use crate::{Result, TrafficError};

type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Server-side state shared by every inbound request.
#[derive(Debug, Clone)]
pub struct Gateway {
    chain: AdmissionChain,
    client: RpcClient,
    max_body_size: u64,
}

impl Gateway {
    pub fn new(chain: AdmissionChain, client: RpcClient, max_body_size: u64) -> Self {
        Self {
            chain,
            client,
            max_body_size,
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }
}

/// Processes a single inbound request.
///
/// Errors are returned rather than rendered so callers can decide on the
/// response; the server renders them with [`TrafficError::into_response`].
/// Dropping the returned future cancels the outgoing call.
pub async fn handle_request<B>(
    req: Request<B>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    async move {
        if req.method() != Method::POST {
            debug!("rejecting non-POST request");
            return Err(TrafficError::MethodNotAllowed);
        }

        if declared_length(req.headers()).is_some_and(|len| len > gateway.max_body_size) {
            warn!(limit = gateway.max_body_size, "request body exceeds size limit");
            return Err(TrafficError::BodyTooLarge {
                limit: gateway.max_body_size,
            });
        }

        let call = read_call(req, gateway.max_body_size).await?;

        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let start = std::time::Instant::now();
        let reply = gateway
            .chain
            .intercept(&call, || gateway.client.call(&call, &cancel))
            .await
            .inspect_err(|e| {
                info!(
                    error = %e,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "call rejected"
                );
            })?;

        info!(
            status = reply.status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "call completed"
        );
        build_response(reply)
    }
    .instrument(span)
    .await
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Buffers the body up to `limit` bytes and builds the call. An empty body
/// is a `null` payload.
async fn read_call<B>(req: Request<B>, limit: u64) -> Result<Call>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let (parts, body) = req.into_parts();

    let method = parts.uri.path();
    if method.trim_matches('/').is_empty() {
        return Err(TrafficError::BadRequest(
            "request path must name the method".into(),
        ));
    }

    let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
    let bytes = Limited::new(body, limit_usize)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                TrafficError::BodyTooLarge { limit }
            } else {
                TrafficError::BadRequest(format!("failed to read request body: {e}"))
            }
        })?
        .to_bytes();

    let payload = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };

    let mut call = Call::new(method, payload);
    call.metadata = parts.headers;
    Ok(call)
}

fn build_response(reply: Reply) -> Result<Response<Full<Bytes>>> {
    let mut resp = Response::builder().status(reply.status);
    if let Some(headers) = resp.headers_mut() {
        for (name, value) in &reply.headers {
            if !is_hop_by_hop(name) && name != header::CONTENT_LENGTH {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    Ok(resp.body(Full::new(reply.body))?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use hyper::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::balancer::WeightedSelector;
    use crate::node::Endpoint;
    use crate::retry::RetryCoordinator;
    use crate::status::Status;
    use crate::transport::Transport;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn dispatch(
            &self,
            node: &Endpoint,
            call: &Call,
        ) -> std::result::Result<Reply, Status> {
            let mut headers = HeaderMap::new();
            headers.insert("x-node", node.address().parse().unwrap());
            headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
            let body = json!({ "method": call.method, "payload": call.payload });
            Ok(Reply {
                status: StatusCode::OK,
                headers,
                body: Bytes::from(body.to_string()),
            })
        }
    }

    fn gateway(max_body_size: u64) -> Arc<Gateway> {
        let selector =
            WeightedSelector::from_endpoints([Endpoint::new("http://n:1", 1).unwrap()]).unwrap();
        let client = RpcClient::new(
            AdmissionChain::permissive(),
            selector,
            RetryCoordinator::default(),
            Arc::new(Echo),
            Duration::from_secs(1),
        );
        Arc::new(Gateway::new(AdmissionChain::permissive(), client, max_body_size))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn post(path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_call_and_returns_reply() {
        let req = post("/UserService/GetById", r#"{"id":7}"#);
        let resp = handle_request(req, gateway(1024), addr()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-node"], "http://n:1");
        assert!(!resp.headers().contains_key(header::TRANSFER_ENCODING));

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["method"], "/UserService/GetById");
        assert_eq!(body["payload"]["id"], 7);
    }

    #[tokio::test]
    async fn empty_body_is_null_payload() {
        let resp = handle_request(post("/S/M", ""), gateway(1024), addr())
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["payload"].is_null());
    }

    #[tokio::test]
    async fn rejects_non_post() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/S/M")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = handle_request(req, gateway(1024), addr()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let err = handle_request(post("/S/M", r#"{"data":"0123456789"}"#), gateway(8), addr())
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::BodyTooLarge { limit: 8 }));
    }

    #[tokio::test]
    async fn rejects_oversized_declared_length() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/S/M")
            .header(header::CONTENT_LENGTH, "4096")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = handle_request(req, gateway(1024), addr()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn rejects_malformed_json() {
        let err = handle_request(post("/S/M", "{not json"), gateway(1024), addr())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_missing_method() {
        let err = handle_request(post("/", "{}"), gateway(1024), addr())
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::BadRequest(_)));
    }
}
