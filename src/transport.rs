//! Dispatching a call to one backend node.
//!
//! [`Transport`] is the seam between traffic control and the wire. The
//! bundled [`HttpTransport`] sends each call as an HTTP/1 `POST` of the
//! JSON payload to `<node address><method>` over a pooled `hyper-util`
//! client, and classifies the outcome into a [`Code`] the retry policy can
//! match on.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::call::{Call, Reply};
use crate::node::Endpoint;
use crate::status::{Code, Status};

/// The HTTP client type used for node connections.
pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Longest backend error body quoted in a [`Status`] message.
const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Sends one call to one node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single attempt. Errors are classified by [`Code`].
    async fn dispatch(&self, node: &Endpoint, call: &Call) -> Result<Reply, Status>;
}

/// Connection pool settings for [`HttpTransport`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

/// JSON-over-HTTP/1 transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(settings: PoolSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(settings.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(settings.idle_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build(connector);
        Self { client }
    }

    /// Wraps an already configured client.
    pub fn with_client(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dispatch(&self, node: &Endpoint, call: &Call) -> Result<Reply, Status> {
        let uri = call_uri(node.uri(), &call.method)
            .map_err(|e| Status::new(Code::InvalidArgument, e))?;
        let body = serde_json::to_vec(&call.payload)
            .map_err(|e| {
                Status::new(Code::InvalidArgument, format!("unserializable payload: {e}"))
            })?;

        let mut req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Status::internal(format!("failed to build request: {e}")))?;

        let headers = req.headers_mut();
        forward_metadata(&call.metadata, headers);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Status::unavailable(format!("{node}: {e}")))?;

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Status::unavailable(format!("{node}: failed to read response: {e}")))?
            .to_bytes();

        match Code::from_http(parts.status) {
            Code::Ok => Ok(Reply {
                status: parts.status,
                headers: parts.headers,
                body,
            }),
            code => Err(Status::new(code, error_message(node, parts.status, &body))),
        }
    }
}

/// Appends `method` to the node's base URI, keeping any path prefix the
/// node was registered with.
fn call_uri(base: &Uri, method: &str) -> Result<Uri, String> {
    let scheme = base
        .scheme()
        .ok_or_else(|| format!("node {base} has no scheme"))?;
    let authority = base
        .authority()
        .ok_or_else(|| format!("node {base} has no authority"))?;

    let prefix = base.path().trim_end_matches('/');
    let method = method.trim_start_matches('/');

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(format!("{prefix}/{method}"))
        .build()
        .map_err(|e| format!("invalid method path {method:?}: {e}"))
}

/// Copies call metadata onto the outgoing request, leaving out
/// connection-scoped headers and those the transport sets itself.
fn forward_metadata(metadata: &HeaderMap, out: &mut HeaderMap) {
    let listed: Vec<HeaderName> = metadata
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
        .collect();

    for (name, value) in metadata {
        let skip = is_hop_by_hop(name)
            || matches!(name.as_str(), "host" | "content-length" | "content-type")
            || listed.contains(name);
        if !skip {
            out.append(name.clone(), value.clone());
        }
    }
}

/// Connection-scoped headers that never cross a hop (RFC 9110 §7.6.1).
pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn error_message(node: &Endpoint, status: hyper::StatusCode, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return format!("{node} answered {status}");
    }
    let mut end = text.len().min(MAX_ERROR_MESSAGE_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{node} answered {status}: {}", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn call_uri_appends_method_to_node() {
        let built = call_uri(&uri("http://10.0.0.7:8090"), "/UserService/GetById").unwrap();
        assert_eq!(built.to_string(), "http://10.0.0.7:8090/UserService/GetById");
    }

    #[test]
    fn call_uri_keeps_node_path_prefix() {
        let built = call_uri(&uri("http://node:80/rpc/"), "/UserService/GetById").unwrap();
        assert_eq!(built.path(), "/rpc/UserService/GetById");
    }

    #[test]
    fn forward_metadata_drops_hop_by_hop_headers() {
        let mut metadata = HeaderMap::new();
        metadata.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        metadata.insert("x-session", HeaderValue::from_static("abc"));
        metadata.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        metadata.insert("host", HeaderValue::from_static("gateway:8100"));
        metadata.insert("x-request-id", HeaderValue::from_static("42"));
        metadata.insert("authorization", HeaderValue::from_static("Bearer t"));

        let mut out = HeaderMap::new();
        forward_metadata(&metadata, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out["x-request-id"], "42");
        assert_eq!(out["authorization"], "Bearer t");
    }

    #[test]
    fn error_message_truncates_long_bodies() {
        let node = Endpoint::new("http://n:1", 1).unwrap();
        let body = "é".repeat(MAX_ERROR_MESSAGE_LEN);
        let msg = error_message(&node, hyper::StatusCode::INTERNAL_SERVER_ERROR, body.as_bytes());
        assert!(msg.len() < MAX_ERROR_MESSAGE_LEN + 64);
        assert!(msg.starts_with("http://n:1 answered 500"));
    }
}
