//! Error types and HTTP status code mapping.

use std::fmt;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use crate::admission::Tier;
use crate::rate_limit::LimiterError;
use crate::status::{Code, Status};

/// Every failure the traffic-control layer can produce.
#[derive(Debug)]
pub enum TrafficError {
    /// Invalid weights, malformed policies or an unreadable configuration
    /// file. Fatal at setup.
    Config(String),
    /// The node set of the target is empty.
    EmptyPool,
    /// The admission chain denied the call at the given tier.
    Limited { tier: Tier },
    /// The limiter of the given tier could not evaluate the quota and the
    /// chain runs fail-closed.
    LimiterUnavailable { tier: Tier, cause: LimiterError },
    /// The call failed; `status` is the last attempt's failure.
    Call { attempts: u32, status: Status },
    /// The caller cancelled the call.
    Cancelled,
    /// The inbound request could not be turned into a call.
    BadRequest(String),
    /// The inbound request used a method other than POST.
    MethodNotAllowed,
    /// The inbound request body exceeds the configured limit in bytes.
    BodyTooLarge { limit: u64 },
    /// Too many requests are in flight.
    ServiceUnavailable { limit: usize },
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for TrafficError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::EmptyPool => write!(f, "no backend node available"),
            Self::Limited { tier } => write!(f, "rate limited by {tier} limiter"),
            Self::LimiterUnavailable { tier, cause } => {
                write!(f, "{tier} limiter could not be evaluated: {cause}")
            }
            Self::Call { attempts, status } => {
                write!(f, "call failed after {attempts} attempt(s): {status}")
            }
            Self::Cancelled => write!(f, "call cancelled"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::MethodNotAllowed => write!(f, "only POST requests carry calls"),
            Self::BodyTooLarge { limit } => {
                write!(f, "request body exceeds the {limit} byte limit")
            }
            Self::ServiceUnavailable { limit } => {
                write!(f, "concurrency limit of {limit} requests reached")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for TrafficError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::LimiterUnavailable { cause, .. } => Some(cause),
            Self::Call { status, .. } => Some(status),
            _ => None,
        }
    }
}

impl TrafficError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::EmptyPool | Self::LimiterUnavailable { .. } | Self::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Limited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Call { status, .. } => status.code().http_status(),
            Self::Cancelled => Code::Cancelled.http_status(),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Short machine-readable tag used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::EmptyPool => "empty_pool",
            Self::Limited { .. } => "resource_exhausted",
            Self::LimiterUnavailable { .. } => "limiter_unavailable",
            Self::Call { .. } => "call_failed",
            Self::Cancelled => "cancelled",
            Self::BadRequest(_) => "bad_request",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match &self {
            Self::Limited { tier } | Self::LimiterUnavailable { tier, .. } => {
                body["tier"] = serde_json::json!(tier.as_str());
            }
            Self::Call { attempts, status } => {
                body["attempts"] = serde_json::json!(attempts);
                body["code"] = serde_json::json!(status.code().as_str());
            }
            _ => {}
        }

        Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(Full::new(Bytes::new()));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

impl From<hyper::http::Error> for TrafficError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TrafficError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("malformed JSON payload: {err}"))
    }
}
