//! The unit of work flowing through admission, selection and dispatch.

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::StatusCode;

/// One RPC invocation.
#[derive(Debug, Clone)]
pub struct Call {
    /// Fully qualified method, e.g. `/UserService/GetById`.
    pub method: String,
    /// Typed request payload.
    pub payload: serde_json::Value,
    /// Metadata forwarded to the backend node.
    pub metadata: HeaderMap,
}

impl Call {
    /// A call without metadata. A leading `/` is added when missing.
    pub fn new(method: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut method = method.into();
        if !method.starts_with('/') {
            method.insert(0, '/');
        }
        Self {
            method,
            payload,
            metadata: HeaderMap::new(),
        }
    }

    /// Looks up a payload field. Names starting with `/` are JSON pointers
    /// into nested objects; anything else is a top-level key.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        if name.starts_with('/') {
            self.payload.pointer(name)
        } else {
            self.payload.get(name)
        }
    }
}

/// A successful response from a backend node.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn method_gets_leading_slash() {
        assert_eq!(Call::new("UserService/GetById", json!(null)).method, "/UserService/GetById");
        assert_eq!(Call::new("/UserService/GetById", json!(null)).method, "/UserService/GetById");
    }

    #[test]
    fn field_supports_top_level_and_pointer_lookups() {
        let call = Call::new("/S/M", json!({ "id": 7, "user": { "id": "u-1" } }));
        assert_eq!(call.field("id"), Some(&json!(7)));
        assert_eq!(call.field("/user/id"), Some(&json!("u-1")));
        assert_eq!(call.field("missing"), None);
    }
}
