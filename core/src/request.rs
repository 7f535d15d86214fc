//! Framework-independent request and response values.
//!
//! The coordinator never sees a web framework's types: the HTTP binding
//! converts its request into an [`IncomingRequest`] and turns the
//! [`OutcomeResponse`] back into a response.

use crate::error::IdempotencyError;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::Value;

/// Header carrying the client-chosen key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Whether `method` participates in the protocol (`POST`, `PUT`, `PATCH`).
#[must_use]
pub fn is_mutating_method(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// The parts of an HTTP request the protocol looks at.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Request method
    pub method: Method,
    /// Request path, without the query string
    pub path: String,
    /// Raw request body
    pub body: Bytes,
    /// Request headers
    pub headers: HeaderMap,
    /// Owner scope resolved by the authentication layer, if any
    pub owner: Option<String>,
}

impl IncomingRequest {
    /// Create a request with no headers and no owner.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into(),
            body: body.into(),
            headers: HeaderMap::new(),
            owner: None,
        }
    }

    /// Attach an `Idempotency-Key` header.
    ///
    /// Values that are not valid header text are ignored.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(key.as_ref()) {
            self.headers.insert(IDEMPOTENCY_KEY_HEADER, value);
        }
        self
    }

    /// Scope the key to an owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// The raw `Idempotency-Key` header, if present.
    #[must_use]
    pub fn idempotency_key_header(&self) -> Option<&HeaderValue> {
        self.headers.get(IDEMPOTENCY_KEY_HEADER)
    }
}

/// Final outcome of an admitted request: status code and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeResponse {
    /// HTTP status code
    pub status_code: u16,
    /// Response body
    pub body: Value,
}

impl OutcomeResponse {
    /// Decode a cached response.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Serialization`] if `body` is not valid JSON.
    pub fn from_cached(status_code: u16, body: &str) -> Result<Self, IdempotencyError> {
        let body = serde_json::from_str(body)
            .map_err(|e| IdempotencyError::Serialization(format!("cached response body: {e}")))?;
        Ok(Self { status_code, body })
    }

    /// The body in canonical text form, byte-identical across replays.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Serialization`] if the body cannot be encoded.
    pub fn canonical_body(&self) -> Result<String, IdempotencyError> {
        canonical_json(&self.body)
    }
}

/// Serialize `value` with object keys sorted and no whitespace.
///
/// Key order is fixed here rather than relying on how `serde_json` stores
/// maps, so the output stays stable whatever features are enabled.
///
/// # Errors
///
/// Returns [`IdempotencyError::Serialization`] if a scalar fails to encode.
///
/// # Example
///
/// ```
/// use idempotency_core::canonical_json;
/// use serde_json::json;
///
/// let text = canonical_json(&json!({"b": [1, {"d": null, "c": true}], "a": "x"})).unwrap();
/// assert_eq!(text, r#"{"a":"x","b":[1,{"c":true,"d":null}]}"#);
/// ```
pub fn canonical_json(value: &Value) -> Result<String, IdempotencyError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), IdempotencyError> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_scalar(&Value::String(key.clone()))?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        scalar => {
            out.push_str(&encode_scalar(scalar)?);
        }
    }
    Ok(())
}

fn encode_scalar(value: &Value) -> Result<String, IdempotencyError> {
    serde_json::to_string(value).map_err(|e| IdempotencyError::Serialization(e.to_string()))
}
