use bon::Builder;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::Result;

/// WebSocket API request envelope: `{"id": ..., "method": ..., "params": {...}}`.
///
/// The id is what [`Client`](super::Client) tracks, and what the matching response echoes back.
///
/// # Example
///
/// ```
/// use exchange_ws_sdk::ws::Request;
/// use serde_json::json;
///
/// let request = Request::builder()
///     .method("account.status")
///     .params(json!({ "timestamp": 1_700_000_000_000_i64 }))
///     .build();
///
/// assert_eq!(request.id.len(), 36);
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Builder)]
pub struct Request {
    /// Request id, a random UUID unless set explicitly
    #[builder(into, default = new_request_id())]
    pub id: String,
    /// API method name, e.g. `order.place`
    #[builder(into)]
    pub method: String,
    /// Method parameters, an empty object by default
    #[builder(default = Value::Object(Map::new()))]
    pub params: Value,
}

impl Request {
    /// Create a request with a fresh id and the given `params`.
    pub fn new<M: Into<String>, P: Serialize>(method: M, params: &P) -> Result<Self> {
        Ok(Self {
            id: new_request_id(),
            method: method.into(),
            params: serde_json::to_value(params)?,
        })
    }

    /// Replace the generated id.
    #[must_use]
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    /// Serialize to the bytes sent over the socket.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Random (v4) UUID suitable as a request id.
#[must_use]
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
