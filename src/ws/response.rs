use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;

/// WebSocket API response envelope.
///
/// ```json
/// {"id": "r1", "status": 200, "result": {...}, "rateLimits": [...]}
/// {"id": "r1", "status": 400, "error": {"code": -1121, "msg": "Invalid symbol."}}
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Id of the request this answers
    #[serde(default)]
    pub id: Option<String>,
    /// HTTP-like status code, `None` when the envelope carries none
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ApiError>,
    /// Rate limit usage, passed through untouched
    #[serde(default)]
    pub rate_limits: Vec<Value>,
}

impl Response {
    /// No error object, and a 2xx status if one was sent.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_none_or(|status| (200..300).contains(&status))
    }

    /// The `result` payload, or the exchange error as an [`Error`] of kind
    /// [`Status`](crate::error::Kind::Status). A non-2xx status without an error object is
    /// reported with the status as its code.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(Error::status(self.id, error.code, error.msg));
        }
        if let Some(status) = self.status
            && !(200..300).contains(&status)
        {
            return Err(Error::status(
                self.id,
                i64::from(status),
                "no error object in a failed response",
            ));
        }

        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Error object inside a failed response.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

#[derive(Deserialize)]
struct FrameId {
    #[serde(default)]
    id: Option<String>,
}

/// Extract the top-level `id` of an inbound frame.
///
/// A frame without an `id` (or with `"id": null`) yields `None`. A frame that is not valid
/// JSON, or whose `id` is not a string, is an error.
pub fn frame_id(frame: &[u8]) -> std::result::Result<Option<String>, serde_json::Error> {
    serde_json::from_slice::<FrameId>(frame).map(|f| f.id)
}
