//! Wire envelope carried in every frame.
//!
//! One JSON object per frame, no batching:
//!
//! ```json
//! {"id":"...","type":"request","action":"echo","data":{"x":1}}
//! {"id":"...","type":"response","action":"echo","data":{"x":1}}
//! {"id":"...","type":"response","action":"echo","data":null,"error":{"code":"ACTION_NOT_FOUND","message":"..."}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Direction of an envelope relative to the call it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// Asks the peer to run `action`.
    Request,
    /// Answers a request with the same `id`.
    Response,
}

/// Structured error carried on a response whose handler did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `ACTION_NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// A single request or response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id. Unique per in-flight request; echoed on the response.
    pub id: String,
    /// Request or response.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Action name. Required on requests, echoed verbatim on responses.
    #[serde(default)]
    pub action: String,
    /// Application payload, opaque to this layer.
    #[serde(default)]
    pub data: Value,
    /// Present only on error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Failure to turn a frame into an [`Envelope`] or back.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is not a JSON envelope.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// A binary frame did not hold UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,
    /// The envelope has an empty correlation id.
    #[error("envelope has no id")]
    MissingId,
    /// A request arrived without an action.
    #[error("request {id} has no action")]
    MissingAction {
        /// Correlation id of the offending request.
        id: String,
    },
}

impl Envelope {
    /// Build a request.
    pub fn request(id: impl Into<String>, action: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            kind: EnvelopeType::Request,
            action: action.into(),
            data,
            error: None,
        }
    }

    /// Build the successful response to `request`, reusing its id and action.
    pub fn response_to(request: &Envelope, data: Value) -> Self {
        Self {
            id: request.id.clone(),
            kind: EnvelopeType::Response,
            action: request.action.clone(),
            data,
            error: None,
        }
    }

    /// Build an error response to `request`.
    pub fn error_response(
        request: &Envelope,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: request.id.clone(),
            kind: EnvelopeType::Response,
            action: request.action.clone(),
            data: Value::Null,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Whether this is a request.
    pub fn is_request(&self) -> bool {
        self.kind == EnvelopeType::Request
    }

    /// Whether this is a response.
    pub fn is_response(&self) -> bool {
        self.kind == EnvelopeType::Response
    }

    /// Deserialize the payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Serialize to the text of one frame.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the text of one frame.
    ///
    /// Returns `Ok(None)` for frames that carry no operation: an empty frame
    /// or the JSON literal `null`.
    pub fn decode(text: &str) -> Result<Option<Self>, EnvelopeError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let Some(envelope) = serde_json::from_str::<Option<Self>>(text)? else {
            return Ok(None);
        };
        envelope.validate()?;
        Ok(Some(envelope))
    }

    /// Decode a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Option<Self>, EnvelopeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| EnvelopeError::InvalidUtf8)?;
        Self::decode(text)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        if self.is_request() && self.action.is_empty() {
            return Err(EnvelopeError::MissingAction {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}
