//! Handler error type and wire error codes.

use crate::envelope::ErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Payload missing or of the wrong shape.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// No handler registered for the requested action.
pub const ACTION_NOT_FOUND: &str = "ACTION_NOT_FOUND";
/// The handler did not finish within the configured timeout.
pub const HANDLER_TIMEOUT: &str = "HANDLER_TIMEOUT";
/// Resource or feature not available.
pub const NOT_AVAILABLE: &str = "NOT_AVAILABLE";

/// Error returned by an action handler. Becomes the `error` body of the response.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Payload missing or of the wrong shape.
    #[error("{message}")]
    InvalidPayload {
        /// Description of what is wrong.
        message: String,
    },

    /// Internal failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Feature or resource not available.
    #[error("{message}")]
    NotAvailable {
        /// Description.
        message: String,
    },

    /// Application-specific error with arbitrary code.
    #[error("{message}")]
    Custom {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl HandlerError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidPayload { .. } => INVALID_PAYLOAD,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::NotAvailable { .. } => NOT_AVAILABLE,
            Self::Custom { code, .. } => code,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_code() {
        let err = HandlerError::InvalidPayload { message: "bad".into() };
        assert_eq!(err.code(), INVALID_PAYLOAD);
        assert_eq!(err.to_string(), "bad");
    }

    #[test]
    fn internal_code() {
        let err = HandlerError::Internal { message: "boom".into() };
        assert_eq!(err.code(), INTERNAL_ERROR);
    }

    #[test]
    fn custom_code_in_body() {
        let err = HandlerError::Custom {
            code: "QUOTA".into(),
            message: "over quota".into(),
        };
        let body = err.to_error_body();
        assert_eq!(body.code, "QUOTA");
        assert_eq!(body.message, "over quota");
    }

    #[test]
    fn serde_error_maps_to_invalid_payload() {
        let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err: HandlerError = json_err.into();
        assert_eq!(err.code(), INVALID_PAYLOAD);
    }
}
