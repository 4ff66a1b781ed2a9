//! Wire error payloads

use serde_json::{json, Value};

/// Error reported to a client as `{success:false, error, errorType}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub error_type: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self {
            error_type: "protocolError",
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            error_type: "internalError",
            message: msg.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": false,
            "error": self.message,
            "errorType": self.error_type,
        })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl From<talkhead_core::Error> for ApiError {
    fn from(err: talkhead_core::Error) -> Self {
        Self {
            error_type: err.error_type(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal(format!("Failed to encode response: {err}"))
    }
}
