// Error handling module
// Defines the error taxonomy surfaced to callers of the access layer

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Coarse classification of a failure.
///
/// Consumers branch on this (e.g. "redirect to login" vs "offer retry"),
/// never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthExpired,
    TransientNetwork,
    ServerRejected,
    ProtocolViolation,
    Cancelled,
    Internal,
}

/// Errors returned by every public operation of the client
#[derive(Error, Debug)]
pub enum ApiError {
    /// Credentials are stale and could not be refreshed; the session was cleared
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Connectivity failure, timeout, or a bare 5xx from an intermediary
    #[error("Network error: {message}")]
    TransientNetwork {
        status: Option<u16>,
        message: String,
    },

    /// Non-2xx response from the API
    #[error("Server rejected request: {status} - {message}")]
    ServerRejected { status: u16, message: String },

    /// Response could not be decoded into the expected shape
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Upload was cancelled by the caller
    #[error("Upload cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Local failure (I/O, persistence, request construction)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::AuthExpired(_) => ErrorKind::AuthExpired,
            ApiError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            ApiError::ServerRejected { .. } => ErrorKind::ServerRejected,
            ApiError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::ConfigError(_) | ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status attached to the failure, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ServerRejected { status, .. } => Some(*status),
            ApiError::TransientNetwork { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }

    /// Whether a bounded backoff retry may recover this failure
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }

    /// Classify a transport-level reqwest failure
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ApiError::ProtocolViolation(format!("Failed to decode response: {}", e));
        }
        if e.is_builder() {
            return ApiError::Internal(anyhow::anyhow!("Failed to build request: {}", e));
        }

        let error_kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else {
            "unknown"
        };

        ApiError::TransientNetwork {
            status: e.status().map(|s| s.as_u16()),
            message: format!("{} (kind: {})", e, error_kind),
        }
    }

    /// Classify a non-2xx response from its status and raw body
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        if let Some(message) = structured_message(body) {
            return ApiError::ServerRejected {
                status: status.as_u16(),
                message,
            };
        }

        if status.is_server_error() {
            return ApiError::TransientNetwork {
                status: Some(status.as_u16()),
                message: format!("{} - {}", status, body.trim()),
            };
        }

        ApiError::ServerRejected {
            status: status.as_u16(),
            message: body.trim().to_string(),
        }
    }
}

/// Extract a server message from `{"message": ..}`, `{"error": ".."}` or
/// `{"error": {"message": ..}}` bodies
fn structured_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let obj = json.as_object()?;

    if let Some(msg) = obj.get("message").and_then(|v| v.as_str()) {
        return Some(msg.to_string());
    }

    match obj.get("error")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(inner) => inner
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ApiError::AuthExpired("refresh failed".to_string());
        assert_eq!(err.to_string(), "Authentication expired: refresh failed");

        let err = ApiError::ServerRejected {
            status: 409,
            message: "Duplicate upload".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Server rejected request: 409 - Duplicate upload"
        );

        let err = ApiError::ProtocolViolation("missing uploadId".to_string());
        assert_eq!(err.to_string(), "Protocol violation: missing uploadId");
    }

    #[test]
    fn test_internal_error_message() {
        let err = ApiError::Internal(anyhow::anyhow!("Something went wrong"));
        assert_eq!(err.to_string(), "Internal error: Something went wrong");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ApiError::AuthExpired(String::new()).kind(),
            ErrorKind::AuthExpired
        );
        assert_eq!(
            ApiError::TransientNetwork {
                status: None,
                message: String::new()
            }
            .kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(ApiError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ApiError::ConfigError("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_structured_body_is_server_rejected() {
        let err = ApiError::from_response(
            StatusCode::BAD_REQUEST,
            r#"{"success": false, "message": "File too large"}"#,
        );
        assert_eq!(err.kind(), ErrorKind::ServerRejected);
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("File too large"));
    }

    #[test]
    fn test_nested_error_body() {
        let err = ApiError::from_response(
            StatusCode::FORBIDDEN,
            r#"{"error": {"message": "Forbidden resource"}}"#,
        );
        assert!(matches!(
            err,
            ApiError::ServerRejected { status: 403, ref message } if message == "Forbidden resource"
        ));

        let err = ApiError::from_response(StatusCode::UNAUTHORIZED, r#"{"error": "expired"}"#);
        assert!(err.is_unauthorized());
    }

    #[test]
    fn test_structured_5xx_is_not_transient() {
        let err = ApiError::from_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"message": "Reassembly failed"}"#,
        );
        assert_eq!(err.kind(), ErrorKind::ServerRejected);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_bare_5xx_is_transient() {
        let err = ApiError::from_response(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(err.is_transient());
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn test_bare_4xx_is_server_rejected() {
        let err = ApiError::from_response(StatusCode::NOT_FOUND, "not found");
        assert_eq!(err.kind(), ErrorKind::ServerRejected);
        assert_eq!(err.to_string(), "Server rejected request: 404 - not found");
    }
}
