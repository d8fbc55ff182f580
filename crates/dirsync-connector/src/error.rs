//! Connector Framework error types
//!
//! Every failure the core can produce is classified into one of a small set of
//! kinds so callers can decide on their own retry/backoff policy.

use http::StatusCode;
use thiserror::Error;

/// Error that can occur while producing a page of objects.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // Client input errors
    /// The opaque cursor is malformed, out of range, or does not match the entity.
    #[error("invalid cursor: {message}")]
    InvalidCursor { message: String },

    /// A raw attribute value does not match its declared type or syntax.
    #[error("invalid value for attribute '{attribute}': {message}")]
    InvalidAttributeType { attribute: String, message: String },

    /// Connector or entity configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Datasource errors
    /// The datasource answered with a non-success status.
    #[error("datasource rejected the request with status {status_code}: {message}")]
    DatasourceRejected { status_code: u16, message: String },

    /// Invalid credentials provided.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    // Transport errors
    /// Failed to establish connection to the datasource.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request did not complete within the configured timeout.
    #[error("request timed out after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    /// The datasource or the remote tunnel cannot be reached.
    #[error("target unavailable: {message}")]
    TargetUnavailable { message: String },

    // Internal errors
    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl ConnectorError {
    /// Whether the failure is caused by a condition that may clear on its own.
    ///
    /// Purely informational: nothing in this crate retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::ConnectionTimeout { .. }
                | ConnectorError::TargetUnavailable { .. }
        )
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::InvalidCursor { .. } => "INVALID_CURSOR",
            ConnectorError::InvalidAttributeType { .. } => "INVALID_ATTRIBUTE_TYPE",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::DatasourceRejected { .. } => "DATASOURCE_REJECTED",
            ConnectorError::AuthenticationFailed => "AUTH_FAILED",
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ConnectorError::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
            ConnectorError::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Transport status code equivalent of this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectorError::InvalidCursor { .. }
            | ConnectorError::InvalidAttributeType { .. }
            | ConnectorError::InvalidConfiguration { .. } => StatusCode::BAD_REQUEST,
            ConnectorError::DatasourceRejected { status_code, .. } => {
                StatusCode::from_u16(*status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ConnectorError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ConnectorError::ConnectionFailed { .. } => StatusCode::BAD_GATEWAY,
            ConnectorError::ConnectionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ConnectorError::TargetUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ConnectorError::Internal { .. } | ConnectorError::Serialization { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    // Convenience constructors

    /// Create an invalid cursor error.
    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        ConnectorError::InvalidCursor {
            message: message.into(),
        }
    }

    /// Create an invalid attribute type error.
    pub fn invalid_attribute_type(
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ConnectorError::InvalidAttributeType {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with source.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
