//! Connector Framework configuration types
//!
//! Base trait and common configuration structures.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConnectorResult;

/// Placeholder written in place of secrets in redacted copies.
pub const REDACTED: &str = "***REDACTED***";

/// Trait for connector-specific request configuration.
///
/// Only the checks the connector core itself depends on belong in
/// [`ConnectorConfig::validate`]; full request validation happens upstream.
pub trait ConnectorConfig: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Validate the configuration.
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> ConnectorResult<()>;

    /// Create a redacted version of this config (for logging/display).
    ///
    /// Sensitive fields should be replaced with placeholders.
    fn redacted(&self) -> Self;
}

/// Common connection settings shared across connector types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection timeout in seconds (dial + bind).
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Request timeout used when a request does not carry its own.
    #[serde(default = "default_request_timeout")]
    pub default_request_timeout_secs: u64,
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            default_request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ConnectionSettings {
    /// Create new connection settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the default request timeout.
    pub fn with_default_request_timeout(mut self, secs: u64) -> Self {
        self.default_request_timeout_secs = secs;
        self
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Resolve the effective request timeout; `0` selects the default.
    pub fn request_timeout(&self, requested_secs: u64) -> Duration {
        if requested_secs == 0 {
            Duration::from_secs(self.default_request_timeout_secs)
        } else {
            Duration::from_secs(requested_secs)
        }
    }
}

/// Authentication method configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Anonymous bind.
    #[default]
    None,

    /// Simple bind with a DN (or UPN) and password.
    Basic {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Basic { username, password } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &password.as_ref().map(|_| REDACTED))
                .finish(),
        }
    }
}

impl AuthConfig {
    /// Create basic authentication config.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthConfig::Basic {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    /// Bind DN and password; empty strings for an anonymous bind.
    pub fn bind_credentials(&self) -> (&str, &str) {
        match self {
            AuthConfig::None => ("", ""),
            AuthConfig::Basic { username, password } => {
                (username.as_str(), password.as_deref().unwrap_or(""))
            }
        }
    }

    /// Create a redacted version.
    pub fn redacted(&self) -> Self {
        match self {
            AuthConfig::None => AuthConfig::None,
            AuthConfig::Basic { username, .. } => AuthConfig::Basic {
                username: username.clone(),
                password: Some(REDACTED.to_string()),
            },
        }
    }
}
