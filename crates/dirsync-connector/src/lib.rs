//! # Connector Framework
//!
//! Shared building blocks for paginated read connectors.
//!
//! A connector produces pages of flat objects from a datasource and hands the
//! caller an opaque cursor to resume from. This crate owns the parts every
//! connector shares:
//!
//! - [`cursor`] - Composite cursor encoding, validation and offset pagination
//! - [`error`] - Error taxonomy with status codes and transient classification
//! - [`operation`] - Attribute values, requested attributes and page responses
//! - [`traits`] - The [`Dispatcher`](traits::Dispatcher) and
//!   [`ProxyClient`](traits::ProxyClient) capabilities for tunneled requests
//! - [`status`] - Tunnel RPC status to transport status mapping
//! - [`context`] - Per-call routing metadata
//! - [`config`] - Configuration trait and common settings
//! - [`ids`] - Type-safe identifiers
//!
//! ## Example
//!
//! ```
//! use dirsync_connector::prelude::*;
//! use serde_json::Value;
//!
//! let items = vec!["a", "b", "c"];
//! let (page, next) = paginate(&items, 2, None).unwrap();
//! assert_eq!(page, vec!["a", "b"]);
//!
//! let token = encode(Some(&CompositeCursor::new(next.unwrap()))).unwrap();
//! let cursor: Option<CompositeCursor<Value>> = decode(token.as_deref()).unwrap();
//! let (rest, next) = paginate(&items, 2, cursor.and_then(|c| c.cursor).as_ref()).unwrap();
//! assert_eq!(rest, vec!["c"]);
//! assert!(next.is_none());
//! ```

pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod ids;
pub mod operation;
pub mod status;
pub mod traits;

/// Prelude module for convenient imports.
///
/// ```
/// use dirsync_connector::prelude::*;
/// ```
pub mod prelude {
    // IDs
    pub use crate::ids::{ConnectorId, TenantId};

    // Error handling
    pub use crate::error::{ConnectorError, ConnectorResult};

    // Cursor
    pub use crate::cursor::{
        decode, encode, paginate, parse_offset, update_from_collection_api, validate_cursor,
        CompositeCursor,
    };

    // Operations
    pub use crate::operation::{
        AttributeConfig, AttributeSet, AttributeType, AttributeValue, PageResponse,
    };

    // Context and dispatch
    pub use crate::context::{ConnectorRoute, RequestContext};
    pub use crate::status::status_from_rpc_code;
    pub use crate::traits::{Dispatcher, ProxyClient};

    // Configuration
    pub use crate::config::{AuthConfig, ConnectionSettings, ConnectorConfig};
}

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _id = ConnectorId::new();
        let _attrs = AttributeSet::new().with("cn", "test");
        let _cursor: CompositeCursor<serde_json::Value> = CompositeCursor::default();
        let _settings = ConnectionSettings::default();
        let _ctx = RequestContext::new();
        assert_eq!(PageResponse::rejected(503).status_code, 503);
    }
}
