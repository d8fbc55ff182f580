//! # LDAP Connector
//!
//! Paginated reads of LDAP and Active Directory entries for directory sync.
//!
//! Each call returns one page of flat objects plus an opaque cursor. Plain
//! entities page with the RFC 2696 paged results control; member entities
//! walk the items of a parent collection and emit one row per member, using
//! Active Directory range retrieval for large membership attributes.
//!
//! ## Features
//!
//! - LDAP v3 and LDAPS with custom trust roots
//! - Session cache keyed by paging cookie, with idle eviction
//! - Active Directory binary syntaxes (GUID, SID, security descriptors)
//! - Duration and timestamp coercion, including Windows FILETIME
//! - Tunnel dispatch for requests that carry a connector route
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_connector::prelude::*;
//! use dirsync_connector_ldap::{LdapConnector, LdapConnectorSettings, LdapRequest};
//!
//! let connector = LdapConnector::new(LdapConnectorSettings::default());
//! let request: LdapRequest = serde_json::from_str(body)?;
//!
//! let page = connector.get_page(&RequestContext::new(), &request).await?;
//! for object in &page.objects {
//!     println!("{:?}", object.get_string("dn"));
//! }
//! ```

pub mod codes;
pub mod coerce;
pub mod config;
pub mod connection;
pub mod connector;
pub mod page_info;
pub mod search;
pub mod session;
pub mod target;
pub mod traversal;

// Re-exports
pub use config::{
    ConnectionParams, EntityConfig, LdapConnectorSettings, LdapRequest, SessionSettings,
};
pub use connection::{Dialer, DirectoryConnection, DirectoryQuery, DirectoryResponse, Ldap3Dialer};
pub use connector::LdapConnector;
pub use page_info::PageInfo;
pub use search::{DirectoryClient, ReleasePolicy, SearchPage};
pub use session::{Session, SessionCache};
pub use target::{DialTarget, LdapTarget};
