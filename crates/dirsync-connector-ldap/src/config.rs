//! LDAP Connector configuration
//!
//! Request, entity and connector-level settings for paged directory reads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use dirsync_connector::config::{AuthConfig, ConnectionSettings, ConnectorConfig};
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::AttributeConfig;

/// Placeholder in a member query replaced by the collection item's unique id.
pub const COLLECTION_ID_PLACEHOLDER: &str = "{{CollectionId}}";

/// Placeholder in a member query replaced by the collection item's
/// `collection_attribute` value.
pub const COLLECTION_ATTRIBUTE_PLACEHOLDER: &str = "{{CollectionAttribute}}";

/// One page request against a directory server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapRequest {
    /// `ldap://host[:port]`, `ldaps://host[:port]` or a bare `host[:port]`.
    pub base_url: String,

    /// Bind credentials.
    #[serde(default)]
    pub auth: AuthConfig,

    pub connection_params: ConnectionParams,

    /// Maximum number of objects to return.
    pub page_size: i64,

    /// Entity being synced; a key of `entity_config_map`.
    pub entity_external_id: String,

    /// Opaque cursor from the previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    pub entity_config_map: HashMap<String, EntityConfig>,

    /// Attributes to return for each object.
    #[serde(default)]
    pub attributes: Vec<AttributeConfig>,

    /// Request timeout; `0` uses the connector default.
    #[serde(default)]
    pub timeout_secs: u64,
}

/// Directory-specific connection parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Search base (e.g., "dc=example,dc=com").
    pub base_dn: String,

    /// Base64-encoded PEM chain trusted for TLS connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_chain: Option<String>,
}

/// Static per-entity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Search filter, optionally with collection placeholders.
    pub query: String,

    /// Parent collection entity for member-of-collection entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_of: Option<String>,

    /// Collection item attribute substituted for `{{CollectionAttribute}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_attribute: Option<String>,

    /// Output attribute holding the member's value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_unique_id_attribute: Option<String>,

    /// Output attribute holding the collection item's unique id; also the
    /// attribute read from each collection item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_of_unique_id_attribute: Option<String>,

    /// Multi-valued membership attribute on the collection item.
    #[serde(default = "default_member_attribute")]
    pub member_attribute: String,

    /// Collection items fetched per internal search.
    #[serde(default = "default_member_of_group_batch_size")]
    pub member_of_group_batch_size: i64,
}

fn default_member_attribute() -> String {
    "member".to_string()
}

fn default_member_of_group_batch_size() -> i64 {
    10
}

impl EntityConfig {
    /// Plain entity with the given filter.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            member_of: None,
            collection_attribute: None,
            member_unique_id_attribute: None,
            member_of_unique_id_attribute: None,
            member_attribute: default_member_attribute(),
            member_of_group_batch_size: default_member_of_group_batch_size(),
        }
    }

    /// Member-of-collection entity.
    pub fn member_of(
        query: impl Into<String>,
        parent: impl Into<String>,
        member_unique_id_attribute: impl Into<String>,
        member_of_unique_id_attribute: impl Into<String>,
    ) -> Self {
        Self {
            member_of: Some(parent.into()),
            member_unique_id_attribute: Some(member_unique_id_attribute.into()),
            member_of_unique_id_attribute: Some(member_of_unique_id_attribute.into()),
            ..Self::new(query)
        }
    }

    /// Set the membership attribute.
    pub fn with_member_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.member_attribute = attribute.into();
        self
    }

    /// Set the collection attribute.
    pub fn with_collection_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.collection_attribute = Some(attribute.into());
        self
    }

    /// Set the collection batch size.
    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.member_of_group_batch_size = size;
        self
    }

    /// Whether this entity enumerates members of a parent collection.
    pub fn is_member_entity(&self) -> bool {
        self.member_of.is_some()
    }
}

impl LdapRequest {
    /// Configuration of the requested entity.
    pub fn entity(&self) -> ConnectorResult<&EntityConfig> {
        self.entity_config_map
            .get(&self.entity_external_id)
            .ok_or_else(|| {
                ConnectorError::invalid_configuration(format!(
                    "entity '{}' has no configuration",
                    self.entity_external_id
                ))
            })
    }

    /// Configuration of the parent collection of a member entity.
    pub fn parent_entity(&self) -> ConnectorResult<Option<(&str, &EntityConfig)>> {
        let Some(parent) = self.entity()?.member_of.as_deref() else {
            return Ok(None);
        };
        let config = self.entity_config_map.get(parent).ok_or_else(|| {
            ConnectorError::invalid_configuration(format!(
                "collection entity '{parent}' of '{}' has no configuration",
                self.entity_external_id
            ))
        })?;
        Ok(Some((parent, config)))
    }
}

impl ConnectorConfig for LdapRequest {
    fn validate(&self) -> ConnectorResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(ConnectorError::invalid_configuration("base_url is required"));
        }

        if self.page_size < 1 {
            return Err(ConnectorError::invalid_configuration(format!(
                "page_size must be at least 1, got {}",
                self.page_size
            )));
        }

        let entity = self.entity()?;
        if entity.query.trim().is_empty() {
            return Err(ConnectorError::invalid_configuration(format!(
                "entity '{}' has an empty query",
                self.entity_external_id
            )));
        }

        if let Some((_, parent)) = self.parent_entity()? {
            if parent.query.trim().is_empty() {
                return Err(ConnectorError::invalid_configuration(
                    "collection entity has an empty query",
                ));
            }
            if entity.member_unique_id_attribute.is_none()
                || entity.member_of_unique_id_attribute.is_none()
            {
                return Err(ConnectorError::invalid_configuration(format!(
                    "member entity '{}' requires member_unique_id_attribute and member_of_unique_id_attribute",
                    self.entity_external_id
                )));
            }
            if entity.member_of_group_batch_size < 1 {
                return Err(ConnectorError::invalid_configuration(
                    "member_of_group_batch_size must be at least 1",
                ));
            }
        }

        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut request = self.clone();
        request.auth = request.auth.redacted();
        request
    }
}

/// Settings for the session cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle time after which a cached connection is closed.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

fn default_session_ttl() -> u64 {
    300
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
        }
    }
}

impl SessionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Eviction interval: a quarter of the TTL, but never below one minute.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs((self.ttl_secs / 4).max(60))
    }
}

/// Connector-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapConnectorSettings {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub session: SessionSettings,
}
