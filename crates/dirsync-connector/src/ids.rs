//! Routing identifiers
//!
//! UUID newtypes carried in tunnel routing metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! routing_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

routing_id!(
    /// Connector registration a tunneled request is addressed to.
    ConnectorId
);

routing_id!(
    /// Tenant that owns the connector.
    TenantId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_uuid() {
        let uuid = Uuid::parse_str("6f1c2f6a-8d0e-4a4e-9d55-0c5b7d3c1a11").unwrap();
        let json = serde_json::to_string(&ConnectorId::from_uuid(uuid)).unwrap();
        assert_eq!(json, "\"6f1c2f6a-8d0e-4a4e-9d55-0c5b7d3c1a11\"");

        let tenant: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(tenant.to_string(), uuid.to_string());
    }
}
