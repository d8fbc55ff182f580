//! Per-call request context.
//!
//! The context carries routing metadata attached by the caller. When a
//! connector is registered behind a remote tunnel, the route identifies which
//! tunnel endpoint must serve the request.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectorId, TenantId};

/// Routing metadata for a connector reachable through a remote tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRoute {
    pub connector_id: ConnectorId,
    pub client_id: String,
    pub tenant_id: TenantId,
}

/// Context passed alongside every inbound call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    connector: Option<ConnectorRoute>,
}

impl RequestContext {
    /// Context for a call that carries no routing metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach tunnel routing metadata.
    pub fn with_connector(mut self, route: ConnectorRoute) -> Self {
        self.connector = Some(route);
        self
    }

    /// Routing metadata, if the caller supplied any.
    pub fn connector(&self) -> Option<&ConnectorRoute> {
        self.connector.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_context_without_route() {
        assert!(RequestContext::new().connector().is_none());
    }

    #[test]
    fn test_context_with_route() {
        let route = ConnectorRoute {
            connector_id: ConnectorId::new(),
            client_id: "edge-01".to_string(),
            tenant_id: TenantId::from_uuid(Uuid::new_v4()),
        };
        let ctx = RequestContext::new().with_connector(route.clone());
        assert_eq!(ctx.connector(), Some(&route));
    }
}
