//! LDAP read connector.
//!
//! Serves page requests either directly against the directory or through the
//! remote tunnel, see [`Dispatcher`].

use async_trait::async_trait;
use std::sync::Arc;
use tonic::Code;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::config::ConnectorConfig;
use dirsync_connector::context::RequestContext;
use dirsync_connector::cursor::{self, CompositeCursor};
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::PageResponse;
use dirsync_connector::status::status_from_rpc_code;
use dirsync_connector::traits::{Dispatcher, ProxyClient};

use crate::config::{LdapConnectorSettings, LdapRequest};
use crate::connection::{Dialer, DirectoryQuery, Ldap3Dialer};
use crate::page_info::PageInfo;
use crate::search::{entries_to_objects, requested_attributes, DirectoryClient, ReleasePolicy};
use crate::session::SessionCache;
use crate::target::DialTarget;
use crate::traversal::MemberTraversal;

/// Paginated reader for LDAP and Active Directory.
pub struct LdapConnector {
    client: DirectoryClient,
    settings: LdapConnectorSettings,
    proxy: Option<Arc<dyn ProxyClient>>,
}

impl std::fmt::Debug for LdapConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnector")
            .field("client", &self.client)
            .field("settings", &self.settings)
            .field("proxied", &self.proxy.is_some())
            .finish()
    }
}

impl LdapConnector {
    /// Create a connector that dials real LDAP servers.
    pub fn new(settings: LdapConnectorSettings) -> Self {
        Self::with_dialer(settings, Arc::new(Ldap3Dialer))
    }

    /// Create a connector with a custom [`Dialer`].
    pub fn with_dialer(settings: LdapConnectorSettings, dialer: Arc<dyn Dialer>) -> Self {
        let sessions = SessionCache::new(&settings.session);
        Self {
            client: DirectoryClient::new(sessions, dialer),
            settings,
            proxy: None,
        }
    }

    /// Forward requests that carry a tunnel route through `proxy`.
    pub fn with_proxy(mut self, proxy: Arc<dyn ProxyClient>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        self.client.sessions()
    }

    /// Fetch one page of the requested entity.
    #[instrument(skip(self, ctx, request), fields(entity = %request.entity_external_id, page_size = request.page_size))]
    pub async fn get_page(
        &self,
        ctx: &RequestContext,
        request: &LdapRequest,
    ) -> ConnectorResult<PageResponse> {
        info!(resuming = request.cursor.is_some(), "Fetching directory page");

        let response = self.dispatch(ctx, request).await?;

        info!(
            status_code = response.status_code,
            objects = response.count(),
            more = response.next_cursor.is_some(),
            "Directory page complete"
        );
        Ok(response)
    }

    /// Stop background eviction and close all cached sessions.
    pub async fn shutdown(&self) {
        self.client.sessions().shutdown().await;
    }

    async fn read_plain(
        &self,
        request: &LdapRequest,
        target: &DialTarget,
        cursor: Option<CompositeCursor<String>>,
    ) -> ConnectorResult<PageResponse> {
        let entity = request.entity()?;
        let page_info = page_info_of(cursor)?.unwrap_or_default();

        let query = DirectoryQuery {
            base_dn: request.connection_params.base_dn.clone(),
            filter: entity.query.clone(),
            attributes: requested_attributes(&request.attributes),
            page_size: Some(i32::try_from(request.page_size).unwrap_or(i32::MAX)),
            cookie: page_info.cookie().to_vec(),
        };

        let timeout = self.settings.connection.request_timeout(request.timeout_secs);
        let page = self
            .client
            .search(target, query, timeout, ReleasePolicy::OnCompletion)
            .await?;

        let objects = entries_to_objects(&page.entries, &request.attributes)?;
        let next = page
            .next_cookie
            .map(|cookie| PageInfo::for_cookie(cookie).encode().map(CompositeCursor::new))
            .transpose()?;

        Ok(PageResponse::ok(objects, cursor::encode(next.as_ref())?))
    }

    async fn read_members(
        &self,
        request: &LdapRequest,
        target: &DialTarget,
        cursor: Option<CompositeCursor<String>>,
    ) -> ConnectorResult<PageResponse> {
        let entity = request.entity()?;
        let Some((_, parent)) = request.parent_entity()? else {
            return Err(ConnectorError::internal("member read on an entity without a collection"));
        };

        let resume = page_info_of(cursor)?;
        let timeout = self.settings.connection.request_timeout(request.timeout_secs);

        let page = MemberTraversal::new(&self.client, target, request, entity, parent, timeout)?
            .run(resume)
            .await?;

        Ok(PageResponse::ok(page.objects, cursor::encode(page.next.as_ref())?))
    }
}

/// Decode the request cursor and check it against the requested entity.
fn resume_cursor(request: &LdapRequest) -> ConnectorResult<Option<CompositeCursor<String>>> {
    let entity = request.entity()?;
    let cursor = cursor::decode::<String>(request.cursor.as_deref())?;
    cursor::validate_cursor(
        cursor.as_ref(),
        &request.entity_external_id,
        entity.is_member_entity(),
    )?;
    Ok(cursor)
}

/// Resume state carried by a cursor, if any.
fn page_info_of(cursor: Option<CompositeCursor<String>>) -> ConnectorResult<Option<PageInfo>> {
    match cursor {
        None => Ok(None),
        Some(CompositeCursor { cursor: Some(token), .. }) => PageInfo::decode(&token).map(Some),
        Some(_) => Err(ConnectorError::invalid_cursor("cursor carries no page state")),
    }
}

#[async_trait]
impl Dispatcher<LdapRequest> for LdapConnector {
    fn is_proxied(&self, ctx: &RequestContext) -> bool {
        self.proxy.is_some() && ctx.connector().is_some()
    }

    #[instrument(skip_all, fields(entity = %request.entity_external_id))]
    async fn proxy_request(
        &self,
        ctx: &RequestContext,
        request: &LdapRequest,
    ) -> ConnectorResult<PageResponse> {
        let (Some(proxy), Some(route)) = (&self.proxy, ctx.connector()) else {
            return Err(ConnectorError::internal("proxy requested without a tunnel route"));
        };

        debug!(connector_id = %route.connector_id, client_id = %route.client_id, "Forwarding request through tunnel");

        let payload = serde_json::to_vec(request)?;
        match proxy.proxy(route, payload).await {
            Ok(reply) => Ok(serde_json::from_slice(&reply)?),
            Err(status) if status.code() == Code::Unavailable => {
                warn!(connector_id = %route.connector_id, message = %status.message(), "Tunnel endpoint unavailable");
                Err(ConnectorError::TargetUnavailable {
                    message: status.message().to_string(),
                })
            }
            Err(status) => {
                let status_code = status_from_rpc_code(status.code());
                warn!(
                    connector_id = %route.connector_id,
                    code = ?status.code(),
                    status_code,
                    message = %status.message(),
                    "Tunnel call failed"
                );
                Ok(PageResponse::rejected(status_code))
            }
        }
    }

    /// The cursor is checked before either path is taken.
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: &LdapRequest,
    ) -> ConnectorResult<PageResponse> {
        resume_cursor(request)?;
        if self.is_proxied(ctx) {
            self.proxy_request(ctx, request).await
        } else {
            self.request(ctx, request).await
        }
    }

    async fn request(
        &self,
        _ctx: &RequestContext,
        request: &LdapRequest,
    ) -> ConnectorResult<PageResponse> {
        request.validate()?;
        let entity = request.entity()?;
        let cursor = resume_cursor(request)?;

        let target = DialTarget::from_request(request, self.settings.connection.connection_timeout())?;
        self.client.sessions().spawn_eviction();

        let result = if entity.is_member_entity() {
            self.read_members(request, &target, cursor).await
        } else {
            self.read_plain(request, &target, cursor).await
        };

        match result {
            Err(ConnectorError::DatasourceRejected { status_code, message }) => {
                debug!(status_code, message = %message, "Returning directory rejection");
                Ok(PageResponse::rejected(status_code))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_connector::context::ConnectorRoute;
    use dirsync_connector::ids::{ConnectorId, TenantId};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use uuid::Uuid;

    use crate::config::{ConnectionParams, EntityConfig};

    struct Tunnel {
        reply: Result<Vec<u8>, (Code, &'static str)>,
        seen: Mutex<Vec<LdapRequest>>,
    }

    #[async_trait]
    impl ProxyClient for Tunnel {
        async fn proxy(
            &self,
            _route: &ConnectorRoute,
            payload: Vec<u8>,
        ) -> Result<Vec<u8>, tonic::Status> {
            self.seen.lock().push(serde_json::from_slice(&payload).unwrap());
            self.reply
                .clone()
                .map_err(|(code, message)| tonic::Status::new(code, message))
        }
    }

    fn request() -> LdapRequest {
        let mut entities = HashMap::new();
        entities.insert("Person".to_string(), EntityConfig::new("(objectClass=person)"));
        LdapRequest {
            base_url: "ldap://dc1.example.com".to_string(),
            auth: Default::default(),
            connection_params: ConnectionParams {
                base_dn: "dc=example,dc=com".to_string(),
                certificate_chain: None,
            },
            page_size: 10,
            entity_external_id: "Person".to_string(),
            cursor: None,
            entity_config_map: entities,
            attributes: vec![],
            timeout_secs: 0,
        }
    }

    fn routed() -> RequestContext {
        RequestContext::new().with_connector(ConnectorRoute {
            connector_id: ConnectorId::new(),
            client_id: "edge-1".to_string(),
            tenant_id: TenantId::from_uuid(Uuid::new_v4()),
        })
    }

    fn connector(reply: Result<Vec<u8>, (Code, &'static str)>) -> (LdapConnector, Arc<Tunnel>) {
        let tunnel = Arc::new(Tunnel {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let connector = LdapConnector::new(LdapConnectorSettings::default()).with_proxy(tunnel.clone());
        (connector, tunnel)
    }

    #[tokio::test]
    async fn test_proxied_reply_is_returned() {
        let reply = PageResponse::ok(vec![], Some("next".to_string()));
        let (connector, tunnel) = connector(Ok(serde_json::to_vec(&reply).unwrap()));

        let response = connector.get_page(&routed(), &request()).await.unwrap();
        assert_eq!(response, reply);
        assert_eq!(tunnel.seen.lock()[0].entity_external_id, "Person");
    }

    #[tokio::test]
    async fn test_proxy_failure_maps_status() {
        let (connector, _) = connector(Err((Code::PermissionDenied, "nope")));
        let response = connector.get_page(&routed(), &request()).await.unwrap();
        assert_eq!(response.status_code, 403);
        assert!(response.objects.is_empty());
    }

    #[tokio::test]
    async fn test_proxy_unavailable_is_an_error() {
        let (connector, _) = connector(Err((Code::Unavailable, "no tunnel")));
        let err = connector.get_page(&routed(), &request()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::TargetUnavailable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unrouted_context_is_served_directly() {
        let (connector, tunnel) = connector(Err((Code::Internal, "unused")));
        assert!(!connector.is_proxied(&RequestContext::new()));
        assert!(connector.is_proxied(&routed()));
        assert!(tunnel.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cursor_is_rejected_before_dialing() {
        let (connector, _) = connector(Err((Code::Internal, "unused")));
        let mut request = request();
        request.cursor = Some("not base64!".to_string());

        let err = connector.get_page(&RequestContext::new(), &request).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidCursor { .. }));
    }

    #[tokio::test]
    async fn test_invalid_cursor_is_not_forwarded() {
        let reply = PageResponse::ok(vec![], None);
        let (connector, tunnel) = connector(Ok(serde_json::to_vec(&reply).unwrap()));
        let mut request = request();
        request.cursor = Some("not base64!".to_string());

        let err = connector.get_page(&routed(), &request).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidCursor { .. }));
        assert!(tunnel.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_member_cursor_on_plain_entity_is_not_forwarded() {
        let reply = PageResponse::ok(vec![], None);
        let (connector, tunnel) = connector(Ok(serde_json::to_vec(&reply).unwrap()));
        let mut request = request();
        let member_cursor = CompositeCursor {
            cursor: Some("page".to_string()),
            collection_id: Some("g1".to_string()),
            collection_cursor: None,
        };
        request.cursor = cursor::encode(Some(&member_cursor)).unwrap();

        let err = connector.get_page(&routed(), &request).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidCursor { .. }));
        assert!(tunnel.seen.lock().is_empty());
    }

    #[test]
    fn test_page_info_requires_payload() {
        let empty: CompositeCursor<String> = CompositeCursor {
            cursor: None,
            collection_id: Some("g1".to_string()),
            collection_cursor: None,
        };
        assert!(page_info_of(Some(empty)).is_err());
        assert!(page_info_of(None).unwrap().is_none());
    }
}
