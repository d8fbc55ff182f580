//! Connector Framework traits
//!
//! Capability traits that decide how a page request reaches its datasource.

use async_trait::async_trait;

use crate::context::{ConnectorRoute, RequestContext};
use crate::error::ConnectorResult;
use crate::operation::PageResponse;

/// Selects between serving a request directly and forwarding it through a
/// remote tunnel.
///
/// The choice is made once per call from the request context. Both paths
/// must produce the same [`PageResponse`] shape.
#[async_trait]
pub trait Dispatcher<Req: Send + Sync>: Send + Sync {
    /// Whether this call must be forwarded through the tunnel.
    fn is_proxied(&self, ctx: &RequestContext) -> bool;

    /// Forward the request through the tunnel.
    async fn proxy_request(&self, ctx: &RequestContext, request: &Req)
        -> ConnectorResult<PageResponse>;

    /// Serve the request directly against the datasource.
    async fn request(&self, ctx: &RequestContext, request: &Req) -> ConnectorResult<PageResponse>;

    /// Route the request to the selected path.
    async fn dispatch(&self, ctx: &RequestContext, request: &Req) -> ConnectorResult<PageResponse> {
        if self.is_proxied(ctx) {
            self.proxy_request(ctx, request).await
        } else {
            self.request(ctx, request).await
        }
    }
}

/// Client side of the remote tunnel.
///
/// The payload and reply are opaque bytes; the tunnel endpoint owns its own
/// datasource connections.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Send one request to the endpoint identified by `route`.
    async fn proxy(&self, route: &ConnectorRoute, payload: Vec<u8>)
        -> Result<Vec<u8>, tonic::Status>;
}
