//! Directory connection seam.
//!
//! [`DirectoryConnection`] is one live, bound connection; [`Dialer`] opens
//! them. The session cache and search client only see these traits, which
//! keeps `ldap3` behind a single implementation.

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, SearchResult};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::error::{ConnectorError, ConnectorResult};

use crate::target::DialTarget;

/// LDAP result code for invalid credentials.
pub const LDAP_INVALID_CREDENTIALS: u32 = 49;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One whole-subtree search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryQuery {
    pub base_dn: String,
    pub filter: String,
    pub attributes: Vec<String>,
    /// Page size of the RFC 2696 paging control; `None` sends no control.
    pub page_size: Option<i32>,
    /// Paging cookie from the previous page; empty on the first page.
    pub cookie: Vec<u8>,
}

/// Raw outcome of a search.
#[derive(Debug, Clone)]
pub struct DirectoryResponse {
    /// LDAP result code; `0` is success.
    pub result_code: u32,
    pub message: String,
    pub entries: Vec<SearchEntry>,
    /// Cookie returned in the paging control; empty when paging is done.
    pub cookie: Vec<u8>,
}

/// A live, bound directory connection.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Issue one search. Directory-level failures are reported through
    /// `result_code`; `Err` means the connection itself failed.
    async fn search(&mut self, query: &DirectoryQuery) -> ConnectorResult<DirectoryResponse>;

    /// Lightweight liveness check.
    async fn probe(&mut self) -> bool;

    /// Unbind and drop the connection.
    async fn close(&mut self);
}

/// Opens and authenticates directory connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &DialTarget) -> ConnectorResult<Box<dyn DirectoryConnection>>;
}

/// [`DirectoryConnection`] backed by an `ldap3` handle.
pub struct Ldap3Connection {
    ldap: Ldap,
}

fn transport_error(context: &str, err: LdapError) -> ConnectorError {
    match err {
        LdapError::Timeout { .. } => ConnectorError::connection_failed(format!("{context}: timed out")),
        other => ConnectorError::connection_failed_with_source(context.to_string(), other),
    }
}

#[async_trait]
impl DirectoryConnection for Ldap3Connection {
    async fn search(&mut self, query: &DirectoryQuery) -> ConnectorResult<DirectoryResponse> {
        if let Some(size) = query.page_size {
            self.ldap.with_controls(vec![PagedResults {
                size,
                cookie: query.cookie.clone(),
            }
            .into()]);
        }

        let SearchResult(results, result) = self
            .ldap
            .search(
                &query.base_dn,
                Scope::Subtree,
                &query.filter,
                query.attributes.clone(),
            )
            .await
            .map_err(|e| transport_error("LDAP search failed", e))?;

        let cookie = result
            .ctrls
            .iter()
            .find_map(|Control(kind, raw)| match kind {
                Some(ControlType::PagedResults) => Some(raw.parse::<PagedResults>().cookie),
                _ => None,
            })
            .unwrap_or_default();

        let entries = results
            .into_iter()
            .filter(|entry| !entry.is_ref())
            .map(SearchEntry::construct)
            .collect();

        Ok(DirectoryResponse {
            result_code: result.rc,
            message: result.text,
            entries,
            cookie,
        })
    }

    async fn probe(&mut self) -> bool {
        match self
            .ldap
            .with_timeout(PROBE_TIMEOUT)
            .search("", Scope::Base, "(objectClass=*)", vec!["1.1"])
            .await
        {
            Ok(SearchResult(_, result)) => result.rc == 0,
            Err(e) => {
                debug!(error = %e, "Liveness probe failed");
                false
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            warn!(error = %e, "LDAP unbind failed");
        }
    }
}

/// [`Dialer`] that opens real LDAP connections.
#[derive(Debug, Clone, Default)]
pub struct Ldap3Dialer;

#[async_trait]
impl Dialer for Ldap3Dialer {
    #[instrument(skip(self, target), fields(url = %target.url, bind_dn = %target.bind_dn))]
    async fn dial(&self, target: &DialTarget) -> ConnectorResult<Box<dyn DirectoryConnection>> {
        debug!(custom_roots = target.tls_config.is_some(), "Connecting to LDAP server");

        let mut settings = LdapConnSettings::new().set_conn_timeout(target.connect_timeout);
        if let Some(config) = &target.tls_config {
            settings = settings.set_config(config.clone());
        }

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &target.url)
            .await
            .map_err(|e| {
                ConnectorError::connection_failed_with_source(
                    format!("Failed to connect to LDAP server at {}", target.url),
                    e,
                )
            })?;

        // Spawn the connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        if !target.bind_dn.is_empty() {
            let result = ldap
                .with_timeout(target.connect_timeout)
                .simple_bind(&target.bind_dn, &target.bind_password)
                .await
                .map_err(|e| transport_error("LDAP bind failed", e))?;

            if result.rc == LDAP_INVALID_CREDENTIALS {
                return Err(ConnectorError::AuthenticationFailed);
            }
            if result.rc != 0 {
                return Err(ConnectorError::connection_failed(format!(
                    "LDAP bind failed with code {}: {}",
                    result.rc, result.text
                )));
            }
        }

        info!("LDAP connection established");

        Ok(Box::new(Ldap3Connection { ldap }))
    }
}
