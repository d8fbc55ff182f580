//! Session-aware directory search.
//!
//! [`DirectoryClient`] routes every search through the [`SessionCache`]: the
//! session is looked up by `(address, cookie)`, the cookie returned by the
//! server becomes the session's next key, and a finished paging run closes its
//! session.
//!
//! First pages run on the shared cookie-less session. When the server answers
//! with a cookie, the connection is moved into a session keyed by that cookie
//! and the shared session redials on its next use.

use ldap3::SearchEntry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::{AttributeConfig, AttributeSet};

use crate::codes::status_from_result_code;
use crate::coerce::entry_to_object;
use crate::connection::{Dialer, DirectoryQuery};
use crate::session::{is_cookieless, session_key, Session, SessionCache};
use crate::target::DialTarget;

/// What happens to a cookie-bearing session once the server stops returning
/// a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Close the session as soon as paging completes.
    OnCompletion,
    /// Leave the session cached; the caller releases it with
    /// [`DirectoryClient::release`].
    Retain,
}

/// One successful page of search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub entries: Vec<SearchEntry>,
    /// Cookie for the next page; `None` once paging is done.
    pub next_cookie: Option<Vec<u8>>,
}

/// Issues searches over cached directory sessions.
#[derive(Clone)]
pub struct DirectoryClient {
    sessions: Arc<SessionCache>,
    dialer: Arc<dyn Dialer>,
}

impl std::fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl DirectoryClient {
    pub fn new(sessions: Arc<SessionCache>, dialer: Arc<dyn Dialer>) -> Self {
        Self { sessions, dialer }
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Run one search.
    ///
    /// A non-zero LDAP result code is returned as
    /// [`ConnectorError::DatasourceRejected`] carrying the mapped status. A
    /// search that outlives `timeout` fails with
    /// [`ConnectorError::ConnectionTimeout`] and its connection is closed.
    #[instrument(skip_all, fields(url = %target.url, filter = %query.filter, paged = !query.cookie.is_empty()))]
    pub async fn search(
        &self,
        target: &DialTarget,
        query: DirectoryQuery,
        timeout: Duration,
        release: ReleasePolicy,
    ) -> ConnectorResult<SearchPage> {
        let key = session_key(target.session_address(), &query.cookie);

        let session = match self.sessions.get(&key) {
            Some(session) => {
                debug!("Reusing cached directory session");
                session
            }
            None => {
                debug!("Opening new directory session");
                let session = Session::new(key.as_str());
                self.sessions.set(&key, session.clone()).await;
                session
            }
        };

        let mut connection = match session.get_or_create_connection(self.dialer.as_ref(), target).await {
            Ok(connection) => connection,
            Err(e) => {
                self.sessions.delete(&key).await;
                return Err(e);
            }
        };

        let result = tokio::time::timeout(timeout, connection.search(&query)).await;
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "Directory search failed, dropping connection");
                connection.discard().await;
                self.sessions.delete(&key).await;
                return Err(e);
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Directory search timed out");
                connection.discard().await;
                self.sessions.delete(&key).await;
                return Err(ConnectorError::ConnectionTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        if response.result_code != 0 {
            drop(connection);
            let status_code = status_from_result_code(response.result_code);
            warn!(
                result_code = response.result_code,
                status_code,
                message = %response.message,
                "Directory rejected search"
            );
            self.sessions.delete(&key).await;
            return Err(ConnectorError::DatasourceRejected {
                status_code,
                message: response.message,
            });
        }

        let next_cookie = if response.cookie.is_empty() {
            drop(connection);
            if release == ReleasePolicy::OnCompletion {
                self.sessions.delete(&key).await;
            }
            None
        } else {
            let next_key = session_key(target.session_address(), &response.cookie);
            if is_cookieless(&key) {
                match connection.take() {
                    Some(owned) => {
                        debug!("Moving paged run onto its own session");
                        self.sessions
                            .set(&next_key, Session::with_connection(next_key.as_str(), owned))
                            .await;
                    }
                    None => return Err(ConnectorError::internal("session connection was discarded")),
                }
            } else {
                drop(connection);
                self.sessions.update_key(&key, &next_key).await;
            }
            Some(response.cookie)
        };

        debug!(entries = response.entries.len(), more = next_cookie.is_some(), "Search page received");

        Ok(SearchPage {
            entries: response.entries,
            next_cookie,
        })
    }

    /// Close the session cached for `cookie`, if any.
    pub async fn release(&self, target: &DialTarget, cookie: &[u8]) {
        self.sessions
            .delete(&session_key(target.session_address(), cookie))
            .await;
    }
}

/// Convert search entries into objects carrying the requested attributes.
pub fn entries_to_objects(
    entries: &[SearchEntry],
    attributes: &[AttributeConfig],
) -> ConnectorResult<Vec<AttributeSet>> {
    entries
        .iter()
        .map(|entry| entry_to_object(entry, attributes))
        .collect()
}

/// Attribute names to request for `attributes`; `dn` is implicit.
pub fn requested_attributes(attributes: &[AttributeConfig]) -> Vec<String> {
    attributes
        .iter()
        .filter(|a| !a.external_id.eq_ignore_ascii_case("dn"))
        .map(|a| a.external_id.clone())
        .collect()
}

/// Escape a value for use inside a search filter (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::connection::{DirectoryConnection, DirectoryResponse};
    use async_trait::async_trait;
    use dirsync_connector::operation::AttributeType;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        dials: AtomicUsize,
        closes: AtomicUsize,
    }

    /// Replies with `pages` in order, one per search; `hang` never replies.
    struct ScriptedConnection {
        pages: Vec<(u32, Vec<u8>)>,
        next: usize,
        hang: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl DirectoryConnection for ScriptedConnection {
        async fn search(&mut self, _query: &DirectoryQuery) -> ConnectorResult<DirectoryResponse> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let (result_code, cookie) = self.pages[self.next.min(self.pages.len() - 1)].clone();
            self.next += 1;
            Ok(DirectoryResponse {
                result_code,
                message: String::new(),
                entries: vec![SearchEntry {
                    dn: "cn=a,dc=example,dc=com".to_string(),
                    attrs: HashMap::new(),
                    bin_attrs: HashMap::new(),
                }],
                cookie,
            })
        }

        async fn probe(&mut self) -> bool {
            true
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedDialer {
        pages: Vec<(u32, Vec<u8>)>,
        hang: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, _target: &DialTarget) -> ConnectorResult<Box<dyn DirectoryConnection>> {
            self.counters.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedConnection {
                pages: self.pages.clone(),
                next: 0,
                hang: self.hang,
                counters: self.counters.clone(),
            }))
        }
    }

    fn client(pages: Vec<(u32, Vec<u8>)>, hang: bool) -> (DirectoryClient, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let dialer = ScriptedDialer {
            pages,
            hang,
            counters: counters.clone(),
        };
        let sessions = SessionCache::new(&SessionSettings::default());
        (DirectoryClient::new(sessions, Arc::new(dialer)), counters)
    }

    fn target() -> DialTarget {
        let request: crate::config::LdapRequest = serde_json::from_value(serde_json::json!({
            "base_url": "ldap://dc1.example.com",
            "connection_params": {"base_dn": "dc=example,dc=com"},
            "page_size": 10,
            "entity_external_id": "Person",
            "entity_config_map": {"Person": {"query": "(objectClass=person)"}}
        }))
        .unwrap();
        DialTarget::from_request(&request, Duration::from_secs(5)).unwrap()
    }

    fn query(cookie: &[u8]) -> DirectoryQuery {
        DirectoryQuery {
            base_dn: "dc=example,dc=com".to_string(),
            filter: "(objectClass=person)".to_string(),
            attributes: vec!["cn".to_string()],
            page_size: Some(2),
            cookie: cookie.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_paging_reuses_one_connection() {
        let (client, counters) = client(vec![(0, b"c1".to_vec()), (0, b"c2".to_vec()), (0, vec![])], false);
        let target = target();
        let timeout = Duration::from_secs(5);

        let page = client.search(&target, query(b""), timeout, ReleasePolicy::OnCompletion).await.unwrap();
        assert_eq!(page.next_cookie.as_deref(), Some(&b"c1"[..]));

        let page = client.search(&target, query(b"c1"), timeout, ReleasePolicy::OnCompletion).await.unwrap();
        assert_eq!(page.next_cookie.as_deref(), Some(&b"c2"[..]));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);

        let page = client.search(&target, query(b"c2"), timeout, ReleasePolicy::OnCompletion).await.unwrap();
        assert!(page.next_cookie.is_none());

        assert_eq!(counters.dials.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        // Only the emptied cookie-less session is left.
        assert_eq!(client.sessions().len(), 1);
        assert!(client.sessions().contains_key(&session_key(target.session_address(), b"")));
    }

    #[tokio::test]
    async fn test_paged_run_leaves_shared_session() {
        let (client, counters) = client(vec![(0, b"c1".to_vec())], false);
        let target = target();
        let timeout = Duration::from_secs(5);

        client.search(&target, query(b""), timeout, ReleasePolicy::OnCompletion).await.unwrap();
        let shared = client.sessions().get(&session_key(target.session_address(), b"")).unwrap();
        assert!(shared.pending_key().is_none());
        assert!(client.sessions().contains_key(&session_key(target.session_address(), b"c1")));

        // The next first page dials its own connection.
        client.search(&target, query(b""), timeout, ReleasePolicy::OnCompletion).await.unwrap();
        assert_eq!(counters.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retain_keeps_completed_session() {
        let (client, counters) = client(vec![(0, b"c1".to_vec()), (0, vec![])], false);
        let target = target();
        let timeout = Duration::from_secs(5);

        client.search(&target, query(b""), timeout, ReleasePolicy::Retain).await.unwrap();
        client.search(&target, query(b"c1"), timeout, ReleasePolicy::Retain).await.unwrap();
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);

        client.release(&target, b"c1").await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_result_code_becomes_rejection() {
        let (client, _) = client(vec![(32, vec![])], false);
        let err = client
            .search(&target(), query(b""), Duration::from_secs(5), ReleasePolicy::OnCompletion)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::DatasourceRejected { status_code: 404, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_connection() {
        let (client, counters) = client(vec![], true);
        let target = target();

        let err = client
            .search(&target, query(b"c9"), Duration::from_secs(3), ReleasePolicy::OnCompletion)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::ConnectionTimeout { timeout_secs: 3 }));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(client.sessions().is_empty());
    }

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("a*b"), "a\\2ab");
        assert_eq!(escape_filter_value("(x)"), "\\28x\\29");
        assert_eq!(escape_filter_value("back\\slash"), "back\\5cslash");
        assert_eq!(escape_filter_value("CN=G1,DC=example"), "CN=G1,DC=example");
    }

    #[test]
    fn test_requested_attributes_skip_dn() {
        let attributes = vec![
            AttributeConfig::new("dn", AttributeType::String),
            AttributeConfig::new("cn", AttributeType::String),
        ];
        assert_eq!(requested_attributes(&attributes), vec!["cn".to_string()]);
    }
}
