//! Common test utilities for dirsync-connector-ldap integration tests.
//!
//! [`FakeDirectory`] is an in-memory directory behind the crate's [`Dialer`]
//! seam. It pages results with offset cookies and returns large membership
//! attributes in Active Directory style range chunks. A cookie is only
//! honored on the connection that issued it.

#![allow(dead_code)]

use async_trait::async_trait;
use ldap3::SearchEntry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Once};

use dirsync_connector::config::AuthConfig;
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::{AttributeConfig, AttributeType};
use dirsync_connector_ldap::{
    ConnectionParams, DialTarget, Dialer, DirectoryConnection, DirectoryQuery, DirectoryResponse,
    EntityConfig, LdapRequest,
};

static INIT: Once = Once::new();

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// Values per range chunk, as Active Directory's default MaxValRange.
pub const RANGE_CHUNK: usize = 1500;

pub const BASE_DN: &str = "DC=example,DC=com";
pub const BIND_DN: &str = "CN=reader,DC=example,DC=com";
pub const BIND_PASSWORD: &str = "secret";
pub const PERSON_QUERY: &str = "(&(objectClass=person))";
pub const GROUP_QUERY: &str = "(objectClass=group)";
pub const MEMBER_QUERY: &str = "(&(objectClass=group)(distinguishedName={{CollectionId}}))";

#[derive(Default)]
struct DirectoryState {
    /// Filter to entries, paged by offset cookies.
    entries: HashMap<String, Vec<SearchEntry>>,
    /// Group DN to member values.
    groups: HashMap<String, Vec<String>>,
    /// Filter to a non-zero result code.
    rejections: HashMap<String, u32>,
    /// Filters whose searches never complete.
    hanging: Vec<String>,
    /// Searches refused because their cookie came from another connection.
    foreign_cookies: usize,
    searches: Vec<DirectoryQuery>,
    dials: usize,
    closes: usize,
}

/// Shared in-memory directory.
#[derive(Clone, Default)]
pub struct FakeDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the result set of `filter`.
    pub fn add_entries(&self, filter: &str, entries: Vec<SearchEntry>) {
        self.state.lock().entries.insert(filter.to_string(), entries);
    }

    /// Register a group reachable by [`GROUP_QUERY`] and [`MEMBER_QUERY`].
    pub fn add_group(&self, dn: &str, members: Vec<String>) {
        let mut state = self.state.lock();
        state
            .entries
            .entry(GROUP_QUERY.to_string())
            .or_default()
            .push(entry(dn, &[("distinguishedName", vec![dn]), ("objectClass", vec!["group"])]));
        state.groups.insert(dn.to_string(), members);
    }

    pub fn reject(&self, filter: &str, result_code: u32) {
        self.state.lock().rejections.insert(filter.to_string(), result_code);
    }

    pub fn hang(&self, filter: &str) {
        self.state.lock().hanging.push(filter.to_string());
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn foreign_cookies(&self) -> usize {
        self.state.lock().foreign_cookies
    }

    pub fn searches(&self) -> Vec<DirectoryQuery> {
        self.state.lock().searches.clone()
    }

    /// Member reads that asked for a range chunk.
    pub fn range_requests(&self) -> usize {
        self.state
            .lock()
            .searches
            .iter()
            .filter(|q| q.attributes.iter().any(|a| a.contains(";range=")))
            .count()
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(self.clone())
    }

    fn group_for_filter(state: &DirectoryState, filter: &str) -> Option<String> {
        state
            .groups
            .keys()
            .find(|dn| MEMBER_QUERY.replace("{{CollectionId}}", dn) == filter)
            .cloned()
    }

    fn respond(&self, connection: usize, query: &DirectoryQuery) -> DirectoryResponse {
        let mut state = self.state.lock();
        state.searches.push(query.clone());

        if let Some(code) = state.rejections.get(&query.filter) {
            return response(*code, Vec::new(), Vec::new());
        }

        if let Some(dn) = Self::group_for_filter(&state, &query.filter) {
            let members = &state.groups[&dn];
            let requested = query.attributes.first().map(String::as_str).unwrap_or("member");
            return response(0, vec![member_entry(&dn, members, requested)], Vec::new());
        }

        let start = if query.cookie.is_empty() {
            0
        } else {
            match parse_cookie(&query.cookie) {
                Some((issuer, offset)) if issuer == connection => offset,
                _ => {
                    state.foreign_cookies += 1;
                    // unwillingToPerform, as Active Directory answers a stale cookie.
                    return response(53, Vec::new(), Vec::new());
                }
            }
        };

        let all = state.entries.get(&query.filter).cloned().unwrap_or_default();
        let end = match query.page_size {
            Some(size) => (start + size as usize).min(all.len()),
            None => all.len(),
        };
        let cookie = if end < all.len() {
            format!("{connection}:{end}").into_bytes()
        } else {
            Vec::new()
        };
        response(0, all[start.min(end)..end].to_vec(), cookie)
    }
}

/// Cookies read `{connection}:{offset}`.
fn parse_cookie(cookie: &[u8]) -> Option<(usize, usize)> {
    let (issuer, offset) = std::str::from_utf8(cookie).ok()?.split_once(':')?;
    Some((issuer.parse().ok()?, offset.parse().ok()?))
}

fn response(result_code: u32, entries: Vec<SearchEntry>, cookie: Vec<u8>) -> DirectoryResponse {
    DirectoryResponse {
        result_code,
        message: String::new(),
        entries,
        cookie,
    }
}

/// Group entry carrying the requested slice of its membership attribute.
fn member_entry(dn: &str, members: &[String], requested: &str) -> SearchEntry {
    let start = requested
        .split_once(";range=")
        .and_then(|(_, range)| range.split_once('-'))
        .and_then(|(start, _)| start.parse::<usize>().ok());

    let mut attrs = HashMap::new();
    if members.len() <= RANGE_CHUNK && start.is_none() {
        if !members.is_empty() {
            attrs.insert("member".to_string(), members.to_vec());
        }
    } else {
        let start = start.unwrap_or(0).min(members.len());
        let end = (start + RANGE_CHUNK).min(members.len());
        let key = if end == members.len() {
            format!("member;range={start}-*")
        } else {
            format!("member;range={start}-{}", end - 1)
        };
        attrs.insert(key, members[start..end].to_vec());
    }

    SearchEntry {
        dn: dn.to_string(),
        attrs,
        bin_attrs: HashMap::new(),
    }
}

#[async_trait]
impl Dialer for FakeDirectory {
    async fn dial(&self, target: &DialTarget) -> ConnectorResult<Box<dyn DirectoryConnection>> {
        if target.bind_password != BIND_PASSWORD {
            return Err(ConnectorError::AuthenticationFailed);
        }
        let id = {
            let mut state = self.state.lock();
            state.dials += 1;
            state.dials
        };
        Ok(Box::new(FakeConnection {
            id,
            directory: self.clone(),
        }))
    }
}

struct FakeConnection {
    id: usize,
    directory: FakeDirectory,
}

#[async_trait]
impl DirectoryConnection for FakeConnection {
    async fn search(&mut self, query: &DirectoryQuery) -> ConnectorResult<DirectoryResponse> {
        let hangs = self.directory.state.lock().hanging.contains(&query.filter);
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(self.directory.respond(self.id, query))
    }

    async fn probe(&mut self) -> bool {
        true
    }

    async fn close(&mut self) {
        self.directory.state.lock().closes += 1;
    }
}

/// Build an entry from `(attribute, values)` pairs.
pub fn entry(dn: &str, attrs: &[(&str, Vec<&str>)]) -> SearchEntry {
    SearchEntry {
        dn: dn.to_string(),
        attrs: attrs
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect(),
        bin_attrs: HashMap::new(),
    }
}

/// Person entries `CN=User{i}` for `i` in `0..count`.
pub fn people(count: usize) -> Vec<SearchEntry> {
    (0..count)
        .map(|i| {
            let dn = format!("CN=User{i},OU=People,{BASE_DN}");
            let cn = format!("User{i}");
            let mail = format!("user{i}@example.com");
            entry(&dn, &[("cn", vec![cn.as_str()]), ("mail", vec![mail.as_str()])])
        })
        .collect()
}

/// Member DNs `CN=M{i}` for `i` in `0..count`.
pub fn member_dns(prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("CN={prefix}{i},OU=People,{BASE_DN}"))
        .collect()
}

pub fn group_dn(name: &str) -> String {
    format!("CN={name},OU=Groups,{BASE_DN}")
}

/// Request for the plain `Person` entity.
pub fn person_request(page_size: i64) -> LdapRequest {
    let mut entities = HashMap::new();
    entities.insert("Person".to_string(), EntityConfig::new(PERSON_QUERY));
    LdapRequest {
        base_url: "ldap://dc1.example.com".to_string(),
        auth: AuthConfig::basic(BIND_DN, BIND_PASSWORD),
        connection_params: ConnectionParams {
            base_dn: BASE_DN.to_string(),
            certificate_chain: None,
        },
        page_size,
        entity_external_id: "Person".to_string(),
        cursor: None,
        entity_config_map: entities,
        attributes: vec![
            AttributeConfig::new("cn", AttributeType::String),
            AttributeConfig::new("mail", AttributeType::String),
        ],
        timeout_secs: 0,
    }
}

/// Request for the `GroupMember` entity over `Group` collection items.
pub fn member_request(page_size: i64, batch_size: i64) -> LdapRequest {
    let mut entities = HashMap::new();
    entities.insert("Group".to_string(), EntityConfig::new(GROUP_QUERY));
    entities.insert(
        "GroupMember".to_string(),
        EntityConfig::member_of(MEMBER_QUERY, "Group", "userDn", "distinguishedName")
            .with_batch_size(batch_size),
    );
    LdapRequest {
        entity_external_id: "GroupMember".to_string(),
        entity_config_map: entities,
        attributes: Vec::new(),
        ..person_request(page_size)
    }
}
