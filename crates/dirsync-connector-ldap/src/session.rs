//! Directory session cache.
//!
//! A paged sync issues many sequential searches against the same server.
//! The cache keeps one bound connection per `(address, paging cookie)` so the
//! next page finds a warm connection.
//!
//! Keys have the form `address|base64(cookie)`. A key with nothing after the
//! separator is cookie-less and denotes a reusable, non-paged session.
//!
//! When a search returns a new cookie, [`SessionCache::update_key`] registers
//! the next key as the session's *pending* alias. The first access through the
//! pending key promotes it to *current* and drops the old alias; an access
//! through the current key instead drops the pending alias. Both aliases live
//! on the session record and are only changed under the cache lock.
//!
//! A paged run never stays on the cookie-less session: once its first search
//! returns a cookie, the connection that issued the cookie moves to a session
//! of its own (see [`ConnectionGuard::take`]). Independent syncs against the
//! same address therefore never share paging aliases.
//!
//! Lock order is cache map, then session state. Connections are only closed
//! after the cache lock is released.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dirsync_connector::error::{ConnectorError, ConnectorResult};

use crate::config::SessionSettings;
use crate::connection::{Dialer, DirectoryConnection, DirectoryQuery, DirectoryResponse};
use crate::target::DialTarget;

const KEY_SEPARATOR: char = '|';

/// Build a session key from an address and a paging cookie.
pub fn session_key(address: &str, cookie: &[u8]) -> String {
    if cookie.is_empty() {
        format!("{address}{KEY_SEPARATOR}")
    } else {
        format!("{address}{KEY_SEPARATOR}{}", BASE64.encode(cookie))
    }
}

/// Whether a key denotes a non-paged session.
pub fn is_cookieless(key: &str) -> bool {
    key.ends_with(KEY_SEPARATOR)
}

struct SessionState {
    current_key: String,
    pending_key: Option<String>,
    last_used: Instant,
}

type ConnectionSlot = Option<Box<dyn DirectoryConnection>>;

/// One cached directory connection.
pub struct Session {
    state: Mutex<SessionState>,
    connection: tokio::sync::Mutex<ConnectionSlot>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("current_key", &state.current_key)
            .field("pending_key", &state.pending_key)
            .field("last_used", &state.last_used)
            .finish()
    }
}

impl Session {
    /// Empty session; the connection is opened on first use.
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                current_key: key.into(),
                pending_key: None,
                last_used: Instant::now(),
            }),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    /// Session that already owns a bound connection.
    pub fn with_connection(
        key: impl Into<String>,
        connection: Box<dyn DirectoryConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                current_key: key.into(),
                pending_key: None,
                last_used: Instant::now(),
            }),
            connection: tokio::sync::Mutex::new(Some(connection)),
        })
    }

    pub fn current_key(&self) -> String {
        self.state.lock().current_key.clone()
    }

    pub fn pending_key(&self) -> Option<String> {
        self.state.lock().pending_key.clone()
    }

    fn last_used(&self) -> Instant {
        self.state.lock().last_used
    }

    fn aliases(&self) -> (String, Option<String>) {
        let state = self.state.lock();
        (state.current_key.clone(), state.pending_key.clone())
    }

    /// Hand out the session's connection, dialing when there is none or the
    /// cached one fails its liveness probe.
    ///
    /// The returned guard gives exclusive use of the connection.
    pub async fn get_or_create_connection(
        &self,
        dialer: &dyn Dialer,
        target: &DialTarget,
    ) -> ConnectorResult<ConnectionGuard<'_>> {
        let mut slot = self.connection.lock().await;

        if let Some(connection) = slot.as_mut() {
            if connection.probe().await {
                return Ok(ConnectionGuard { slot });
            }
            warn!(url = %target.url, "Cached connection failed liveness probe, reconnecting");
            if let Some(mut stale) = slot.take() {
                stale.close().await;
            }
        }

        *slot = Some(dialer.dial(target).await?);
        Ok(ConnectionGuard { slot })
    }

    /// Close the connection, if any.
    pub async fn close(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            connection.close().await;
        }
    }
}

/// Exclusive access to a session's connection.
pub struct ConnectionGuard<'a> {
    slot: tokio::sync::MutexGuard<'a, ConnectionSlot>,
}

impl ConnectionGuard<'_> {
    pub async fn search(&mut self, query: &DirectoryQuery) -> ConnectorResult<DirectoryResponse> {
        match self.slot.as_mut() {
            Some(connection) => connection.search(query).await,
            None => Err(ConnectorError::internal("session connection was discarded")),
        }
    }

    /// Move the connection out of the session, leaving it empty.
    pub fn take(mut self) -> Option<Box<dyn DirectoryConnection>> {
        self.slot.take()
    }

    /// Close and forget the connection; the next user dials a new one.
    pub async fn discard(mut self) {
        if let Some(mut connection) = self.slot.take() {
            connection.close().await;
        }
    }
}

/// TTL-bounded cache of directory sessions.
pub struct SessionCache {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    ttl: Duration,
    cleanup_interval: Duration,
    shutdown: CancellationToken,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("keys", &self.sessions.lock().len())
            .field("ttl", &self.ttl)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

/// Remove every alias of `session` from the map.
fn remove_aliases(sessions: &mut HashMap<String, Arc<Session>>, session: &Arc<Session>) {
    let (current, pending) = session.aliases();
    for key in std::iter::once(current).chain(pending) {
        if sessions.get(&key).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&key);
        }
    }
}

impl SessionCache {
    pub fn new(settings: &SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: settings.ttl(),
            cleanup_interval: settings.cleanup_interval(),
            shutdown: CancellationToken::new(),
            eviction: Mutex::new(None),
        })
    }

    /// Look up a session, refreshing its last-used time and applying the
    /// pending/current alias rules.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get(key)?.clone();

        let mut state = session.state.lock();
        state.last_used = Instant::now();

        if !is_cookieless(key) {
            if state.pending_key.as_deref() == Some(key) {
                let old = std::mem::replace(&mut state.current_key, key.to_string());
                state.pending_key = None;
                sessions.remove(&old);
                debug!(key = %key, "Promoted pending session key");
            } else if state.current_key == key {
                if let Some(pending) = state.pending_key.take() {
                    sessions.remove(&pending);
                    debug!(key = %key, "Dropped pending session key");
                }
            }
        }
        drop(state);

        Some(session)
    }

    /// Insert a session, closing any session previously stored at `key`.
    pub async fn set(&self, key: &str, session: Arc<Session>) {
        let prior = {
            let mut sessions = self.sessions.lock();
            {
                let mut state = session.state.lock();
                state.current_key = key.to_string();
                state.last_used = Instant::now();
            }
            let prior = sessions
                .insert(key.to_string(), session.clone())
                .filter(|prior| !Arc::ptr_eq(prior, &session));
            if let Some(prior) = &prior {
                remove_aliases(&mut sessions, prior);
            }
            prior
        };

        if let Some(prior) = prior {
            debug!(key = %key, "Replacing cached session");
            prior.close().await;
        }
    }

    /// Close a session and remove both of its aliases. Cookie-less keys are
    /// kept for reuse.
    pub async fn delete(&self, key: &str) {
        if is_cookieless(key) {
            return;
        }

        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(key);
            if let Some(session) = &removed {
                remove_aliases(&mut sessions, session);
            }
            removed
        };

        if let Some(session) = removed {
            debug!(key = %key, "Closing completed session");
            session.close().await;
        }
    }

    /// Register `new_key` as the pending alias of the session at `old_key`.
    ///
    /// A previous pending alias of that session is replaced. Returns `false`
    /// when no session is stored at `old_key`.
    pub async fn update_key(&self, old_key: &str, new_key: &str) -> bool {
        if old_key == new_key {
            return self.contains_key(old_key);
        }

        let displaced = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get(old_key).cloned() else {
                return false;
            };

            let previous = session.state.lock().pending_key.replace(new_key.to_string());
            if let Some(previous) = previous.filter(|p| p != new_key) {
                if sessions.get(&previous).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    sessions.remove(&previous);
                }
            }

            let displaced = sessions
                .insert(new_key.to_string(), session.clone())
                .filter(|other| !Arc::ptr_eq(other, &session));
            if let Some(other) = &displaced {
                remove_aliases(&mut sessions, other);
            }
            displaced
        };

        if let Some(other) = displaced {
            other.close().await;
        }
        true
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    /// Number of keys, counting both aliases of a session.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close and remove every session idle for longer than the TTL.
    ///
    /// Returns the number of sessions closed.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_used()) > self.ttl)
                .map(|(k, _)| k.clone())
                .collect();

            let mut expired: Vec<Arc<Session>> = Vec::new();
            for key in keys {
                if let Some(session) = sessions.remove(&key) {
                    if !expired.iter().any(|s| Arc::ptr_eq(s, &session)) {
                        expired.push(session);
                    }
                }
            }
            expired
        };

        let count = expired.len();
        for session in expired {
            session.close().await;
        }
        count
    }

    /// Start the background eviction task. Calling it again is a no-op.
    pub fn spawn_eviction(self: &Arc<Self>) {
        let mut eviction = self.eviction.lock();
        if eviction.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.cleanup_interval;

        *eviction = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let evicted = cache.evict_expired().await;
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle directory sessions");
                        }
                    }
                }
            }
        }));
    }

    /// Stop eviction and close every cached session. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let task = self.eviction.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock();
            let mut unique: Vec<Arc<Session>> = Vec::new();
            for (_, session) in map.drain() {
                if !unique.iter().any(|s| Arc::ptr_eq(s, &session)) {
                    unique.push(session);
                }
            }
            unique
        };

        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        info!(closed = count, "Session cache shut down");
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
