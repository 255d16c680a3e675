//! Database session store.
//!
//! Maps opaque [`SessionToken`]s to live, authenticated database connections.
//! Every record has an absolute expiry fixed at creation. Expiry is enforced
//! lazily on every lookup and eagerly by the background reaper calling
//! [`SessionStore::cleanup_expired`].
//!
//! The table sits behind a single mutex. The lock is held for map access only:
//! connections are closed, and health probes run, after the guard is dropped.
//! Every close is bounded by the store's close timeout, so a hung driver
//! never stalls a logout or shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atlas_console_core::SessionToken;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::lifecycle;

/// A live connection to a database cluster.
///
/// The store owns every connection handed to it and is the only caller of
/// [`close`](DatabaseConnection::close).
#[async_trait]
pub trait DatabaseConnection: Send + Sync + 'static {
    /// Health probe: a cheap round trip proving the connection is usable and
    /// still authenticated.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or rejects the session.
    async fn ping(&self) -> Result<()>;

    /// Release the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails to shut the connection down cleanly.
    async fn close(&self) -> Result<()>;
}

/// A connection whose driver is chosen at runtime.
pub type BoxedConnection = Box<dyn DatabaseConnection>;

#[async_trait]
impl DatabaseConnection for BoxedConnection {
    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Usable until `expires_at`.
    Active,
    /// Past its lifetime or invalidated; waiting for the reaper.
    Expired,
    /// Connection released and record dropped.
    Closed,
}

/// A session record as held by the store.
struct SessionRecord<C> {
    connection: Arc<C>,
    cluster_name: String,
    principal: String,
    sanitized_endpoint: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: SessionState,
}

impl<C> SessionRecord<C> {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state != SessionState::Active || now >= self.expires_at
    }

    fn info(&self, now: DateTime<Utc>) -> SessionInfo {
        SessionInfo {
            cluster_name: self.cluster_name.clone(),
            principal: self.principal.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            seconds_remaining: (self.expires_at - now).num_seconds().max(0),
        }
    }
}

/// A session handed out by [`SessionStore::get`].
///
/// Holds a shared reference to the connection; the store keeps ownership of
/// its lifetime.
pub struct ActiveSession<C> {
    /// The session token.
    pub token: SessionToken,
    /// The live connection.
    pub connection: Arc<C>,
    /// Cluster the connection points at.
    pub cluster_name: String,
    /// Database user the session authenticated as.
    pub principal: String,
    /// Connection target with credentials removed.
    pub sanitized_endpoint: String,
    /// When the session stops being returned.
    pub expires_at: DateTime<Utc>,
}

impl<C> Clone for ActiveSession<C> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            connection: Arc::clone(&self.connection),
            cluster_name: self.cluster_name.clone(),
            principal: self.principal.clone(),
            sanitized_endpoint: self.sanitized_endpoint.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Non-sensitive view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Cluster the connection points at.
    pub cluster_name: String,
    /// Database user the session authenticated as.
    pub principal: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
    /// Whole seconds until expiry, never negative.
    pub seconds_remaining: i64,
}

/// Default bound on a single connection close.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Thread-safe table of live database sessions.
pub struct SessionStore<C: DatabaseConnection> {
    sessions: Mutex<HashMap<SessionToken, SessionRecord<C>>>,
    ttl: Duration,
    close_timeout: Duration,
}

impl<C: DatabaseConnection> SessionStore<C> {
    /// Create an empty store whose sessions live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Set how long a single connection close may take before it is given up.
    #[must_use]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// The lifetime given to sessions created with [`create`](Self::create).
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The bound on a single connection close.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Register an established connection and return its token.
    pub fn create(
        &self,
        connection: C,
        cluster_name: impl Into<String>,
        principal: impl Into<String>,
        sanitized_endpoint: impl Into<String>,
    ) -> SessionToken {
        self.create_with_ttl(connection, cluster_name, principal, sanitized_endpoint, self.ttl)
    }

    /// Register an established connection with an explicit lifetime.
    pub fn create_with_ttl(
        &self,
        connection: C,
        cluster_name: impl Into<String>,
        principal: impl Into<String>,
        sanitized_endpoint: impl Into<String>,
        ttl: Duration,
    ) -> SessionToken {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let record = SessionRecord {
            connection: Arc::new(connection),
            cluster_name: cluster_name.into(),
            principal: principal.into(),
            sanitized_endpoint: sanitized_endpoint.into(),
            created_at,
            expires_at,
            state: SessionState::Active,
        };

        let mut sessions = self.sessions.lock();
        let mut token = SessionToken::generate();
        while sessions.contains_key(&token) {
            token = SessionToken::generate();
        }

        tracing::info!(
            token = %token,
            cluster = %record.cluster_name,
            principal = %record.principal,
            expires_at = %expires_at,
            "Created database session"
        );
        sessions.insert(token, record);
        token
    }

    /// Look up an active, unexpired session.
    #[must_use]
    pub fn get(&self, token: &SessionToken) -> Option<ActiveSession<C>> {
        let now = Utc::now();
        let sessions = self.sessions.lock();
        let record = sessions.get(token)?;
        if record.is_expired_at(now) {
            return None;
        }

        Some(ActiveSession {
            token: *token,
            connection: Arc::clone(&record.connection),
            cluster_name: record.cluster_name.clone(),
            principal: record.principal.clone(),
            sanitized_endpoint: record.sanitized_endpoint.clone(),
            expires_at: record.expires_at,
        })
    }

    /// Look up a session and probe its connection.
    ///
    /// A failed probe invalidates the session so no caller sees it again; the
    /// next sweep closes the connection.
    pub async fn validate(&self, token: &SessionToken) -> Option<ActiveSession<C>> {
        let session = self.get(token)?;

        match session.connection.ping().await {
            Ok(()) => Some(session),
            Err(e) => {
                tracing::warn!(token = %token, error = %e, "Session failed health probe");
                self.invalidate(token);
                None
            }
        }
    }

    /// Force a session into the expired state ahead of its TTL.
    ///
    /// Returns whether an active session was invalidated.
    pub fn invalidate(&self, token: &SessionToken) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(record) = sessions.get_mut(token) else {
            return false;
        };
        if !lifecycle::is_valid_session_transition(record.state, SessionState::Expired) {
            return false;
        }

        record.state = SessionState::Expired;
        tracing::debug!(token = %token, "Invalidated database session");
        true
    }

    /// Describe a session without exposing its connection or endpoint.
    #[must_use]
    pub fn info(&self, token: &SessionToken) -> Option<SessionInfo> {
        let now = Utc::now();
        let sessions = self.sessions.lock();
        sessions
            .get(token)
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.info(now))
    }

    /// Remove a session and close its connection.
    ///
    /// Returns whether a record existed. Close failures are logged only.
    pub async fn remove(&self, token: &SessionToken) -> bool {
        let removed = self.sessions.lock().remove(token);
        let Some(record) = removed else {
            return false;
        };

        tracing::info!(token = %token, cluster = %record.cluster_name, "Removed database session");
        close_connection(*token, record, self.close_timeout).await;
        true
    }

    /// Summaries of every active, unexpired session, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = Utc::now();
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .lock()
            .values()
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.info(now))
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Remove every expired or invalidated session, closing its connection.
    ///
    /// Returns the number of sessions removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(SessionToken, SessionRecord<C>)> = {
            let mut sessions = self.sessions.lock();
            let tokens: Vec<SessionToken> = sessions
                .iter()
                .filter(|(_, record)| record.is_expired_at(now))
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| sessions.remove(&token).map(|record| (token, record)))
                .collect()
        };

        let count = expired.len();
        self.close_connections(expired).await;

        if count > 0 {
            tracing::info!(count, "Cleaned up expired database sessions");
        }
        count
    }

    /// Close every connection and empty the store.
    ///
    /// Returns the number of sessions closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(SessionToken, SessionRecord<C>)> =
            self.sessions.lock().drain().collect();

        let count = drained.len();
        self.close_connections(drained).await;

        tracing::info!(count, "Closed all database sessions");
        count
    }

    /// Close connections concurrently, each bounded by the close timeout.
    async fn close_connections(&self, records: Vec<(SessionToken, SessionRecord<C>)>) {
        let mut closing = JoinSet::new();
        for (token, record) in records {
            closing.spawn(close_connection(token, record, self.close_timeout));
        }
        while let Some(joined) = closing.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Connection close task failed");
            }
        }
    }

    /// Number of records held, including expired ones not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Check if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

async fn close_connection<C: DatabaseConnection>(
    token: SessionToken,
    record: SessionRecord<C>,
    limit: Duration,
) {
    match tokio::time::timeout(limit, record.connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(
                token = %token,
                cluster = %record.cluster_name,
                error = %e,
                "Failed to close database connection"
            );
        }
        Err(_) => {
            tracing::warn!(
                token = %token,
                cluster = %record.cluster_name,
                timeout_ms = limit.as_millis(),
                "Timed out closing database connection"
            );
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! In-memory connection for tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::DatabaseConnection;
    use crate::error::{ControlError, Result};

    /// Shared counters observed by a [`MockConnection`] and its test.
    #[derive(Debug, Default)]
    pub struct ConnectionProbe {
        closes: AtomicUsize,
        pings: AtomicUsize,
        healthy: AtomicBool,
        fail_close: AtomicBool,
        hang_close: AtomicBool,
    }

    impl ConnectionProbe {
        /// Create a probe for a healthy connection.
        #[must_use]
        pub fn new() -> Arc<Self> {
            let probe = Self::default();
            probe.healthy.store(true, Ordering::SeqCst);
            Arc::new(probe)
        }

        /// Number of times `close` was called.
        #[must_use]
        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        /// Number of times `ping` was called.
        #[must_use]
        pub fn pings(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }

        /// Make subsequent pings fail.
        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        /// Make subsequent closes fail.
        pub fn set_fail_close(&self, fail: bool) {
            self.fail_close.store(fail, Ordering::SeqCst);
        }

        /// Make subsequent closes never return.
        pub fn set_hang_close(&self, hang: bool) {
            self.hang_close.store(hang, Ordering::SeqCst);
        }
    }

    /// A connection that only counts calls.
    #[derive(Debug, Clone)]
    pub struct MockConnection {
        probe: Arc<ConnectionProbe>,
    }

    impl MockConnection {
        /// Create a connection reporting to `probe`.
        #[must_use]
        pub fn new(probe: &Arc<ConnectionProbe>) -> Self {
            Self {
                probe: Arc::clone(probe),
            }
        }
    }

    #[async_trait]
    impl DatabaseConnection for MockConnection {
        async fn ping(&self) -> Result<()> {
            self.probe.pings.fetch_add(1, Ordering::SeqCst);
            if self.probe.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ControlError::AuthenticationFailed(
                    "authentication expired".to_string(),
                ))
            }
        }

        async fn close(&self) -> Result<()> {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            if self.probe.hang_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.probe.fail_close.load(Ordering::SeqCst) {
                Err(ControlError::ConnectionFailed("socket reset".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
