//! Cluster login.
//!
//! Turns a connection string plus credentials into a live session: the
//! credentials are URL-encoded into the connection URL handed to the driver,
//! while the session keeps only a credential-free copy for display.

use std::fmt;

use async_trait::async_trait;
use atlas_console_core::SessionToken;
use serde::Deserialize;

use crate::error::{ControlError, Result};
use crate::session::{DatabaseConnection, SessionStore};

const SRV_SCHEME: &str = "mongodb+srv://";
const STANDARD_SCHEME: &str = "mongodb://";

/// Opens authenticated connections to a cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The connection type produced.
    type Connection: DatabaseConnection;

    /// Open a connection to `target`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AuthenticationFailed` if the credentials are
    /// rejected and `ControlError::ConnectionFailed` if the cluster cannot be
    /// reached.
    async fn connect(&self, target: &ConnectionTarget) -> Result<Self::Connection>;
}

/// Login form submitted by the browser.
#[derive(Clone, Deserialize)]
pub struct LoginRequest {
    /// `mongodb://` or `mongodb+srv://` connection string, with or without
    /// embedded credentials.
    pub connection_string: String,
    /// Database user.
    pub username: String,
    /// Database password.
    pub password: String,
    /// Display name of the cluster. Derived from the host when absent.
    #[serde(default)]
    pub cluster_name: Option<String>,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("connection_string", &self.connection_string)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("cluster_name", &self.cluster_name)
            .finish()
    }
}

/// A parsed connection target.
#[derive(Clone)]
pub struct ConnectionTarget {
    authenticated_url: String,
    sanitized: String,
    host: String,
}

impl ConnectionTarget {
    /// Build a target from a connection string and credentials.
    ///
    /// Any credentials already embedded in the string are replaced.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidConnectionString` for anything other than
    /// a `mongodb://` or `mongodb+srv://` URL with a host.
    pub fn parse(connection_string: &str, username: &str, password: &str) -> Result<Self> {
        let trimmed = connection_string.trim();
        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix(SRV_SCHEME) {
            (SRV_SCHEME, rest)
        } else if let Some(rest) = trimmed.strip_prefix(STANDARD_SCHEME) {
            (STANDARD_SCHEME, rest)
        } else {
            return Err(ControlError::InvalidConnectionString(
                "expected mongodb:// or mongodb+srv://".to_string(),
            ));
        };

        // Existing credentials live in the authority, before the first '/' or '?'.
        let authority_end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let hosts = authority.rsplit_once('@').map_or(authority, |(_, hosts)| hosts);

        if hosts.is_empty() {
            return Err(ControlError::InvalidConnectionString(
                "missing host".to_string(),
            ));
        }

        let host = hosts.split(',').next().unwrap_or(hosts);
        let host = host.split(':').next().unwrap_or(host).to_string();

        Ok(Self {
            authenticated_url: format!(
                "{scheme}{}:{}@{hosts}{tail}",
                urlencoding::encode(username),
                urlencoding::encode(password),
            ),
            sanitized: format!("{scheme}{hosts}{tail}"),
            host,
        })
    }

    /// The URL to hand to the driver. Contains the password.
    #[must_use]
    pub fn authenticated_url(&self) -> &str {
        &self.authenticated_url
    }

    /// The connection string with credentials removed.
    #[must_use]
    pub fn sanitized(&self) -> &str {
        &self.sanitized
    }

    /// First label of the first host, e.g. `cluster0` for
    /// `cluster0.abcde.mongodb.net`.
    #[must_use]
    pub fn default_cluster_name(&self) -> &str {
        self.host.split('.').next().unwrap_or(&self.host)
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("sanitized", &self.sanitized)
            .finish_non_exhaustive()
    }
}

/// Authenticate against a cluster and register the connection as a session.
///
/// # Errors
///
/// Returns `ControlError::InvalidConnectionString` for a malformed connection
/// string, or whatever the connector or the initial health probe reports.
/// Authentication failures are returned as-is and never retried.
pub async fn login<K: Connector>(
    store: &SessionStore<K::Connection>,
    connector: &K,
    request: LoginRequest,
) -> Result<SessionToken> {
    let target = ConnectionTarget::parse(
        &request.connection_string,
        &request.username,
        &request.password,
    )?;

    let connection = connector.connect(&target).await.inspect_err(|e| {
        tracing::warn!(endpoint = %target.sanitized(), error = %e, "Cluster login failed");
    })?;

    if let Err(e) = connection.ping().await {
        tracing::warn!(endpoint = %target.sanitized(), error = %e, "Cluster rejected initial ping");
        if let Err(close_err) = connection.close().await {
            tracing::debug!(error = %close_err, "Failed to close rejected connection");
        }
        return Err(e);
    }

    let cluster_name = request
        .cluster_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| target.default_cluster_name().to_string());

    Ok(store.create(connection, cluster_name, request.username, target.sanitized()))
}
