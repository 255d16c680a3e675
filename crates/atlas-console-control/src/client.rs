//! Client for the Atlas Administration API.
//!
//! Only the four mutations the operation worker executes are modelled here.
//! Reads, pagination and the remaining API surface belong to the route layer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControlError, Result};

/// Versioned media type required by the Atlas Administration API v2.
pub const ATLAS_MEDIA_TYPE: &str = "application/vnd.atlas.2023-01-01+json";

/// Mutations against the remote control plane.
///
/// Every method is a single remote call. Implementations must not retry.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Create a project in an organization.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::RemoteOperationFailed` if the request fails or
    /// the API rejects it.
    async fn create_project(&self, name: &str, org_id: &str) -> Result<Value>;

    /// Delete a project.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::RemoteOperationFailed` if the request fails or
    /// the API rejects it.
    async fn delete_project(&self, project_id: &str) -> Result<Value>;

    /// Create a cluster in a project from a cluster specification.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::RemoteOperationFailed` if the request fails or
    /// the API rejects it.
    async fn create_cluster(&self, project_id: &str, spec: &Value) -> Result<Value>;

    /// Delete a cluster.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::RemoteOperationFailed` if the request fails or
    /// the API rejects it.
    async fn delete_cluster(&self, project_id: &str, cluster_name: &str) -> Result<Value>;
}

/// HTTP client for the Atlas Administration API.
#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpControlPlaneClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root, e.g. "https://cloud.mongodb.com/api/atlas/v2"
    /// * `access_token` - Bearer token sent with every request, if any
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ControlError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, base_url, access_token))
    }

    /// Create a new client with a custom reqwest client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    /// Get the API root URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, ATLAS_MEDIA_TYPE);

        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, action: &str) -> Result<Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| ControlError::RemoteOperationFailed(format!("{action}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(Value::Object(serde_json::Map::new()));
            }
            let body = response
                .text()
                .await
                .map_err(|e| ControlError::RemoteOperationFailed(format!("{action}: {e}")))?;
            if body.trim().is_empty() {
                return Ok(Value::Object(serde_json::Map::new()));
            }
            return serde_json::from_str(&body).map_err(|e| {
                ControlError::RemoteOperationFailed(format!("{action}: invalid response body: {e}"))
            });
        }

        let detail = response
            .json::<ErrorResponse>()
            .await
            .ok()
            .and_then(ErrorResponse::into_message);
        let message = match detail {
            Some(detail) => format!("{} {detail}", status.as_u16()),
            None => format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("error")),
        };

        tracing::error!(status = %status, error = %message, "{action} failed");
        Err(ControlError::RemoteOperationFailed(message))
    }
}

/// Request body for project creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest<'a> {
    name: &'a str,
    org_id: &'a str,
}

/// Error body returned by the Atlas API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

impl ErrorResponse {
    fn into_message(self) -> Option<String> {
        match (self.error_code, self.detail) {
            (Some(code), Some(detail)) => Some(format!("{code}: {detail}")),
            (Some(code), None) => Some(code),
            (None, Some(detail)) => Some(detail),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn create_project(&self, name: &str, org_id: &str) -> Result<Value> {
        let builder = self
            .request(reqwest::Method::POST, "/groups")
            .json(&CreateProjectRequest { name, org_id });
        let value = self.send(builder, "create project").await?;
        tracing::debug!(project = %name, org_id = %org_id, "Created project via Atlas API");
        Ok(value)
    }

    async fn delete_project(&self, project_id: &str) -> Result<Value> {
        let path = format!("/groups/{}", urlencoding::encode(project_id));
        let value = self
            .send(self.request(reqwest::Method::DELETE, &path), "delete project")
            .await?;
        tracing::debug!(project_id = %project_id, "Deleted project via Atlas API");
        Ok(value)
    }

    async fn create_cluster(&self, project_id: &str, spec: &Value) -> Result<Value> {
        let path = format!("/groups/{}/clusters", urlencoding::encode(project_id));
        let builder = self.request(reqwest::Method::POST, &path).json(spec);
        let value = self.send(builder, "create cluster").await?;
        tracing::debug!(project_id = %project_id, "Created cluster via Atlas API");
        Ok(value)
    }

    async fn delete_cluster(&self, project_id: &str, cluster_name: &str) -> Result<Value> {
        let path = format!(
            "/groups/{}/clusters/{}",
            urlencoding::encode(project_id),
            urlencoding::encode(cluster_name)
        );
        let value = self
            .send(self.request(reqwest::Method::DELETE, &path), "delete cluster")
            .await?;
        tracing::debug!(
            project_id = %project_id,
            cluster = %cluster_name,
            "Deleted cluster via Atlas API"
        );
        Ok(value)
    }
}

/// A no-op client for running the console without API credentials.
///
/// Every call logs a warning and succeeds with an empty body.
#[derive(Debug, Clone, Default)]
pub struct NoopControlPlaneClient;

impl NoopControlPlaneClient {
    /// Create a new no-op client.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ControlPlaneClient for NoopControlPlaneClient {
    async fn create_project(&self, name: &str, _org_id: &str) -> Result<Value> {
        tracing::warn!(project = %name, "NoopControlPlaneClient: create_project called but no API configured");
        Ok(Value::Object(serde_json::Map::new()))
    }

    async fn delete_project(&self, project_id: &str) -> Result<Value> {
        tracing::warn!(project_id = %project_id, "NoopControlPlaneClient: delete_project called but no API configured");
        Ok(Value::Object(serde_json::Map::new()))
    }

    async fn create_cluster(&self, project_id: &str, _spec: &Value) -> Result<Value> {
        tracing::warn!(project_id = %project_id, "NoopControlPlaneClient: create_cluster called but no API configured");
        Ok(Value::Object(serde_json::Map::new()))
    }

    async fn delete_cluster(&self, project_id: &str, cluster_name: &str) -> Result<Value> {
        tracing::warn!(
            project_id = %project_id,
            cluster = %cluster_name,
            "NoopControlPlaneClient: delete_cluster called but no API configured"
        );
        Ok(Value::Object(serde_json::Map::new()))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! Recording control-plane client for tests.

    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::ControlPlaneClient;
    use crate::error::{ControlError, Result};

    /// A call observed by [`MockControlPlaneClient`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RecordedCall {
        /// `create_project(name, org_id)`.
        CreateProject {
            /// Project name.
            name: String,
            /// Organization id.
            org_id: String,
        },
        /// `delete_project(project_id)`.
        DeleteProject {
            /// Project id.
            project_id: String,
        },
        /// `create_cluster(project_id, spec)`.
        CreateCluster {
            /// Project id.
            project_id: String,
            /// Cluster specification.
            spec: Value,
        },
        /// `delete_cluster(project_id, cluster_name)`.
        DeleteCluster {
            /// Project id.
            project_id: String,
            /// Cluster name.
            cluster_name: String,
        },
    }

    /// A client that records calls and can be told to fail.
    #[derive(Default)]
    pub struct MockControlPlaneClient {
        calls: Mutex<Vec<RecordedCall>>,
        failures: Mutex<HashMap<&'static str, String>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockControlPlaneClient {
        /// Create a client where every call succeeds.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call of `method` (e.g. `"delete_project"`) fail with `message`.
        pub fn fail(&self, method: &'static str, message: impl Into<String>) {
            self.failures.lock().insert(method, message.into());
        }

        /// Sleep for `delay` inside every call.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        /// Calls observed so far, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }

        async fn record(&self, method: &'static str, call: RecordedCall) -> Result<()> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().push(call);
            match self.failures.lock().get(method) {
                Some(message) => Err(ControlError::RemoteOperationFailed(message.clone())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ControlPlaneClient for MockControlPlaneClient {
        async fn create_project(&self, name: &str, org_id: &str) -> Result<Value> {
            self.record(
                "create_project",
                RecordedCall::CreateProject {
                    name: name.to_string(),
                    org_id: org_id.to_string(),
                },
            )
            .await?;
            Ok(json!({ "id": format!("proj-{name}"), "name": name, "orgId": org_id }))
        }

        async fn delete_project(&self, project_id: &str) -> Result<Value> {
            self.record(
                "delete_project",
                RecordedCall::DeleteProject {
                    project_id: project_id.to_string(),
                },
            )
            .await?;
            Ok(json!({}))
        }

        async fn create_cluster(&self, project_id: &str, spec: &Value) -> Result<Value> {
            self.record(
                "create_cluster",
                RecordedCall::CreateCluster {
                    project_id: project_id.to_string(),
                    spec: spec.clone(),
                },
            )
            .await?;
            Ok(json!({ "groupId": project_id, "stateName": "CREATING" }))
        }

        async fn delete_cluster(&self, project_id: &str, cluster_name: &str) -> Result<Value> {
            self.record(
                "delete_cluster",
                RecordedCall::DeleteCluster {
                    project_id: project_id.to_string(),
                    cluster_name: cluster_name.to_string(),
                },
            )
            .await?;
            Ok(json!({}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn http_client_creation() {
        let client = HttpControlPlaneClient::new("http://localhost:8080/", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn create_project_posts_name_and_org() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groups"))
            .and(header("accept", ATLAS_MEDIA_TYPE))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_json(json!({ "name": "p1", "orgId": "o1" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "abc", "name": "p1" })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            HttpControlPlaneClient::new(server.uri(), Some("secret-token".to_string())).unwrap();
        let created = client.create_project("p1", "o1").await.unwrap();
        assert_eq!(created["id"], "abc");
    }

    #[tokio::test]
    async fn delete_cluster_accepts_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/groups/g1/clusters/Cluster0"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri(), None).unwrap();
        let value = client.delete_cluster("g1", "Cluster0").await.unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn delete_project_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/groups/g1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri(), None).unwrap();
        assert_eq!(client.delete_project("g1").await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn api_error_maps_to_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/groups/g1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "detail": "Cannot close group while it has active clusters.",
                "errorCode": "CANNOT_CLOSE_GROUP_ACTIVE_ATLAS_CLUSTERS",
                "error": 409
            })))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri(), None).unwrap();
        let err = client.delete_project("g1").await.unwrap_err();
        match err {
            ControlError::RemoteOperationFailed(message) => {
                assert!(message.starts_with("409 CANNOT_CLOSE_GROUP_ACTIVE_ATLAS_CLUSTERS"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_error_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groups/g1/clusters"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri(), None).unwrap();
        let err = client
            .create_cluster("g1", &json!({ "name": "c1" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "remote operation failed: 503 Service Unavailable");
    }

    #[tokio::test]
    async fn noop_client_succeeds() {
        let client = NoopControlPlaneClient::new();
        assert!(client.create_project("p1", "o1").await.is_ok());
        assert!(client.delete_cluster("g1", "c1").await.is_ok());
    }
}
