//! Kind-specific executors for queued operations.
//!
//! Each executor decodes the operation metadata into a typed parameter struct
//! and makes exactly one call against the control plane. The web forms submit
//! camelCase keys, so the Atlas spellings are accepted as aliases.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::client::ControlPlaneClient;
use crate::error::{ControlError, Result};
use crate::operation::OperationKind;

/// Parameters of a `create_project` operation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectParams {
    /// Project name.
    pub name: String,
    /// Owning organization.
    #[serde(alias = "orgId")]
    pub org_id: String,
}

/// Parameters of a `delete_project` operation.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteProjectParams {
    /// Project to delete.
    #[serde(alias = "projectId")]
    pub project_id: String,
    /// Clusters the submitter confirmed deleting along with the project.
    /// Reported only; the executor does not look them up again.
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// Parameters of a `create_cluster` operation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateClusterParams {
    /// Project the cluster is created in.
    #[serde(alias = "projectId")]
    pub project_id: String,
    /// Cluster specification, sent to the API unchanged.
    pub spec: Map<String, Value>,
}

/// Parameters of a `delete_cluster` operation.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteClusterParams {
    /// Project holding the cluster.
    #[serde(alias = "projectId")]
    pub project_id: String,
    /// Cluster to delete.
    #[serde(alias = "clusterName")]
    pub cluster_name: String,
}

fn decode<T: DeserializeOwned>(kind: OperationKind, metadata: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(metadata.clone())).map_err(|e| {
        ControlError::InvalidMetadata {
            kind,
            reason: e.to_string(),
        }
    })
}

/// Check that `metadata` decodes for `kind`, without executing anything.
///
/// # Errors
///
/// Returns `ControlError::InvalidMetadata` describing the first problem found.
pub fn check_metadata(kind: OperationKind, metadata: &Map<String, Value>) -> Result<()> {
    match kind {
        OperationKind::CreateProject => decode::<CreateProjectParams>(kind, metadata).map(drop),
        OperationKind::DeleteProject => decode::<DeleteProjectParams>(kind, metadata).map(drop),
        OperationKind::CreateCluster => decode::<CreateClusterParams>(kind, metadata).map(drop),
        OperationKind::DeleteCluster => decode::<DeleteClusterParams>(kind, metadata).map(drop),
    }
}

/// Run one operation against the control plane.
///
/// `report` receives a one-line progress message before the remote call.
///
/// # Errors
///
/// Returns `ControlError::InvalidMetadata` if the metadata does not fit the
/// kind, or the client's error if the remote call fails.
pub async fn execute(
    client: &dyn ControlPlaneClient,
    kind: OperationKind,
    metadata: &Map<String, Value>,
    report: &(dyn Fn(String) + Send + Sync),
) -> Result<Value> {
    match kind {
        OperationKind::CreateProject => {
            let params: CreateProjectParams = decode(kind, metadata)?;
            report(format!("Creating project {}", params.name));
            client.create_project(&params.name, &params.org_id).await
        }
        OperationKind::DeleteProject => {
            let params: DeleteProjectParams = decode(kind, metadata)?;
            if params.clusters.is_empty() {
                report(format!("Deleting project {}", params.project_id));
            } else {
                report(format!(
                    "Deleting project {} (clusters: {})",
                    params.project_id,
                    params.clusters.join(", ")
                ));
            }
            client.delete_project(&params.project_id).await
        }
        OperationKind::CreateCluster => {
            let params: CreateClusterParams = decode(kind, metadata)?;
            let name = params
                .spec
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("cluster")
                .to_string();
            report(format!("Creating cluster {name} in project {}", params.project_id));
            client
                .create_cluster(&params.project_id, &Value::Object(params.spec))
                .await
        }
        OperationKind::DeleteCluster => {
            let params: DeleteClusterParams = decode(kind, metadata)?;
            report(format!(
                "Deleting cluster {} in project {}",
                params.cluster_name, params.project_id
            ));
            client
                .delete_cluster(&params.project_id, &params.cluster_name)
                .await
        }
    }
}
