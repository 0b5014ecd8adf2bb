//! Rolling update partition access on the cluster's StatefulSet.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use tokio::time::timeout;

use crate::error::{UpgradeError, UpgradeResult};
use crate::k8s::API_TIMEOUT;
use crate::upgrade::ClusterController;

/// A `ClusterController` backed by the cluster's StatefulSet.
pub struct StatefulSetPartition {
    /// An K8s API wrapper around the client.
    api: Api<StatefulSet>,
    /// The name of the StatefulSet.
    name: String,
}

impl StatefulSetPartition {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }

    async fn fetch(&self) -> Result<StatefulSet> {
        timeout(API_TIMEOUT, self.api.get(&self.name))
            .await
            .context("timeout fetching StatefulSet")?
            .context("error fetching StatefulSet")
    }

    async fn patch_partition(&self, partition: u32) -> Result<()> {
        let patch = serde_json::json!({"spec": {"updateStrategy": {"rollingUpdate": {"partition": partition}}}});
        timeout(API_TIMEOUT, self.api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while updating StatefulSet partition")?
            .context("error updating StatefulSet partition")?;
        Ok(())
    }
}

#[async_trait]
impl ClusterController for StatefulSetPartition {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn planned_units(&self) -> UpgradeResult<u32> {
        let sts = self.fetch().await.map_err(UpgradeError::OrchestratorUnavailable)?;
        Ok(planned_units(&sts))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_partition(&self) -> UpgradeResult<u32> {
        let sts = self.fetch().await.map_err(UpgradeError::OrchestratorUnavailable)?;
        Ok(rolling_update_partition(&sts))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_partition(&self, partition: u32) -> UpgradeResult<()> {
        tracing::info!(statefulset = %self.name, partition, "patching StatefulSet rolling update partition");
        self.patch_partition(partition).await.map_err(UpgradeError::OrchestratorUnavailable)
    }
}

/// The number of replicas the given StatefulSet is planned to have.
pub fn planned_units(sts: &StatefulSet) -> u32 {
    sts.spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .map(|replicas| replicas.max(0) as u32)
        .unwrap_or(1)
}

/// The rolling update partition of the given StatefulSet, which K8s defaults to 0.
pub fn rolling_update_partition(sts: &StatefulSet) -> u32 {
    sts.spec
        .as_ref()
        .and_then(|spec| spec.update_strategy.as_ref())
        .and_then(|strategy| strategy.rolling_update.as_ref())
        .and_then(|rolling_update| rolling_update.partition)
        .map(|partition| partition.max(0) as u32)
        .unwrap_or(0)
}
