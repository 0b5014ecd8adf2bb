//! Replication topology access through Patroni's Kubernetes DCS objects.
//!
//! Patroni keeps its distributed configuration state in K8s objects named after its cluster
//! scope. This adapter only reads that state, and requests switchovers the same way that
//! `patronictl` does, by writing the failover key. It never talks to Patroni's REST API.
//!
//! - `{scope}-leader`: annotation `leader` holds the name of the current primary member;
//! - `{scope}-sync`: annotation `sync_standby` holds the comma separated synchronous standbys;
//! - `{scope}-config`: annotation `initialize` is set once the cluster has been bootstrapped;
//! - `{scope}-failover`: annotations `leader` & `member` request a switchover;
//! - member pods: annotation `status` holds the member's JSON status, including its `state`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::client::Client;
use serde::Deserialize;
use tokio::time::timeout;

use crate::error::{UpgradeError, UpgradeResult};
use crate::k8s::{not_found_as_none, API_TIMEOUT, APP_NAME};
use crate::unit::Unit;
use crate::upgrade::ReplicationTopology;

const SUFFIX_LEADER: &str = "-leader";
const SUFFIX_SYNC: &str = "-sync";
const SUFFIX_CONFIG: &str = "-config";
const SUFFIX_FAILOVER: &str = "-failover";
const ANNOTATION_LEADER: &str = "leader";
const ANNOTATION_MEMBER: &str = "member";
const ANNOTATION_SYNC_STANDBY: &str = "sync_standby";
const ANNOTATION_INITIALIZE: &str = "initialize";
const ANNOTATION_STATUS: &str = "status";
/// The member state reported by Patroni once it is up and managing PostgreSQL.
const MEMBER_STATE_RUNNING: &str = "running";
/// The interval at which the primary is polled while waiting for a switchover.
const SWITCHOVER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The subset of a Patroni member's status which is used here.
#[derive(Debug, Deserialize)]
struct MemberStatus {
    #[serde(default)]
    state: Option<String>,
}

/// A `ReplicationTopology` backed by Patroni's Kubernetes DCS.
pub struct PatroniDcs {
    /// An K8s API wrapper for Patroni's ConfigMaps.
    config_maps: Api<ConfigMap>,
    /// An K8s API wrapper for member pods.
    pods: Api<Pod>,
    /// Patroni's cluster scope.
    scope: String,
    /// The application name of all members.
    app: String,
    /// The duration to wait for a requested switchover to take effect.
    switchover_timeout: Duration,
}

impl PatroniDcs {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str, scope: impl Into<String>, app: impl Into<String>, switchover_timeout: Duration) -> Self {
        Self {
            config_maps: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
            scope: scope.into(),
            app: app.into(),
            switchover_timeout,
        }
    }

    /// Fetch the annotations of the given DCS object, which are empty if it does not exist.
    async fn annotations(&self, suffix: &str) -> Result<BTreeMap<String, String>> {
        let name = format!("{}{}", self.scope, suffix);
        let cm = timeout(API_TIMEOUT, self.config_maps.get(&name))
            .await
            .with_context(|| format!("timeout fetching {}", name))
            .map(not_found_as_none)?
            .with_context(|| format!("error fetching {}", name))?;
        Ok(cm.and_then(|cm| cm.metadata.annotations).unwrap_or_default())
    }

    async fn primary(&self) -> Result<Unit> {
        let annotations = self.annotations(SUFFIX_LEADER).await?;
        let member = annotations
            .get(ANNOTATION_LEADER)
            .filter(|member| !member.is_empty())
            .context("cluster has no leader")?;
        Unit::from_pod_name(&self.app, member)
    }

    /// Request a switchover by writing the failover key.
    async fn request_switchover(&self, primary: &Unit, candidate: Option<&Unit>) -> Result<()> {
        let name = format!("{}{}", self.scope, SUFFIX_FAILOVER);
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_LEADER.to_string(), primary.pod_name());
        annotations.insert(ANNOTATION_MEMBER.to_string(), candidate.map(Unit::pod_name).unwrap_or_default());
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        timeout(API_TIMEOUT, self.config_maps.patch(&name, &params, &Patch::Apply(&cm)))
            .await
            .context("timeout requesting switchover")?
            .context("error requesting switchover")?;
        Ok(())
    }

    /// Wait for the primary to move away from `from`, and onto `candidate` if one is given.
    async fn await_switchover(&self, from: &Unit, candidate: Option<&Unit>) -> Result<Unit> {
        let deadline = tokio::time::Instant::now() + self.switchover_timeout;
        loop {
            tokio::time::sleep(SWITCHOVER_POLL_INTERVAL).await;
            match self.primary().await {
                Ok(primary) if &primary != from && candidate.map(|c| c == &primary).unwrap_or(true) => return Ok(primary),
                Ok(primary) => tracing::debug!(%primary, "waiting for switchover"),
                Err(err) => tracing::debug!(error = ?err, "waiting for switchover"),
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timeout after {}s waiting for switchover from {}", self.switchover_timeout.as_secs(), from);
            }
        }
    }
}

#[async_trait]
impl ReplicationTopology for PatroniDcs {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn is_cluster_initialised(&self) -> UpgradeResult<bool> {
        let annotations = self.annotations(SUFFIX_CONFIG).await.map_err(UpgradeError::TopologyUnavailable)?;
        Ok(annotations.get(ANNOTATION_INITIALIZE).map(|val| !val.is_empty()).unwrap_or(false))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn member_started(&self, unit: &Unit) -> UpgradeResult<bool> {
        let pod = timeout(API_TIMEOUT, self.pods.get(&unit.pod_name()))
            .await
            .context("timeout fetching member pod")
            .and_then(|res| not_found_as_none(res).context("error fetching member pod"))
            .map_err(UpgradeError::TopologyUnavailable)?;
        Ok(pod.map(|pod| member_is_running(&pod)).unwrap_or(false))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_primary(&self) -> UpgradeResult<Unit> {
        self.primary().await.map_err(UpgradeError::TopologyUnavailable)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_sync_standby_names(&self) -> UpgradeResult<Vec<Unit>> {
        let annotations = self.annotations(SUFFIX_SYNC).await.map_err(UpgradeError::TopologyUnavailable)?;
        let names = annotations.get(ANNOTATION_SYNC_STANDBY).map(String::as_str).unwrap_or_default();
        parse_sync_standbys(&self.app, names).map_err(UpgradeError::TopologyUnavailable)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn switchover(&self, candidate: Option<&Unit>) -> UpgradeResult<()> {
        let primary = self.primary().await.map_err(|err| UpgradeError::SwitchoverFailed(format!("{:#}", err)))?;
        if candidate == Some(&primary) {
            return Err(UpgradeError::SwitchoverFailed(format!("{} is already the primary", primary)));
        }
        self.request_switchover(&primary, candidate)
            .await
            .map_err(|err| UpgradeError::SwitchoverFailed(format!("{:#}", err)))?;
        let new_primary = self
            .await_switchover(&primary, candidate)
            .await
            .map_err(|err| UpgradeError::SwitchoverFailed(format!("{:#}", err)))?;
        tracing::info!(from = %primary, to = %new_primary, "switchover completed");
        Ok(())
    }
}

/// Parse Patroni's comma separated list of synchronous standby members, preserving order.
pub fn parse_sync_standbys(app: &str, names: &str) -> Result<Vec<Unit>> {
    names
        .split(',')
        .map(|name| name.trim().trim_matches('"'))
        .filter(|name| !name.is_empty())
        .map(|name| Unit::from_pod_name(app, name))
        .collect()
}

/// Check if the Patroni member status annotation of the given pod reports a running member.
pub fn member_is_running(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_STATUS))
        .and_then(|status| match serde_json::from_str::<MemberStatus>(status) {
            Ok(status) => status.state,
            Err(err) => {
                tracing::warn!(error = ?err, "unparsable Patroni member status");
                None
            }
        })
        .map(|state| state == MEMBER_STATE_RUNNING)
        .unwrap_or(false)
}
