//! The peer state bus, backed by a ConfigMap shared by all units.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::client::Client;
use maplit::btreemap;
use tokio::time::timeout;

use crate::error::{UpgradeError, UpgradeResult};
use crate::k8s::{API_TIMEOUT, APP_NAME};
use crate::upgrade::{PeerField, PeerState, PeerStore};

/// A `PeerStore` backed by a ConfigMap's data.
pub struct ConfigMapPeerStore {
    /// An K8s API wrapper around the client.
    api: Api<ConfigMap>,
    /// The name of the ConfigMap.
    name: String,
    /// The latest observed peer state.
    current: ArcSwapOption<PeerState>,
    /// The highest resource version stored in `current`, 0 when unknown.
    resource_version: AtomicU64,
}

impl ConfigMapPeerStore {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            current: Default::default(),
            resource_version: AtomicU64::new(0),
        }
    }

    /// The name of the backing ConfigMap.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a state of the backing ConfigMap delivered by its watcher.
    ///
    /// Returns `false` if the state is older than the one already stored, such as a watch event
    /// which was queued before this unit's own write returned. Such states are dropped.
    pub fn observe(&self, cm: Option<&ConfigMap>) -> bool {
        match cm {
            Some(cm) => self.store(cm),
            None => {
                self.current.store(None);
                self.resource_version.store(0, Ordering::SeqCst);
                true
            }
        }
    }

    /// Store the given state unless a more recent one is already stored.
    fn store(&self, cm: &ConfigMap) -> bool {
        let observed = cm.metadata.resource_version.as_deref();
        let latest = self.resource_version.load(Ordering::SeqCst);
        if is_stale(observed, latest) {
            tracing::debug!(?observed, latest, "dropping stale peer state");
            return false;
        }
        if let Some(version) = parse_resource_version(observed) {
            self.resource_version.store(version, Ordering::SeqCst);
        }
        self.current.store(Some(Arc::new(peer_state_from_config_map(cm))));
        true
    }

    /// Ensure the backing ConfigMap exists, creating it if needed.
    ///
    /// Only the leader calls this. Server-Side Apply without any data fields leaves the data
    /// written by other units untouched.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ensure(&self, statefulset: &str) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(btreemap! {
                    "app.kubernetes.io/name".into() => statefulset.into(),
                    "app.kubernetes.io/managed-by".into() => APP_NAME.into(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let cm = timeout(API_TIMEOUT, self.api.patch(&self.name, &params, &Patch::Apply(&cm)))
            .await
            .context("timeout ensuring peer state ConfigMap")?
            .context("error ensuring peer state ConfigMap")?;
        let _ = self.store(&cm);
        Ok(())
    }
}

#[async_trait]
impl PeerStore for ConfigMapPeerStore {
    fn snapshot(&self) -> Option<Arc<PeerState>> {
        self.current.load_full()
    }

    #[tracing::instrument(level = "debug", skip(self, updates))]
    async fn write(&self, updates: &[(PeerField, String)]) -> UpgradeResult<()> {
        let data: BTreeMap<String, String> = updates.iter().map(|(field, val)| (field.key(), val.clone())).collect();
        tracing::debug!(data = ?data, "writing peer state");
        let patch = serde_json::json!({ "data": data });
        let cm = timeout(API_TIMEOUT, self.api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout writing peer state")
            .and_then(|res| res.context("error writing peer state"))
            .map_err(UpgradeError::PeerStateUnavailable)?;
        // The patched object is the most recent state, no need to wait for the watcher.
        let _ = self.store(&cm);
        Ok(())
    }
}

/// Build a peer state snapshot from the given ConfigMap.
pub fn peer_state_from_config_map(cm: &ConfigMap) -> PeerState {
    PeerState::from_data(cm.data.clone().unwrap_or_default())
}

/// Check if an observed resource version is older than the latest stored one.
///
/// Resource versions which are not integers are never considered stale.
pub fn is_stale(observed: Option<&str>, latest: u64) -> bool {
    parse_resource_version(observed).map(|observed| observed < latest).unwrap_or(false)
}

fn parse_resource_version(version: Option<&str>) -> Option<u64> {
    version.and_then(|version| version.parse::<u64>().ok())
}
