use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::Resource;
use kube::runtime::watcher::Event;

use crate::k8s::{peer_state_needs_ensure, Controller, EventResult};
use crate::upgrade::UpgradeEvent;

/// The label which the StatefulSet controller sets to the revision of a pod's template.
const LABEL_CONTROLLER_REVISION_HASH: &str = "controller-revision-hash";

//////////////////////////////////////////////////////////////////////////////
// Pod Events ////////////////////////////////////////////////////////////////
impl Controller {
    /// Handle a watcher event on this unit's own pod.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_pod_event(&mut self, res: EventResult<Pod>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pod k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(pod) => self.pod_applied(pod),
            Event::Deleted(_) => self.workload_ready = false,
            Event::Restarted(pods) => {
                let name = self.config.pod_name.as_str();
                match pods.into_iter().find(|pod| pod.meta().name.as_deref() == Some(name)) {
                    Some(pod) => self.pod_applied(pod),
                    None => self.workload_ready = false,
                }
            }
        }
    }

    fn pod_applied(&mut self, pod: Pod) {
        if let Some(revision) = pod_revision(&pod) {
            if self.observed_revision.as_deref() != Some(revision) {
                tracing::debug!(revision, "observed workload revision");
                self.observed_revision = Some(revision.to_string());
                self.spawn_event(UpgradeEvent::RevisionObserved(revision.to_string()), false);
            }
        }

        let ready = container_ready(&pod, &self.config.workload_container);
        if ready && !self.workload_ready {
            tracing::info!(container = %self.config.workload_container, "workload became ready");
            self.spawn_event(UpgradeEvent::WorkloadReady, false);
        }
        self.workload_ready = ready;
    }
}

//////////////////////////////////////////////////////////////////////////////
// Peer State Events /////////////////////////////////////////////////////////
impl Controller {
    /// Handle a watcher event on the peer state ConfigMap.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_peer_state_event(&mut self, res: EventResult<ConfigMap>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from ConfigMap k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        let cm = match event {
            Event::Applied(cm) => Some(cm),
            Event::Deleted(_) => None,
            Event::Restarted(cms) => {
                let name = self.peers.name();
                cms.into_iter().find(|cm| cm.meta().name.as_deref() == Some(name))
            }
        };
        let exists = cm.is_some();
        if !self.peers.observe(cm.as_ref()) {
            return;
        }
        if exists {
            self.spawn_event(UpgradeEvent::PeerStateChanged, false);
            return;
        }

        tracing::warn!(configmap = %self.peers.name(), "peer state ConfigMap is missing");
        let leader = self.leader_rx.borrow().clone();
        if peer_state_needs_ensure(&leader, exists) {
            self.ensure_peer_state().await;
        }
    }
}

/// The template revision which the given pod was created from.
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_CONTROLLER_REVISION_HASH))
        .map(String::as_str)
        .filter(|revision| !revision.is_empty())
}

/// Check if the named container of the given pod is ready.
pub fn container_ready(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|status| status.name == container))
        .map(|status| status.ready)
        .unwrap_or(false)
}
