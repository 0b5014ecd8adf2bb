//! Kubernetes controller.
//!
//! This controller watches this unit's own pod and the shared peer state ConfigMap, turns the
//! observed changes into upgrade events, and feeds them one at a time to the unit's
//! `UpgradeCoordinator`. Operator actions arrive over a channel from the HTTP server and are
//! processed in the same loop, so the coordinator never runs concurrently with itself.
//!
//! Events which the coordinator defers, or which fail, are delivered again after a fixed delay.

mod coordination;
mod data;
mod patroni;
#[cfg(test)]
mod patroni_test;
mod peer_state;
mod statefulset;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::error::{ActionFailed, ActionResult, UpgradeResult};
use crate::upgrade::{Handled, PeerStore, UpgradeCoordinator, UpgradeEvent};
pub use coordination::{LeaderElectionConfig, LeaderElector, LeaderState};
pub use patroni::PatroniDcs;
pub use peer_state::ConfigMapPeerStore;
pub use statefulset::StatefulSetPartition;

/// The app name used by the agent, also used as the Server-Side Apply field manager.
pub const APP_NAME: &str = "pg-upgrade-agent";
/// The default timeout to use for API calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay before a deferred or failed event is delivered again.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
/// The duration which leader elector clients should wait between action retries.
///
/// Core K8s clients default this value to 2 seconds.
pub const LEASE_RETRY_SECONDS: i64 = 2;

const METRIC_EVENTS_DEFERRED: &str = "pg_upgrade_events_deferred";
const METRIC_HANDLER_ERRORS: &str = "pg_upgrade_handler_errors";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Map a not found API error to `None`.
pub(crate) fn not_found_as_none<T>(res: std::result::Result<T, kube::Error>) -> std::result::Result<Option<T>, kube::Error> {
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(err) => Err(err),
    }
}

/// What the controller does once the coordinator has handled an event.
#[derive(Debug, PartialEq)]
pub(crate) enum FollowUp {
    /// Nothing further.
    Nothing,
    /// Emit the given event right away.
    Emit(UpgradeEvent),
    /// Deliver the handled event again after the reschedule delay.
    Retry,
}

/// Decide how to follow up on the outcome of handling `event`.
///
/// A completed readiness gate finishes the unit. While the workload is ready, a new revision
/// or a peer state change re-runs the readiness gate, as the gate reads the unit state from the
/// peer state and may have been evaluated against an outdated snapshot.
pub(crate) fn follow_up(event: &UpgradeEvent, res: &UpgradeResult<Handled>, workload_ready: bool) -> FollowUp {
    match (res, event) {
        (Ok(Handled::Done), UpgradeEvent::WorkloadReady) => FollowUp::Emit(UpgradeEvent::UnitFinished),
        (Ok(Handled::Done), UpgradeEvent::RevisionObserved(_)) | (Ok(Handled::Done), UpgradeEvent::PeerStateChanged) if workload_ready => {
            FollowUp::Emit(UpgradeEvent::WorkloadReady)
        }
        (Ok(Handled::Done), _) | (Ok(Handled::Ignored), _) => FollowUp::Nothing,
        (Ok(Handled::Deferred(_)), _) | (Err(_), _) => FollowUp::Retry,
    }
}

/// Check if this unit must create the peer state ConfigMap, given whether it is known to exist.
pub(crate) fn peer_state_needs_ensure(leader: &LeaderState, exists: bool) -> bool {
    matches!(leader, LeaderState::Leading) && !exists
}

/// An operator action, along with the channel on which its outcome is returned.
#[derive(Debug)]
pub enum ActionRequest {
    PreUpgradeCheck { tx: oneshot::Sender<ActionResult> },
    ResumeUpgrade { tx: oneshot::Sender<ActionResult> },
}

/// Kubernetes controller driving this unit's upgrade coordinator.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The unit's upgrade coordinator.
    coordinator: UpgradeCoordinator,
    /// The peer state store, also shared with the coordinator.
    peers: Arc<ConfigMapPeerStore>,
    /// The current leader election state.
    leader_rx: watch::Receiver<LeaderState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of upgrade events.
    events_tx: mpsc::Sender<UpgradeEvent>,
    /// A channel of upgrade events.
    events_rx: ReceiverStream<UpgradeEvent>,
    /// A channel of operator actions.
    actions_rx: ReceiverStream<ActionRequest>,
    /// A channel of delayed attempts at ensuring the peer state ConfigMap exists.
    ensure_tx: mpsc::Sender<()>,
    /// A channel of delayed attempts at ensuring the peer state ConfigMap exists.
    ensure_rx: ReceiverStream<()>,

    /// Whether the workload container was ready when last observed.
    workload_ready: bool,
    /// The workload revision last observed on this unit's pod.
    observed_revision: Option<String>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(
        client: Client, config: Arc<Config>, coordinator: UpgradeCoordinator, peers: Arc<ConfigMapPeerStore>, leader_rx: watch::Receiver<LeaderState>,
        actions_rx: mpsc::Receiver<ActionRequest>, shutdown: broadcast::Receiver<()>,
    ) -> Self {
        metrics::register_counter!(METRIC_EVENTS_DEFERRED, metrics::Unit::Count, "the number of upgrade events deferred for later delivery");
        metrics::register_counter!(METRIC_HANDLER_ERRORS, metrics::Unit::Count, "the number of upgrade event handlers which returned an error");
        let (events_tx, events_rx) = mpsc::channel(1000);
        let (ensure_tx, ensure_rx) = mpsc::channel(1);
        Self {
            client,
            config,
            coordinator,
            peers,
            leader_rx,
            shutdown_rx: BroadcastStream::new(shutdown),
            events_tx,
            events_rx: ReceiverStream::new(events_rx),
            actions_rx: ReceiverStream::new(actions_rx),
            ensure_tx,
            ensure_rx: ReceiverStream::new(ensure_rx),
            workload_ready: false,
            observed_revision: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pod_watcher = watcher(pods, Self::list_params_by_name(&self.config.pod_name));
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let peer_state_watcher = watcher(config_maps, Self::list_params_by_name(self.peers.name()));
        let mut leader_changes = WatchStream::new(self.leader_rx.clone());
        tokio::pin!(pod_watcher, peer_state_watcher);

        tracing::info!(unit = %self.coordinator.unit(), "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = pod_watcher.next() => self.handle_pod_event(k8s_event_res).await,
                Some(k8s_event_res) = peer_state_watcher.next() => self.handle_peer_state_event(k8s_event_res).await,
                Some(leader_state) = leader_changes.next() => self.handle_leader_state(leader_state).await,
                Some(event) = self.events_rx.next() => self.handle_upgrade_event(event).await,
                Some(action) = self.actions_rx.next() => self.handle_action(action).await,
                Some(()) = self.ensure_rx.next() => self.handle_ensure_retry().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle a change of the leader election state.
    ///
    /// A new leader makes sure the peer state bus exists, and recomputes the cluster scoped
    /// peer state.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_leader_state(&mut self, state: LeaderState) {
        if !matches!(state, LeaderState::Leading) {
            return;
        }
        self.ensure_peer_state().await;
    }

    /// Ensure the peer state ConfigMap exists, retrying later on failure.
    async fn ensure_peer_state(&mut self) {
        match self.peers.ensure(&self.config.statefulset).await {
            Ok(()) => self.spawn_event(UpgradeEvent::PeerStateChanged, false),
            Err(err) => {
                tracing::error!(error = ?err, "error ensuring peer state ConfigMap exists");
                let tx = self.ensure_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
                    let _res = tx.send(()).await;
                });
            }
        }
    }

    /// Retry ensuring the peer state ConfigMap exists, if still needed.
    async fn handle_ensure_retry(&mut self) {
        let leader = self.leader_rx.borrow().clone();
        if peer_state_needs_ensure(&leader, self.peers.snapshot().is_some()) {
            self.ensure_peer_state().await;
        }
    }

    /// Handle an upgrade event, re-queuing it if it could not be completed.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_upgrade_event(&mut self, event: UpgradeEvent) {
        let res = self.coordinator.handle(&event).await;
        match &res {
            Ok(Handled::Done) => (),
            Ok(Handled::Ignored) => tracing::debug!("event ignored"),
            Ok(Handled::Deferred(reason)) => {
                tracing::debug!(reason = *reason, "event deferred");
                metrics::increment_counter!(METRIC_EVENTS_DEFERRED);
            }
            Err(err) => {
                tracing::error!(error = ?err, "error handling upgrade event");
                metrics::increment_counter!(METRIC_HANDLER_ERRORS);
            }
        }
        match follow_up(&event, &res, self.workload_ready) {
            FollowUp::Nothing => (),
            FollowUp::Emit(next) => self.spawn_event(next, false),
            FollowUp::Retry => self.spawn_event(event, true),
        }
    }

    /// Handle an operator action.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_action(&mut self, action: ActionRequest) {
        match action {
            ActionRequest::PreUpgradeCheck { tx } => {
                let res = match self.coordinator.pre_upgrade_check().await {
                    Ok(partition) => Ok(format!("Pre-upgrade check passed, rolling update partition set to {}", partition)),
                    Err(err) => {
                        tracing::error!(error = ?err, "pre-upgrade check failed");
                        Err(ActionFailed::from(err))
                    }
                };
                let _ = tx.send(res);
            }
            ActionRequest::ResumeUpgrade { tx } => {
                let _ = tx.send(self.coordinator.on_resume_upgrade().await);
            }
        }
    }

    /// Spawn a task which emits the given event, after the reschedule delay when retrying.
    ///
    /// This indirection keeps the controller from dead-locking on its own bounded queue.
    fn spawn_event(&self, event: UpgradeEvent, is_retry: bool) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(event).await;
        });
    }

    /// Create a list params object which selects only the named object.
    fn list_params_by_name(name: &str) -> ListParams {
        ListParams {
            field_selector: Some(format!("metadata.name={}", name)),
            ..Default::default()
        }
    }
}
