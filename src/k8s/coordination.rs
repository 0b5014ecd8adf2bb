//! Leader election among the agents of a cluster, built on the `coordination.k8s.io/v1` API.
//!
//! The protocol follows the upstream client-go leader election: the holder renews the lease
//! before its renew deadline, and candidates take over once the lease has gone unchanged for a
//! full lease duration. The API does not guarantee that only one agent believes it leads at any
//! instant, so leader-only actions re-check the published state right before acting.

use anyhow::{ensure, Context, Result};
use chrono::{prelude::*, Duration};
use futures::prelude::*;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Event, Result as WatcherResult};
use maplit::btreemap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use crate::k8s::{not_found_as_none, API_TIMEOUT, APP_NAME};

type DateTimeUtc = DateTime<Utc>;

const JITTER_FACTOR: f64 = 1.2;

const METRIC_IS_LEADER: &str = "pg_upgrade_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "pg_upgrade_num_leadership_changes";

/// The leadership state of this agent.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This agent holds the lease.
    Leading,
    /// Another agent, identified by the encapsulated string, holds the lease.
    Following(String),
    /// The lease state is unknown, or the elector is starting or stopping.
    Standby,
}

impl LeaderState {
    /// Compute the state following the observation of a lease held by `holder`.
    ///
    /// Returns `None` when the observation does not change the state.
    pub fn next(&self, holder: &str, identity: &str) -> Option<LeaderState> {
        let lease_is_held = holder == identity;
        match self {
            LeaderState::Leading if lease_is_held => None,
            LeaderState::Following(id) if id == holder => None,
            LeaderState::Following(_) | LeaderState::Standby if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Leading | LeaderState::Following(_) | LeaderState::Standby => Some(LeaderState::Following(holder.into())),
        }
    }
}

/// Leader election parameters.
#[derive(Debug)]
pub struct LeaderElectionConfig {
    /// The name of the lease object.
    name: String,
    /// The namespace of the lease object.
    namespace: String,
    /// The identity recorded in the lease when it is acquired; the agent's pod name.
    identity: String,
    /// How long candidates wait without observing a lease change before taking over.
    lease_duration: Duration,
    /// How long the holder waits between lease renewals.
    renew_deadline: Duration,
    /// How long to wait before retrying after a failed lease update.
    retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Create a new instance, validating the given durations.
    pub fn new(
        namespace: impl AsRef<str>, name: impl AsRef<str>, identity: String, lease_duration: Duration, renew_deadline: Duration,
        retry_period: Duration,
    ) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(
            renew_deadline > Duration::seconds((JITTER_FACTOR * retry_period.num_seconds() as f64) as i64),
            "renew_deadline must be greater than retry_period*{}",
            JITTER_FACTOR,
        );
        ensure!(lease_duration.num_seconds() >= 1, "lease_duration must be at least 1 second");
        ensure!(renew_deadline.num_seconds() >= 1, "renew_deadline must be at least 1 second");
        ensure!(retry_period.num_seconds() >= 1, "retry_period must be at least 1 second");
        Ok(Self {
            name: name.as_ref().to_string(),
            namespace: namespace.as_ref().to_string(),
            identity,
            lease_duration,
            renew_deadline,
            retry_period,
        })
    }

    /// The lease which this agent creates when none exists yet.
    fn initial_lease(&self, statefulset: &str) -> Lease {
        let now = Utc::now();
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(btreemap! {
                    "app.kubernetes.io/name".into() => statefulset.into(),
                    "app.kubernetes.io/managed-by".into() => APP_NAME.into(),
                }),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                acquire_time: Some(MicroTime(now)),
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.num_seconds() as i32),
                lease_transitions: Some(0),
                renew_time: Some(MicroTime(now)),
            }),
        }
    }
}

/// A task which acquires and maintains the cluster's upgrade lease.
pub struct LeaderElector {
    /// An K8s API wrapper around the client.
    api: Api<Lease>,
    /// Leader election config.
    config: LeaderElectionConfig,
    /// Sender for the current leadership state.
    state_tx: watch::Sender<LeaderState>,
    /// The last published leadership state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,

    /// The last observed lease.
    last_observed_lease: Lease,
    /// The last time a change was observed on the lease.
    last_observed_change: DateTimeUtc,
}

impl LeaderElector {
    /// Create a new instance along with a receiver of leadership state changes.
    pub fn new(
        config: LeaderElectionConfig, statefulset: &str, client: Client, shutdown: broadcast::Receiver<()>,
    ) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes among the upgrade agents");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this agent is the upgrade leader, where 1.0 indicates leadership"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            LeaderElector {
                api: Api::namespaced(client, &config.namespace),
                last_observed_lease: config.initial_lease(statefulset),
                last_observed_change: Utc::now(),
                config,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(lease = %self.config.name, "leader elector task started");

        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = ?err, "error attempting to acquire/renew lease");
        }

        let lease_watcher = watcher(
            self.api.clone(),
            ListParams {
                field_selector: Some(format!("metadata.name={}", self.config.name)),
                ..Default::default()
            },
        );
        tokio::pin!(lease_watcher);

        loop {
            let delay_duration = self.next_acquire_renew_delay();
            tracing::debug!("delaying for {}s", delay_duration.as_secs());
            let delay = tokio::time::sleep(delay_duration);
            tokio::pin!(delay);
            tokio::select! {
                Some(lease_change_res) = lease_watcher.next() => self.handle_lease_watcher_change(lease_change_res),
                _ = &mut delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                        if !matches!(&self.state, LeaderState::Standby) {
                            self.set_state(LeaderState::Standby);
                        }
                        // Retry after the retry period rather than a full lease duration.
                        self.last_observed_change = Utc::now() - self.config.lease_duration + self.config.retry_period;
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        // Step down so that peers do not act on a stale leadership view.
        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    #[tracing::instrument(level = "debug", skip(self, res))]
    fn handle_lease_watcher_change(&mut self, res: WatcherResult<Event<Lease>>) {
        let lease = match res {
            Ok(Event::Applied(lease)) => lease,
            Ok(Event::Restarted(mut leases)) => match leases.pop() {
                Some(lease) => lease,
                None => return,
            },
            Ok(Event::Deleted(_)) => return,
            Err(err) => {
                tracing::error!(error = ?err, "error from lease watcher stream");
                return;
            }
        };
        if lease != self.last_observed_lease {
            tracing::debug!("lease update observed from watcher stream");
            self.last_observed_change = Utc::now();
            self.update_lease_from_api(lease);
        }
    }

    /// Ensure that the lease exists, refreshing the observed lease.
    async fn ensure_lease(&mut self) -> Result<()> {
        let now = Utc::now();
        let lease_opt = timeout(API_TIMEOUT, self.api.get(&self.config.name))
            .await
            .context("timeout fetching lease")
            .map(not_found_as_none)?
            .context("error fetching lease")?;
        if let Some(lease) = lease_opt {
            if self.last_observed_lease != lease {
                self.last_observed_change = now;
                self.update_lease_from_api(lease);
            }
            return Ok(());
        }

        let lease = timeout(API_TIMEOUT, self.api.create(&Default::default(), &self.last_observed_lease))
            .await
            .context("timeout creating lease")?
            .context("error creating lease")?;
        self.last_observed_change = now;
        self.update_lease_from_api(lease);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        self.ensure_lease().await.context("error ensuring lease exists")?;

        // Nothing to do while following a leader whose lease has not expired.
        let now = Utc::now();
        let deadline_as_follower = self.last_observed_change + self.config.lease_duration;
        if let LeaderState::Following(holder) = &self.state {
            if deadline_as_follower > now {
                tracing::debug!(%holder, "upgrade lease is held and has not yet expired");
                return Ok(());
            }
        }

        let mut lease = self.last_observed_lease.clone();
        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.lease_duration_seconds = Some(self.config.lease_duration.num_seconds() as i32);
        spec.renew_time = Some(MicroTime(now));
        if !matches!(self.state, LeaderState::Leading) {
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.map(|val| val + 1).unwrap_or(0));
        }
        lease.metadata.managed_fields = None;

        // The server still rejects the apply if the observed resource version is stale.
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let lease = timeout(API_TIMEOUT, self.api.patch(&self.config.name, &params, &Patch::Apply(lease)))
            .await
            .context("timeout while updating lease")?
            .context("error updating lease")?;
        self.last_observed_change = now;
        self.update_lease_from_api(lease);
        Ok(())
    }

    /// Record the lease as observed from the API, publishing any change of leadership.
    fn update_lease_from_api(&mut self, lease: Lease) {
        self.last_observed_lease = lease;
        let holder = match self.last_observed_lease.spec.as_ref() {
            Some(spec) => {
                if let Some(transitions) = spec.lease_transitions {
                    metrics::gauge!(METRIC_LEADERSHIP_CHANGE, transitions as f64);
                }
                spec.holder_identity.clone().unwrap_or_default()
            }
            None => String::new(),
        };
        if let Some(state) = self.state.next(&holder, &self.config.identity) {
            tracing::info!(?state, "upgrade leadership changed");
            self.set_state(state);
        }
    }

    fn next_acquire_renew_delay(&self) -> std::time::Duration {
        let addend = match &self.state {
            LeaderState::Leading => self.config.renew_deadline,
            _ => self.config.lease_duration,
        };
        (self.last_observed_change + addend - Utc::now())
            .to_std()
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
    }

    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        metrics::gauge!(METRIC_IS_LEADER, if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 });
    }
}
