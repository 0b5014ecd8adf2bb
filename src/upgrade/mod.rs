//! Upgrade coordination.
//!
//! ## Overview
//! Units of the cluster are replaced by the orchestrator in descending ordinal order, gated by
//! the StatefulSet's rolling update partition: only units with an ordinal `>=` the partition
//! are replaced. The upgrade begins with the partition at the highest ordinal, and every unit
//! which finishes its upgrade lowers the partition by one, releasing the next unit.
//!
//! Unit 0 is always upgraded last. The pre-upgrade check therefore ensures that the primary
//! is never abruptly terminated: either it already is unit 0, or a controlled switchover is
//! performed before the first unit is replaced.
//!
//! While units restart, the replication manager must never lose its synchronous standby. A
//! replaced unit only reports itself as completed once it is the first synchronous standby (or
//! once the synchronous standby placement no longer matters), and the leader publishes the
//! lowest ordinal which must remain a synchronous standby so that every unit can independently
//! exclude itself from candidacy.
//!
//! ## Events
//! Every unit runs its own coordinator, which processes the events below one at a time. A
//! handler may defer an event when its preconditions do not hold yet, in which case the event
//! is delivered again later. All handlers are idempotent under redelivery.

#[cfg(test)]
mod fixtures;
mod state;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{ActionFailed, ActionResult, UpgradeError, UpgradeResult};
use crate::k8s::LeaderState;
use crate::unit::Unit;
pub use state::{PeerField, PeerState, Scope, UnitUpgradeState};

const METRIC_PARTITION: &str = "pg_upgrade_rolling_update_partition";
const METRIC_UNITS_FAILED: &str = "pg_upgrade_units_failed";

/// Read only queries against the replication manager, plus controlled switchovers.
#[async_trait]
pub trait ReplicationTopology: Send + Sync {
    /// Check if the cluster has completed its bootstrap.
    async fn is_cluster_initialised(&self) -> UpgradeResult<bool>;

    /// Check if the replication manager agent of the given unit has started.
    async fn member_started(&self, unit: &Unit) -> UpgradeResult<bool>;

    /// The unit which currently holds the primary role.
    async fn get_primary(&self) -> UpgradeResult<Unit>;

    /// The ordered list of synchronous standbys of the current primary, highest priority first.
    async fn get_sync_standby_names(&self) -> UpgradeResult<Vec<Unit>>;

    /// Perform a switchover to the given candidate, or to any synchronous standby.
    ///
    /// Fails with `UpgradeError::SwitchoverFailed` if the switchover was rejected or did not
    /// complete in time.
    async fn switchover(&self, candidate: Option<&Unit>) -> UpgradeResult<()>;
}

/// Access to the orchestrator's rolling update partition.
#[async_trait]
pub trait ClusterController: Send + Sync {
    /// The number of units the cluster is planned to have.
    async fn planned_units(&self) -> UpgradeResult<u32>;

    /// The current rolling update partition.
    async fn get_partition(&self) -> UpgradeResult<u32>;

    /// Set the rolling update partition.
    async fn set_partition(&self, partition: u32) -> UpgradeResult<()>;
}

/// The shared peer state bus.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// The latest known snapshot, or `None` if the bus is not available yet.
    fn snapshot(&self) -> Option<Arc<PeerState>>;

    /// Write the given fields in a single update.
    async fn write(&self, updates: &[(PeerField, String)]) -> UpgradeResult<()>;
}

/// Renders the parts of the unit's database configuration which depend on the upgrade.
#[async_trait]
pub trait ConfigRenderer: Send + Sync {
    /// Update the configuration, excluding this unit from synchronous standby candidacy if needed.
    async fn update_config(&self, no_sync: bool) -> Result<()>;
}

/// An event handled by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum UpgradeEvent {
    /// This unit's workload was observed running at the given revision.
    RevisionObserved(String),
    /// This unit's workload has become ready.
    WorkloadReady,
    /// The shared peer state has changed.
    PeerStateChanged,
    /// This unit has completed its upgrade.
    UnitFinished,
}

/// The outcome of handling an event.
#[derive(Clone, Debug, PartialEq)]
pub enum Handled {
    /// The event was handled and changed state.
    Done,
    /// The event was not relevant for the current state.
    Ignored,
    /// The event's preconditions do not hold yet, and it must be delivered again later.
    Deferred(&'static str),
}

/// The upgrade coordination state machine of a single unit.
pub struct UpgradeCoordinator {
    /// The unit on which this coordinator is running.
    unit: Unit,
    /// The replication manager.
    topology: Arc<dyn ReplicationTopology>,
    /// The orchestrator.
    cluster: Arc<dyn ClusterController>,
    /// The peer state bus.
    peers: Arc<dyn PeerStore>,
    /// The configuration renderer.
    renderer: Arc<dyn ConfigRenderer>,
    /// The current leader election state.
    leader: watch::Receiver<LeaderState>,
}

impl UpgradeCoordinator {
    /// Create a new instance.
    pub fn new(
        unit: Unit, topology: Arc<dyn ReplicationTopology>, cluster: Arc<dyn ClusterController>, peers: Arc<dyn PeerStore>,
        renderer: Arc<dyn ConfigRenderer>, leader: watch::Receiver<LeaderState>,
    ) -> Self {
        metrics::register_gauge!(METRIC_PARTITION, metrics::Unit::Count, "the last rolling update partition written by this unit");
        metrics::register_counter!(METRIC_UNITS_FAILED, metrics::Unit::Count, "the number of upgrades which this unit has marked as failed");
        Self {
            unit,
            topology,
            cluster,
            peers,
            renderer,
            leader,
        }
    }

    /// The unit on which this coordinator is running.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Dispatch the given event to its handler.
    pub async fn handle(&self, event: &UpgradeEvent) -> UpgradeResult<Handled> {
        match event {
            UpgradeEvent::RevisionObserved(revision) => self.on_revision_observed(revision).await,
            UpgradeEvent::WorkloadReady => self.on_workload_ready().await,
            UpgradeEvent::PeerStateChanged => self.on_peer_state_changed().await,
            UpgradeEvent::UnitFinished => self.on_upgrade_unit_finished().await,
        }
    }

    /// Check that the cluster is healthy enough to upgrade, and set the initial partition.
    ///
    /// Invoked once, cluster-wide, before the upgrade starts.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.unit))]
    pub async fn pre_upgrade_check(&self) -> UpgradeResult<u32> {
        if !self.topology.is_cluster_initialised().await? {
            let message = "cluster has not initialised yet";
            return Err(UpgradeError::not_ready(message, message));
        }

        let unit_zero = self.unit.unit_zero();
        let primary = self.topology.get_primary().await?;
        tracing::debug!(%primary, "pre-upgrade check found primary");
        if primary == unit_zero {
            return self.set_first_partition().await;
        }

        let sync_standbys = self.topology.get_sync_standby_names().await?;
        if sync_standbys.is_empty() {
            return Err(UpgradeError::not_ready(
                "invalid number of sync nodes",
                "wait for the cluster to elect a synchronous standby, then retry",
            ));
        }

        if sync_standbys.contains(&unit_zero) {
            tracing::info!(from = %primary, to = %unit_zero, "switching over to unit zero before upgrading");
            if let Err(err) = self.topology.switchover(Some(&unit_zero)).await {
                return Err(UpgradeError::not_ready(err.to_string(), format!("try to switchover manually to {}", unit_zero)));
            }
            return self.set_first_partition().await;
        }

        // The highest ordinal is replaced first, so it may not remain the primary.
        let planned_units = self.cluster.planned_units().await?;
        if planned_units.checked_sub(1) == Some(primary.ordinal()) {
            tracing::info!(from = %primary, "switching over to any synchronous standby before upgrading");
            if let Err(err) = self.topology.switchover(None).await {
                return Err(UpgradeError::not_ready(err.to_string(), "try to manually switchover to any synchronous standby"));
            }
            return self.set_first_partition().await;
        }

        self.set_first_partition().await
    }

    /// Handle this unit's workload becoming ready after it has been replaced.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.unit))]
    pub async fn on_workload_ready(&self) -> UpgradeResult<Handled> {
        let peers = match self.peers.snapshot() {
            Some(peers) => peers,
            None => return Ok(Handled::Deferred("no upgrade peer state yet")),
        };
        if peers.unit_state(&self.unit) != UnitUpgradeState::Upgrading {
            return Ok(Handled::Ignored);
        }
        if !self.topology.member_started(&self.unit).await? {
            return Ok(Handled::Deferred("replication manager has not started yet"));
        }

        // Make this unit the single synchronous standby before letting the upgrade move on.
        let unit_zero = self.unit.unit_zero();
        let primary = self.topology.get_primary().await?;
        let sync_standbys = self.topology.get_sync_standby_names().await?;
        tracing::debug!(%primary, sync_standbys = ?sync_standbys, "checking synchronous standby placement");
        let is_first_sync_standby = sync_standbys.first().map(|first| first == &self.unit).unwrap_or(true);
        if self.unit != unit_zero && primary != unit_zero && !is_first_sync_standby {
            self.refresh_min_ordinal_sync_standbys().await?;
            return Ok(Handled::Deferred("this unit is not the only synchronous standby yet"));
        }

        self.set_unit_state(UnitUpgradeState::Completed).await?;
        tracing::info!("unit upgrade completed");
        Ok(Handled::Done)
    }

    /// Handle a change of the shared peer state.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.unit))]
    pub async fn on_peer_state_changed(&self) -> UpgradeResult<Handled> {
        if self.peers.snapshot().is_none() {
            return Ok(Handled::Deferred("no upgrade peer state yet"));
        }
        self.refresh_min_ordinal_sync_standbys().await?;

        // Re-read, as the refresh above may have updated the snapshot.
        let no_sync = self.peers.snapshot().map(|peers| peers.is_excluded_from_sync(&self.unit)).unwrap_or(false);
        self.renderer
            .update_config(no_sync)
            .await
            .map_err(UpgradeError::RenderFailed)?;
        Ok(Handled::Done)
    }

    /// Handle the completion of this unit's upgrade by releasing the next unit.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.unit))]
    pub async fn on_upgrade_unit_finished(&self) -> UpgradeResult<Handled> {
        if self.unit.is_unit_zero() {
            tracing::info!("last unit upgraded, upgrade is complete");
            return Ok(Handled::Ignored);
        }

        tracing::debug!("setting rolling update partition to next unit");
        if let Err(err) = self.advance_partition().await {
            tracing::error!(error = ?err, "cannot set rolling update partition");
            metrics::increment_counter!(METRIC_UNITS_FAILED);
            if let Err(err) = self.set_unit_state(UnitUpgradeState::Failed).await {
                tracing::error!(error = ?err, "error marking unit upgrade as failed");
            }
            self.log_rollback_instructions();
        }
        Ok(Handled::Done)
    }

    /// Handle the operator's request to resume a stalled upgrade.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.unit))]
    pub async fn on_resume_upgrade(&self) -> ActionResult {
        match self.advance_partition().await {
            Ok(Some(next)) => Ok(format!("Upgrade will resume on unit {}", self.unit.with_ordinal(next))),
            Ok(None) => Err(ActionFailed::new("Nothing to resume, upgrade stack unset")),
            Err(err) => {
                tracing::error!(error = ?err, "cannot set rolling update partition");
                Err(ActionFailed::new("Cannot set rolling update partition"))
            }
        }
    }

    /// Handle the observation of this unit's workload revision.
    ///
    /// A revision which differs from the recorded one means the orchestrator has replaced
    /// this unit's workload, so its upgrade has begun.
    #[tracing::instrument(level = "debug", skip(self), fields(unit = %self.unit))]
    pub async fn on_revision_observed(&self, revision: &str) -> UpgradeResult<Handled> {
        let peers = match self.peers.snapshot() {
            Some(peers) => peers,
            None => return Ok(Handled::Deferred("no upgrade peer state yet")),
        };
        match peers.unit_revision(&self.unit) {
            Some(recorded) if recorded == revision => Ok(Handled::Ignored),
            None => {
                tracing::debug!(%revision, "recording baseline workload revision");
                self.write_peers(&[(PeerField::UnitRevision(self.unit.clone()), revision.into())]).await?;
                Ok(Handled::Ignored)
            }
            Some(recorded) => {
                tracing::info!(from = %recorded, to = %revision, "workload replaced, unit upgrade started");
                self.write_peers(&[
                    (PeerField::UnitState(self.unit.clone()), UnitUpgradeState::Upgrading.to_string()),
                    (PeerField::UnitRevision(self.unit.clone()), revision.into()),
                ])
                .await?;
                Ok(Handled::Done)
            }
        }
    }

    /// Publish the lowest ordinal which must remain a synchronous standby.
    ///
    /// Only the leader of an initialised cluster of more than two units writes this field,
    /// and only while unit 0 is not the primary.
    pub async fn refresh_min_ordinal_sync_standbys(&self) -> UpgradeResult<()> {
        if !self.is_leader() || !self.topology.is_cluster_initialised().await? {
            return Ok(());
        }
        if self.cluster.planned_units().await? <= 2 {
            return Ok(());
        }
        let primary = self.topology.get_primary().await?;
        if primary.is_unit_zero() {
            return Ok(());
        }

        let partition = self.cluster.get_partition().await?;
        tracing::debug!(partition, "updating min ordinal sync standbys");
        self.write_peers(&[(PeerField::MinOrdinalSyncStandbys, partition.to_string())]).await
    }

    /// Log the manual steps needed to roll the upgrade back.
    pub fn log_rollback_instructions(&self) {
        tracing::info!("Run `kubectl rollout undo statefulset/{}` to rollback", self.unit.app());
        tracing::info!("and run the `resume-upgrade` action on the leader to finish the rollback");
    }

    /// Check if this unit is the elected leader.
    fn is_leader(&self) -> bool {
        matches!(*self.leader.borrow(), LeaderState::Leading)
    }

    /// Record this unit's upgrade state.
    async fn set_unit_state(&self, state: UnitUpgradeState) -> UpgradeResult<()> {
        self.write_peers(&[(PeerField::UnitState(self.unit.clone()), state.to_string())]).await
    }

    /// Write the given peer state fields, dropping cluster scoped fields unless leading.
    async fn write_peers(&self, updates: &[(PeerField, String)]) -> UpgradeResult<()> {
        let leading = self.is_leader();
        let updates: Vec<_> = updates
            .iter()
            .filter(|(field, _)| leading || field.scope() != Scope::Cluster)
            .cloned()
            .collect();
        if updates.is_empty() {
            tracing::debug!("not leading, skipping cluster scoped peer state write");
            return Ok(());
        }
        self.peers.write(&updates).await
    }

    /// Set the partition to the highest ordinal, releasing the first unit.
    async fn set_first_partition(&self) -> UpgradeResult<u32> {
        let partition = self.cluster.planned_units().await?.saturating_sub(1);
        self.set_partition(partition).await?;
        Ok(partition)
    }

    /// Lower the partition by one, returning the new partition, or `None` if it already is 0.
    async fn advance_partition(&self) -> UpgradeResult<Option<u32>> {
        let current = self.cluster.get_partition().await?;
        match current.checked_sub(1) {
            Some(next) => {
                self.set_partition(next).await?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    async fn set_partition(&self, partition: u32) -> UpgradeResult<()> {
        tracing::info!(partition, "setting rolling update partition");
        self.cluster.set_partition(partition).await?;
        metrics::gauge!(METRIC_PARTITION, partition as f64);
        Ok(())
    }
}
