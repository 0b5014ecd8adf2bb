//! In-memory collaborators used to exercise the coordinator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::watch;

use super::{ClusterController, ConfigRenderer, PeerField, PeerState, PeerStore, ReplicationTopology, UpgradeCoordinator};
use crate::error::{UpgradeError, UpgradeResult};
use crate::k8s::LeaderState;
use crate::unit::Unit;

pub const APP: &str = "postgresql-k8s";

/// Shorthand for a unit of the test application.
pub fn unit(ordinal: u32) -> Unit {
    Unit::new(APP, ordinal)
}

#[derive(Default)]
pub struct FakeTopology {
    pub initialised: Mutex<bool>,
    pub started: Mutex<bool>,
    pub primary: Mutex<Option<Unit>>,
    pub sync_standbys: Mutex<Vec<Unit>>,
    pub switchover_error: Mutex<Option<String>>,
    pub switchovers: Mutex<Vec<Option<Unit>>>,
}

impl FakeTopology {
    pub fn new(primary: u32, sync_standbys: &[u32]) -> Self {
        Self {
            initialised: Mutex::new(true),
            started: Mutex::new(true),
            primary: Mutex::new(Some(unit(primary))),
            sync_standbys: Mutex::new(sync_standbys.iter().copied().map(unit).collect()),
            ..Default::default()
        }
    }

    pub fn switchovers(&self) -> Vec<Option<Unit>> {
        self.switchovers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicationTopology for FakeTopology {
    async fn is_cluster_initialised(&self) -> UpgradeResult<bool> {
        Ok(*self.initialised.lock().unwrap())
    }

    async fn member_started(&self, _unit: &Unit) -> UpgradeResult<bool> {
        Ok(*self.started.lock().unwrap())
    }

    async fn get_primary(&self) -> UpgradeResult<Unit> {
        self.primary
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| UpgradeError::TopologyUnavailable(anyhow!("no primary")))
    }

    async fn get_sync_standby_names(&self) -> UpgradeResult<Vec<Unit>> {
        Ok(self.sync_standbys.lock().unwrap().clone())
    }

    async fn switchover(&self, candidate: Option<&Unit>) -> UpgradeResult<()> {
        self.switchovers.lock().unwrap().push(candidate.cloned());
        if let Some(reason) = self.switchover_error.lock().unwrap().clone() {
            return Err(UpgradeError::SwitchoverFailed(reason));
        }
        let mut sync_standbys = self.sync_standbys.lock().unwrap();
        let new_primary = match candidate {
            Some(candidate) => candidate.clone(),
            None => sync_standbys.first().cloned().unwrap_or_else(|| unit(0)),
        };
        sync_standbys.retain(|unit| unit != &new_primary);
        *self.primary.lock().unwrap() = Some(new_primary);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCluster {
    pub planned_units: Mutex<u32>,
    pub partition: Mutex<u32>,
    pub unavailable: Mutex<bool>,
    pub writes: Mutex<Vec<u32>>,
}

impl FakeCluster {
    pub fn new(planned_units: u32, partition: u32) -> Self {
        Self {
            planned_units: Mutex::new(planned_units),
            partition: Mutex::new(partition),
            ..Default::default()
        }
    }

    pub fn partition(&self) -> u32 {
        *self.partition.lock().unwrap()
    }

    pub fn writes(&self) -> Vec<u32> {
        self.writes.lock().unwrap().clone()
    }

    fn check_available(&self) -> UpgradeResult<()> {
        if *self.unavailable.lock().unwrap() {
            return Err(UpgradeError::OrchestratorUnavailable(anyhow!("connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterController for FakeCluster {
    async fn planned_units(&self) -> UpgradeResult<u32> {
        Ok(*self.planned_units.lock().unwrap())
    }

    async fn get_partition(&self) -> UpgradeResult<u32> {
        self.check_available()?;
        Ok(self.partition())
    }

    async fn set_partition(&self, partition: u32) -> UpgradeResult<()> {
        self.check_available()?;
        *self.partition.lock().unwrap() = partition;
        self.writes.lock().unwrap().push(partition);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeers {
    pub state: Mutex<Option<Arc<PeerState>>>,
    pub writes: Mutex<Vec<(PeerField, String)>>,
}

impl FakePeers {
    /// A bus which is available, holding the given raw data.
    pub fn with_data(data: &[(&str, &str)]) -> Self {
        let data: BTreeMap<String, String> = data.iter().map(|(key, val)| (key.to_string(), val.to_string())).collect();
        Self {
            state: Mutex::new(Some(Arc::new(PeerState::from_data(data)))),
            ..Default::default()
        }
    }

    /// A bus which has not been observed yet.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(PeerField, String)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn current(&self) -> Option<Arc<PeerState>> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerStore for FakePeers {
    fn snapshot(&self) -> Option<Arc<PeerState>> {
        self.current()
    }

    async fn write(&self, updates: &[(PeerField, String)]) -> UpgradeResult<()> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .clone()
            .ok_or_else(|| UpgradeError::PeerStateUnavailable(anyhow!("peer state does not exist")))?;
        *state = Some(Arc::new(current.with_updates(updates)));
        self.writes.lock().unwrap().extend(updates.iter().cloned());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRenderer {
    pub rendered: Mutex<Vec<bool>>,
}

#[async_trait]
impl ConfigRenderer for FakeRenderer {
    async fn update_config(&self, no_sync: bool) -> Result<()> {
        self.rendered.lock().unwrap().push(no_sync);
        Ok(())
    }
}

/// A coordinator wired to in-memory collaborators.
pub struct Harness {
    pub coordinator: UpgradeCoordinator,
    pub topology: Arc<FakeTopology>,
    pub cluster: Arc<FakeCluster>,
    pub peers: Arc<FakePeers>,
    pub renderer: Arc<FakeRenderer>,
    pub leader_tx: watch::Sender<LeaderState>,
}

impl Harness {
    pub fn new(ordinal: u32, topology: FakeTopology, cluster: FakeCluster, peers: FakePeers, leader: LeaderState) -> Self {
        let (topology, cluster, peers) = (Arc::new(topology), Arc::new(cluster), Arc::new(peers));
        let renderer = Arc::new(FakeRenderer::default());
        let (leader_tx, leader_rx) = watch::channel(leader);
        let coordinator = UpgradeCoordinator::new(unit(ordinal), topology.clone(), cluster.clone(), peers.clone(), renderer.clone(), leader_rx);
        Self {
            coordinator,
            topology,
            cluster,
            peers,
            renderer,
            leader_tx,
        }
    }
}
