use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::{ConfigMapPeerStore, Controller, LeaderElectionConfig, LeaderElector, PatroniDcs, StatefulSetPartition, LEASE_RETRY_SECONDS};
use crate::render::TagsFileRenderer;
use crate::server::spawn_http_server;
use crate::upgrade::UpgradeCoordinator;

/// The application object of the upgrade agent.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the leader elector.
    elector: JoinHandle<()>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Spawn the leader elector.
        let elect_config = LeaderElectionConfig::new(
            &config.namespace,
            config.lease_name(),
            config.pod_name.clone(),
            chrono::Duration::seconds(config.lease_duration_seconds as i64),
            chrono::Duration::seconds(config.lease_renew_seconds as i64),
            chrono::Duration::seconds(LEASE_RETRY_SECONDS),
        )
        .context("invalid lease coordination config")?;
        let (elector, leader_rx) = LeaderElector::new(elect_config, &config.statefulset, client.clone(), shutdown_tx.subscribe());
        let elector = elector.spawn();

        // Build the coordinator over its K8s backed interfaces.
        let unit = config.unit();
        let topology = Arc::new(PatroniDcs::new(
            client.clone(),
            &config.namespace,
            config.patroni_scope(),
            unit.app(),
            config.switchover_timeout(),
        ));
        let cluster = Arc::new(StatefulSetPartition::new(client.clone(), &config.namespace, &config.statefulset));
        let peers = Arc::new(ConfigMapPeerStore::new(client.clone(), &config.namespace, config.peer_state_configmap()));
        let renderer = Arc::new(TagsFileRenderer::new(&config.sync_tags_path));
        let coordinator = UpgradeCoordinator::new(unit, topology, cluster, peers.clone(), renderer, leader_rx.clone());

        // Spawn the controller & the HTTP server which feeds it operator actions.
        let (actions_tx, actions_rx) = mpsc::channel(10);
        let controller = Controller::new(client, config.clone(), coordinator, peers, leader_rx, actions_rx, shutdown_tx.subscribe()).spawn();
        let server = spawn_http_server(config, metrics, actions_tx, shutdown_tx.subscribe());

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            elector,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("upgrade agent is shutting down");
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }
        if let Err(err) = self.elector.await {
            tracing::error!(error = ?err, "error joining leader elector handle");
        }

        tracing::debug!("upgrade agent shutdown complete");
        Ok(())
    }
}
