//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::unit::Unit;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The agent's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for operator actions, healthchecks & metrics.
    pub http_port: u16,

    /// The Kubernetes namespace of the cluster.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,
    /// The name of the StatefulSet to which this pod belongs, also the cluster's app name.
    pub statefulset: String,
    /// The ordinal of this pod within its StatefulSet.
    ///
    /// This value is derived from the `pod_name` value.
    #[serde(skip, default)]
    pub ordinal: u32,

    /// Patroni's cluster scope, which defaults to the StatefulSet name.
    #[serde(default)]
    pub patroni_scope: Option<String>,
    /// The name of the ConfigMap used as the peer state bus.
    #[serde(default)]
    pub peer_state_configmap: Option<String>,
    /// The name of the pod container running the database.
    #[serde(default = "Config::default_workload_container")]
    pub workload_container: String,

    /// The duration in seconds for which the upgrade lease is considered held.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: u32,
    /// The duration in seconds between renewals of the upgrade lease by its holder.
    #[serde(default = "Config::default_lease_renew_seconds")]
    pub lease_renew_seconds: u32,
    /// The duration in seconds to wait for a switchover to take effect.
    #[serde(default = "Config::default_switchover_timeout_seconds")]
    pub switchover_timeout_seconds: u64,

    /// The path of the rendered Patroni tags file.
    #[serde(default = "Config::default_sync_tags_path")]
    pub sync_tags_path: String,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.with_derived_fields()
    }

    /// Derive the fields which are not given directly by the environment.
    pub(crate) fn with_derived_fields(mut self) -> Result<Self> {
        let unit = Unit::from_pod_name(&self.statefulset, &self.pod_name).context("invalid pod name, expected `{statefulset}-{ordinal}`")?;
        self.ordinal = unit.ordinal();
        Ok(self)
    }

    /// The unit on which this instance is running.
    pub fn unit(&self) -> Unit {
        Unit::new(self.statefulset.clone(), self.ordinal)
    }

    /// Patroni's cluster scope.
    pub fn patroni_scope(&self) -> &str {
        self.patroni_scope.as_deref().unwrap_or(&self.statefulset)
    }

    /// The name of the peer state ConfigMap.
    pub fn peer_state_configmap(&self) -> String {
        self.peer_state_configmap.clone().unwrap_or_else(|| self.lease_name())
    }

    /// The name of the upgrade lease.
    pub fn lease_name(&self) -> String {
        format!("{}-upgrade", self.statefulset)
    }

    /// The duration to wait for a switchover to take effect.
    pub fn switchover_timeout(&self) -> Duration {
        Duration::from_secs(self.switchover_timeout_seconds)
    }

    fn default_workload_container() -> String {
        "postgresql".into()
    }

    fn default_lease_duration_seconds() -> u32 {
        15
    }

    fn default_lease_renew_seconds() -> u32 {
        10
    }

    fn default_switchover_timeout_seconds() -> u64 {
        60
    }

    fn default_sync_tags_path() -> String {
        "/var/lib/pg-upgrade-agent/tags.yml".into()
    }
}
