//! Peer state schema.
//!
//! The peer state is a flat string mapping replicated to all units. Each field has a scope:
//!
//! - cluster scope fields are written only by the elected leader;
//! - unit scope fields are written only by the unit they belong to.
//!
//! The store does not enforce these rules, the coordinator does.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::unit::Unit;

/// The key of the lowest ordinal which must remain a synchronous standby.
pub const KEY_MIN_ORDINAL_SYNC_STANDBYS: &str = "cluster.min-ordinal-sync-standbys";
/// The key prefix of all unit scope fields.
const PREFIX_UNIT: &str = "unit.";
/// The key suffix of the unit upgrade state field.
const SUFFIX_STATE: &str = ".state";
/// The key suffix of the unit revision field.
const SUFFIX_REVISION: &str = ".revision";

/// The write scope of a peer state field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Unit,
}

/// A typed field of the peer state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerField {
    /// The lowest ordinal which must remain a synchronous standby during the upgrade.
    MinOrdinalSyncStandbys,
    /// The upgrade state of the given unit.
    UnitState(Unit),
    /// The workload revision which the given unit's upgrade state refers to.
    UnitRevision(Unit),
}

impl PeerField {
    /// The write scope of this field.
    pub fn scope(&self) -> Scope {
        match self {
            Self::MinOrdinalSyncStandbys => Scope::Cluster,
            Self::UnitState(_) | Self::UnitRevision(_) => Scope::Unit,
        }
    }

    /// The key of this field in the underlying mapping.
    pub fn key(&self) -> String {
        match self {
            Self::MinOrdinalSyncStandbys => KEY_MIN_ORDINAL_SYNC_STANDBYS.into(),
            Self::UnitState(unit) => format!("{}{}{}", PREFIX_UNIT, unit.pod_name(), SUFFIX_STATE),
            Self::UnitRevision(unit) => format!("{}{}{}", PREFIX_UNIT, unit.pod_name(), SUFFIX_REVISION),
        }
    }
}

/// The upgrade state of a single unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitUpgradeState {
    NotStarted,
    Upgrading,
    Completed,
    Failed,
}

impl Default for UnitUpgradeState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl UnitUpgradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Upgrading => "upgrading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitUpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitUpgradeState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "not-started" => Self::NotStarted,
            "upgrading" => Self::Upgrading,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => bail!("unknown unit upgrade state {:?}", s),
        })
    }
}

/// A snapshot of the peer state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerState {
    data: BTreeMap<String, String>,
}

impl PeerState {
    /// Create a new instance from the raw mapping.
    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }

    /// The raw mapping backing this snapshot.
    #[cfg(test)]
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// The lowest ordinal which must remain a synchronous standby, defaulting to 0.
    pub fn min_ordinal_sync_standbys(&self) -> u32 {
        match self.data.get(KEY_MIN_ORDINAL_SYNC_STANDBYS) {
            None => 0,
            Some(val) => val.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %val, "ignoring unparsable {}", KEY_MIN_ORDINAL_SYNC_STANDBYS);
                0
            }),
        }
    }

    /// The recorded upgrade state of the given unit, defaulting to `NotStarted`.
    pub fn unit_state(&self, unit: &Unit) -> UnitUpgradeState {
        let key = PeerField::UnitState(unit.clone()).key();
        match self.data.get(&key) {
            None => UnitUpgradeState::default(),
            Some(val) => val.parse().unwrap_or_else(|err| {
                tracing::warn!(error = ?err, %unit, "ignoring unparsable unit state");
                UnitUpgradeState::default()
            }),
        }
    }

    /// The recorded workload revision of the given unit, if any.
    pub fn unit_revision(&self, unit: &Unit) -> Option<&str> {
        self.data
            .get(&PeerField::UnitRevision(unit.clone()).key())
            .map(String::as_str)
            .filter(|rev| !rev.is_empty())
    }

    /// Check if the given unit must be excluded from synchronous standby candidacy.
    pub fn is_excluded_from_sync(&self, unit: &Unit) -> bool {
        unit.ordinal() < self.min_ordinal_sync_standbys()
    }

    /// A copy of this snapshot with the given field updates applied.
    #[cfg(test)]
    pub fn with_updates(&self, updates: &[(PeerField, String)]) -> Self {
        let mut data = self.data.clone();
        for (field, val) in updates {
            data.insert(field.key(), val.clone());
        }
        Self { data }
    }
}
