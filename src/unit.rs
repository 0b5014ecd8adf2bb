//! Cluster member identity.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};

/// A single member of the cluster, identified by its application name and its ordinal.
///
/// The canonical display form is `{app}/{ordinal}`. The pod backing a unit, as well as the
/// replication manager's member, is named `{app}-{ordinal}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Unit {
    app: String,
    ordinal: u32,
}

impl Unit {
    /// Create a new instance.
    pub fn new(app: impl Into<String>, ordinal: u32) -> Self {
        Self { app: app.into(), ordinal }
    }

    /// Parse a unit from the name of the pod which backs it.
    ///
    /// The application name is required, as it may itself contain `-`.
    pub fn from_pod_name(app: &str, pod_name: &str) -> Result<Self> {
        let ordinal = pod_name
            .strip_prefix(app)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|ordinal| ordinal.parse().ok())
            .with_context(|| format!("invalid pod name {:?}, expected {}-<ordinal>", pod_name, app))?;
        Ok(Self::new(app, ordinal))
    }

    /// The application this unit belongs to.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// The ordinal of this unit.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// The unit of the same application with the given ordinal.
    pub fn with_ordinal(&self, ordinal: u32) -> Self {
        Self::new(self.app.clone(), ordinal)
    }

    /// The ordinal-0 unit of this unit's application, which is always upgraded last.
    pub fn unit_zero(&self) -> Self {
        self.with_ordinal(0)
    }

    /// Check if this is the ordinal-0 unit.
    pub fn is_unit_zero(&self) -> bool {
        self.ordinal == 0
    }

    /// The name of the pod backing this unit.
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.app, self.ordinal)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.ordinal)
    }
}

impl FromStr for Unit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (app, ordinal) = s.rsplit_once('/').with_context(|| format!("invalid unit name {:?}, expected <app>/<ordinal>", s))?;
        anyhow::ensure!(!app.is_empty(), "invalid unit name {:?}, empty application name", s);
        let ordinal = ordinal
            .parse()
            .with_context(|| format!("invalid unit name {:?}, ordinal must be a non-negative integer", s))?;
        Ok(Self::new(app, ordinal))
    }
}
