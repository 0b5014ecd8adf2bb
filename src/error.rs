//! Upgrade error abstractions.

use thiserror::Error;

/// Upgrade error variants.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The cluster is not in a state from which an upgrade may safely begin.
    #[error("cluster not ready for upgrade: {code}")]
    ClusterNotReady {
        /// A machine readable reason.
        code: String,
        /// An instruction for the operator.
        operator_hint: String,
    },
    /// The replication manager rejected a switchover, or it did not complete in time.
    #[error("switchover failed: {0}")]
    SwitchoverFailed(String),
    /// The orchestrator API could not be reached, or rejected the request.
    #[error("orchestrator unavailable: {0:#}")]
    OrchestratorUnavailable(anyhow::Error),
    /// The replication topology could not be queried.
    #[error("replication topology unavailable: {0:#}")]
    TopologyUnavailable(anyhow::Error),
    /// The peer state could not be written.
    #[error("peer state unavailable: {0:#}")]
    PeerStateUnavailable(anyhow::Error),
    /// The unit's configuration could not be rendered.
    #[error("error rendering configuration: {0:#}")]
    RenderFailed(anyhow::Error),
}

impl UpgradeError {
    /// Construct a `ClusterNotReady` error.
    pub fn not_ready(code: impl Into<String>, operator_hint: impl Into<String>) -> Self {
        Self::ClusterNotReady {
            code: code.into(),
            operator_hint: operator_hint.into(),
        }
    }
}

/// A result type where the error is an `UpgradeError`.
pub type UpgradeResult<T> = ::std::result::Result<T, UpgradeError>;

/// The failure of an operator action.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct ActionFailed {
    /// A human readable reason.
    pub message: String,
    /// An optional instruction for the operator.
    pub hint: Option<String>,
}

impl ActionFailed {
    /// Create a new instance without an operator hint.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), hint: None }
    }
}

impl From<UpgradeError> for ActionFailed {
    fn from(err: UpgradeError) -> Self {
        match err {
            UpgradeError::ClusterNotReady { code, operator_hint } => Self {
                message: code,
                hint: Some(operator_hint),
            },
            other => Self::new(other.to_string()),
        }
    }
}

/// A result type used for operator actions.
pub type ActionResult = ::std::result::Result<String, ActionFailed>;
