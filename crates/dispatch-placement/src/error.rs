//! Placement error types.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Which part of the fleet a failed selection was scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostScope {
    /// General selection over every non-dedicated host.
    Fleet,
    /// Selection restricted to a project's dedicated hosts.
    Dedicated(BTreeSet<String>),
}

impl HostScope {
    pub fn from_dedicated(dedicated: &BTreeSet<String>) -> Self {
        if dedicated.is_empty() {
            Self::Fleet
        } else {
            Self::Dedicated(dedicated.clone())
        }
    }
}

impl fmt::Display for HostScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fleet => f.write_str("in the fleet, please wait a moment and try again"),
            Self::Dedicated(ips) => {
                let ips: Vec<&str> = ips.iter().map(String::as_str).collect();
                write!(f, "in dedicated set [{}]", ips.join(", "))
            }
        }
    }
}

/// Errors that can occur while placing a build.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no available build host {scope}")]
    NoAvailableHost { scope: HostScope },

    #[error("concurrency pool exhausted for {pipeline_id}/{stage_id}")]
    PoolExhausted { pipeline_id: String, stage_id: String },

    #[error("lock contention on {key}")]
    LockContention { key: String },

    #[error("invalid load config: {0}")]
    InvalidConfig(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] dispatch_state::StateError),
}

impl DispatchError {
    /// Whether the caller may retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableHost { .. } | Self::PoolExhausted { .. } | Self::LockContention { .. }
        )
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
