//! Remote hosts the orchestrator configures

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Last observed reachability of a remote target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    /// Never checked
    #[default]
    Unknown,
    /// Last check succeeded
    Reachable,
    /// Last probing window ended without a success
    Unreachable,
}

/// Role of a host in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs the control plane; exactly one is designated per bootstrap
    ControlPlane,
    /// Joins the cluster as a worker
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::ControlPlane => f.write_str("control-plane"),
            NodeRole::Worker => f.write_str("worker"),
        }
    }
}

/// A remote host reached over ssh.
///
/// `reachability` is written only by the readiness poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Inventory name (what the configuration engine calls this host)
    pub name: String,
    /// Address ssh connects to
    pub address: String,
    /// Remote login user
    pub user: String,
    /// ssh port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Identity file used for authentication
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Cluster role
    pub role: NodeRole,
    /// Last observed reachability
    #[serde(skip)]
    pub reachability: Reachability,
}

fn default_ssh_port() -> u16 {
    22
}

impl RemoteTarget {
    /// Create a target with unknown reachability
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        user: impl Into<String>,
        role: NodeRole,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: user.into(),
            port: default_ssh_port(),
            identity_file: None,
            role,
            reachability: Reachability::Unknown,
        }
    }

    /// Set the identity file
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// `user@address` destination for ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Whether this host runs the control plane
    pub fn is_control_plane(&self) -> bool {
        self.role == NodeRole::ControlPlane
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}
