//! Kubernetes client helpers

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::error::{PhaseName, StepErrorExt};
use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = read_kubeconfig(Some(path))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::validation(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::validation(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

fn read_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig> {
    let result = match path {
        Some(path) => Kubeconfig::read_from(path),
        None => Kubeconfig::read(),
    };
    result.map_err(|e| Error::validation(format!("failed to read kubeconfig: {}", e)))
}

/// API server address and CA bundle of the current kubeconfig context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// API server URL
    pub endpoint: String,
    /// PEM CA bundle
    pub ca_pem: String,
}

/// Read the current context's cluster entry
pub fn cluster_info(kubeconfig: Option<&Path>) -> Result<ClusterInfo> {
    let kubeconfig = read_kubeconfig(kubeconfig)?;
    cluster_info_from(&kubeconfig)
}

/// Resolve the current context's cluster in an already-loaded kubeconfig
pub fn cluster_info_from(kubeconfig: &Kubeconfig) -> Result<ClusterInfo> {
    let context_name = kubeconfig
        .current_context
        .as_deref()
        .ok_or_else(|| Error::validation("kubeconfig has no current-context"))?;

    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone())
        .ok_or_else(|| {
            Error::validation(format!("context '{}' not found in kubeconfig", context_name))
        })?;

    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| {
            Error::validation(format!("cluster '{}' not found in kubeconfig", cluster_name))
        })?;

    let endpoint = cluster.server.clone().ok_or_else(|| {
        Error::validation(format!("cluster '{}' has no server", cluster_name))
    })?;

    let ca_pem = if let Some(data) = &cluster.certificate_authority_data {
        let bytes = STANDARD
            .decode(data.trim())
            .step_err(PhaseName::FixAuth, "cluster-endpoint")?;
        String::from_utf8(bytes).step_err(PhaseName::FixAuth, "cluster-endpoint")?
    } else if let Some(path) = &cluster.certificate_authority {
        std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read CA file {}: {}", path, e))
        })?
    } else {
        return Err(Error::validation(format!(
            "cluster '{}' has no certificate authority",
            cluster_name
        )));
    };

    Ok(ClusterInfo { endpoint, ca_pem })
}
