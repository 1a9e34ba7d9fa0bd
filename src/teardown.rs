//! Teardown phase: destroy provisioned resources without orphaning anything
//!
//! Resources created by in-cluster controllers (load balancers, volumes) are
//! not in the provisioning engine's state. Destroying the network under them
//! leaves them dangling and usually makes the destroy fail half way, so the
//! phase runs in a fixed order:
//!
//! 1. List everything in state and ask for the first confirmation
//! 2. Show the externally-created-resource checklist and require an explicit
//!    second confirmation that it was cleared by hand
//! 3. Only then call the engine's destroy

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::config::TeardownSettings;
use crate::confirm::{Confirmation, ConfirmationGate, ConfirmationRequest, Decision};
use crate::kube_utils;
use crate::provision::ProvisioningPhase;
use crate::Result;

/// Token for the checklist confirmation
pub const CHECKLIST_TOKEN: &str = "destroy";

/// Shown when no checklist is configured; the second prompt is never skipped.
const FALLBACK_CHECKLIST_ITEM: &str =
    "Resources created outside the provisioning engine (load balancers, volumes, DNS records)";

/// Result of [`TeardownPhase::teardown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Engine destroy completed (or there was nothing in state)
    Destroyed,
    /// A confirmation was declined; nothing was destroyed
    Aborted,
}

/// Proof that both teardown confirmations were approved.
///
/// Only this module can construct one, and
/// [`ProvisioningPhase::destroy`] will not run without it.
#[derive(Debug)]
pub struct TeardownClearance {
    resources: Vec<String>,
}

impl TeardownClearance {
    fn granted(resources: Vec<String>) -> Self {
        Self { resources }
    }

    /// Resources the user approved for destruction
    pub fn resources(&self) -> &[String] {
        &self.resources
    }
}

/// Finds resources created outside the provisioning engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalResourceScanner: Send + Sync {
    /// Human-readable description of each resource found
    async fn scan(&self) -> Result<Vec<String>>;
}

/// Lists `LoadBalancer` Services through the cluster API.
pub struct LoadBalancerScanner {
    kubeconfig: Option<PathBuf>,
}

impl LoadBalancerScanner {
    /// Scan the cluster reached through `kubeconfig` (kube defaults when `None`)
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self { kubeconfig }
    }
}

#[async_trait]
impl ExternalResourceScanner for LoadBalancerScanner {
    async fn scan(&self) -> Result<Vec<String>> {
        let client = kube_utils::create_client(self.kubeconfig.as_deref()).await?;
        let services: Api<Service> = Api::all(client);
        let list = services.list(&ListParams::default()).await?;
        Ok(list.items.iter().filter_map(describe_load_balancer).collect())
    }
}

fn describe_load_balancer(svc: &Service) -> Option<String> {
    let spec = svc.spec.as_ref()?;
    if spec.type_.as_deref() != Some("LoadBalancer") {
        return None;
    }
    let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
    let name = svc.metadata.name.as_deref().unwrap_or("<unnamed>");

    let ingress: Vec<String> = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.hostname.clone().or_else(|| i.ip.clone()))
                .collect()
        })
        .unwrap_or_default();

    Some(if ingress.is_empty() {
        format!("LoadBalancer Service {}/{}", namespace, name)
    } else {
        format!(
            "LoadBalancer Service {}/{} ({})",
            namespace,
            name,
            ingress.join(", ")
        )
    })
}

/// Orders confirmations ahead of the provisioning engine's destroy.
pub struct TeardownPhase {
    provisioning: Arc<ProvisioningPhase>,
    settings: TeardownSettings,
    scanner: Option<Box<dyn ExternalResourceScanner>>,
}

impl TeardownPhase {
    /// Create the phase. `scanner` adds detected resources to the checklist.
    pub fn new(
        provisioning: Arc<ProvisioningPhase>,
        settings: TeardownSettings,
        scanner: Option<Box<dyn ExternalResourceScanner>>,
    ) -> Self {
        Self {
            provisioning,
            settings,
            scanner,
        }
    }

    /// Confirm twice, then destroy.
    pub async fn teardown(&self, gate: &mut ConfirmationGate) -> Result<TeardownOutcome> {
        self.provisioning.preflight().await?;

        let inventory = self.provisioning.inventory().await?;
        if inventory.is_empty() {
            info!("State is empty, nothing to destroy");
            return Ok(TeardownOutcome::Destroyed);
        }

        let checklist = self.checklist().await;

        let confirmation = Confirmation::double(
            ConfirmationRequest::new(
                format!(
                    "Destroy all {} provisioned resource(s). This cannot be undone.",
                    inventory.len()
                ),
                inventory.clone(),
            ),
            ConfirmationRequest::new(
                "Confirm every resource below was removed manually. \
                 The provisioning engine does not know about them and they will be orphaned.",
                checklist,
            )
            .with_token(CHECKLIST_TOKEN),
        );

        if gate.confirm(&confirmation).await? == Decision::Declined {
            info!("Teardown declined, nothing destroyed");
            return Ok(TeardownOutcome::Aborted);
        }

        self.provisioning
            .destroy(TeardownClearance::granted(inventory))
            .await?;
        Ok(TeardownOutcome::Destroyed)
    }

    /// Configured checklist plus whatever the scanner finds. Scan failures are logged only.
    async fn checklist(&self) -> Vec<String> {
        let mut items = self.settings.checklist.clone();
        if items.is_empty() {
            items.push(FALLBACK_CHECKLIST_ITEM.to_string());
        }

        if let Some(scanner) = &self.scanner {
            match scanner.scan().await {
                Ok(found) => {
                    if !found.is_empty() {
                        warn!(count = found.len(), "Externally-created resources still present");
                    }
                    items.extend(found.into_iter().map(|r| format!("still present: {}", r)));
                }
                Err(e) => warn!(error = %e, "External resource scan failed, relying on checklist"),
            }
        }
        items
    }
}
