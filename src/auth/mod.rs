//! Secrets engine trust reconciliation
//!
//! After the secrets engine is upgraded or restarted its cluster auth method
//! can lose the reviewer credential or CA it uses to validate workload
//! tokens. Reconciliation restores it in six steps:
//!
//! 1. Fetch the cluster API endpoint and CA
//! 2. Mint a long-lived reviewer credential bound to the trusted ServiceAccount
//! 3. Enable the auth method at its mount path (already enabled is fine)
//! 4. Write the auth method config (host, CA, reviewer credential)
//! 5. Write the access policy
//! 6. Write the role binding
//!
//! Every step either checks first or overwrites its own target, so a run
//! that failed part way is fixed by running it again.

mod cluster;
mod vault;

pub use cluster::KubeClusterAccess;
pub use vault::VaultClient;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{error, info};

use crate::backend::Ensured;
use crate::config::AuthSettings;
use crate::kube_utils::ClusterInfo;
use crate::preflight::{PreflightChecker, Requirement};
use crate::{Error, Result};

/// Auth method type enabled at the mount path
pub const AUTH_METHOD_TYPE: &str = "kubernetes";

/// Read-only access to the KV secrets the cluster's workloads consume
pub const DEFAULT_POLICY: &str = r#"path "secret/data/*" {
  capabilities = ["read", "list"]
}

path "secret/metadata/*" {
  capabilities = ["read", "list"]
}
"#;

/// The six reconciliation steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStep {
    /// Cluster API endpoint and CA
    FetchClusterEndpoint,
    /// Long-lived reviewer credential
    MintReviewerToken,
    /// Auth method mounted
    EnableAuthMethod,
    /// Auth method config written
    WriteAuthConfig,
    /// Access policy written
    WritePolicy,
    /// Role binding written
    WriteRole,
}

impl AuthStep {
    /// Every step in execution order
    pub const ORDER: [AuthStep; 6] = [
        AuthStep::FetchClusterEndpoint,
        AuthStep::MintReviewerToken,
        AuthStep::EnableAuthMethod,
        AuthStep::WriteAuthConfig,
        AuthStep::WritePolicy,
        AuthStep::WriteRole,
    ];

    /// Step name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStep::FetchClusterEndpoint => "fetch-cluster-endpoint",
            AuthStep::MintReviewerToken => "mint-reviewer-token",
            AuthStep::EnableAuthMethod => "enable-auth-method",
            AuthStep::WriteAuthConfig => "write-auth-config",
            AuthStep::WritePolicy => "write-policy",
            AuthStep::WriteRole => "write-role",
        }
    }

    /// 1-based position
    pub fn number(&self) -> usize {
        AuthStep::ORDER
            .iter()
            .position(|s| s == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ServiceAccount the secrets engine trusts for token review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Namespace
    pub namespace: String,
    /// ServiceAccount name
    pub service_account: String,
    /// Name of the long-lived token Secret
    pub token_secret: String,
}

/// Named ACL policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    /// Policy name
    pub name: String,
    /// HCL policy body
    pub body: String,
}

/// Role that maps cluster ServiceAccounts to policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleBinding {
    /// Role name
    #[serde(skip)]
    pub name: String,
    /// ServiceAccount names allowed to log in
    pub bound_service_account_names: Vec<String>,
    /// Namespaces of those ServiceAccounts
    pub bound_service_account_namespaces: Vec<String>,
    /// Policies granted
    pub policies: Vec<String>,
    /// Token TTL
    pub ttl: String,
}

/// Auth method configuration. The reviewer credential is never printed.
#[derive(Debug)]
pub struct AuthMethodConfig {
    /// Cluster API endpoint
    pub kubernetes_host: String,
    /// PEM CA bundle
    pub kubernetes_ca_cert: String,
    /// Reviewer JWT
    pub token_reviewer_jwt: SecretString,
}

/// Everything one reconciliation run needs.
#[derive(Debug, Clone)]
pub struct AuthPlan {
    /// Auth method mount path
    pub mount_path: String,
    /// Trusted ServiceAccount
    pub identity: ServiceIdentity,
    /// Policy to write
    pub policy: PolicyDocument,
    /// Role to bind
    pub role: RoleBinding,
}

impl AuthPlan {
    /// Build from settings, reading the policy file when one is configured
    pub fn from_settings(settings: &AuthSettings) -> Result<Self> {
        let body = match &settings.policy_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| Error::Config {
                path: path.clone(),
                message: format!("failed to read policy: {}", e),
            })?,
            None => DEFAULT_POLICY.to_string(),
        };

        Ok(Self {
            mount_path: settings.mount_path.trim_matches('/').to_string(),
            identity: ServiceIdentity {
                namespace: settings.namespace.clone(),
                service_account: settings.service_account.clone(),
                token_secret: settings.token_secret.clone(),
            },
            policy: PolicyDocument {
                name: settings.policy_name.clone(),
                body,
            },
            role: RoleBinding {
                name: settings.role.name.clone(),
                bound_service_account_names: settings.role.bound_service_accounts.clone(),
                bound_service_account_namespaces: settings.role.bound_namespaces.clone(),
                policies: vec![settings.policy_name.clone()],
                ttl: settings.role.ttl.clone(),
            },
        })
    }
}

/// Cluster side of reconciliation (steps 1 and 2).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// API endpoint and CA as the secrets engine should see them
    async fn cluster_info(&self) -> Result<ClusterInfo>;

    /// Ensure a long-lived token for `identity` exists and return it
    async fn reviewer_token(&self, identity: &ServiceIdentity) -> Result<SecretString>;
}

/// Secrets engine side of reconciliation (steps 3 to 6).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsEngine: Send + Sync {
    /// Mount an auth method at `path` unless something is already there
    async fn enable_auth(&self, path: &str, method_type: &str) -> Result<Ensured>;

    /// Overwrite the auth method's config
    async fn write_auth_config(&self, path: &str, config: &AuthMethodConfig) -> Result<()>;

    /// Overwrite a named ACL policy
    async fn write_policy(&self, policy: &PolicyDocument) -> Result<()>;

    /// Overwrite a role under the auth method
    async fn write_role(&self, path: &str, role: &RoleBinding) -> Result<()>;
}

/// One step's entry in a [`ReconciliationRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// Step
    pub step: AuthStep,
    /// Whether it finished
    pub completed: bool,
    /// Error text if it failed
    pub error: Option<String>,
}

/// Per-step progress of one run. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRecord {
    steps: Vec<StepRecord>,
}

impl Default for ReconciliationRecord {
    fn default() -> Self {
        Self {
            steps: AuthStep::ORDER
                .iter()
                .map(|&step| StepRecord {
                    step,
                    completed: false,
                    error: None,
                })
                .collect(),
        }
    }
}

impl ReconciliationRecord {
    /// All six steps in order
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Last step that completed, if any
    pub fn last_completed(&self) -> Option<AuthStep> {
        self.steps
            .iter()
            .take_while(|s| s.completed)
            .last()
            .map(|s| s.step)
    }

    /// Whether every step completed
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.completed)
    }

    fn complete(&mut self, step: AuthStep) {
        if let Some(entry) = self.steps.iter_mut().find(|s| s.step == step) {
            entry.completed = true;
        }
    }

    /// Record the failure and turn it into the error reported to the user
    fn fail(&mut self, step: AuthStep, err: Error) -> Error {
        let message = match err {
            Error::StepFailed { message, .. } => message,
            other => other.to_string(),
        };
        if let Some(entry) = self.steps.iter_mut().find(|s| s.step == step) {
            entry.error = Some(message.clone());
        }
        let last_completed = self.last_completed();
        error!(
            step = %step,
            step_number = step.number(),
            last_completed = last_completed.map(|s| s.as_str()).unwrap_or("none"),
            "Reconciliation stopped; re-run fix-auth once the cause is fixed"
        );
        Error::Reconcile {
            step: step.as_str().to_string(),
            last_completed: last_completed.map(|s| s.as_str().to_string()),
            message,
        }
    }
}

/// Runs the six-step reconciliation.
pub struct AuthReconciler {
    cluster: Arc<dyn ClusterAccess>,
    engine: Arc<dyn SecretsEngine>,
    preflight: PreflightChecker,
    requirements: Vec<Requirement>,
}

impl AuthReconciler {
    /// Create the reconciler
    pub fn new(
        cluster: Arc<dyn ClusterAccess>,
        engine: Arc<dyn SecretsEngine>,
        preflight: PreflightChecker,
        requirements: Vec<Requirement>,
    ) -> Self {
        Self {
            cluster,
            engine,
            preflight,
            requirements,
        }
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// The error names the failing step and the last one that completed.
    pub async fn reconcile(&self, plan: &AuthPlan) -> Result<ReconciliationRecord> {
        self.preflight.check(&self.requirements).await?;

        let mut record = ReconciliationRecord::default();

        // 1
        let step = AuthStep::FetchClusterEndpoint;
        let cluster = match self.cluster.cluster_info().await {
            Ok(info) => info,
            Err(e) => return Err(record.fail(step, e)),
        };
        record.complete(step);
        info!(step = %step, endpoint = %cluster.endpoint, "Cluster endpoint resolved");

        // 2
        let step = AuthStep::MintReviewerToken;
        let token = match self.cluster.reviewer_token(&plan.identity).await {
            Ok(token) => token,
            Err(e) => return Err(record.fail(step, e)),
        };
        record.complete(step);
        info!(
            step = %step,
            namespace = %plan.identity.namespace,
            service_account = %plan.identity.service_account,
            "Reviewer credential ready"
        );

        // 3
        let step = AuthStep::EnableAuthMethod;
        match self.engine.enable_auth(&plan.mount_path, AUTH_METHOD_TYPE).await {
            Ok(ensured) => {
                record.complete(step);
                info!(step = %step, path = %plan.mount_path, result = ?ensured, "Auth method enabled");
            }
            Err(e) => return Err(record.fail(step, e)),
        }

        // 4
        let step = AuthStep::WriteAuthConfig;
        let config = AuthMethodConfig {
            kubernetes_host: cluster.endpoint,
            kubernetes_ca_cert: cluster.ca_pem,
            token_reviewer_jwt: token,
        };
        if let Err(e) = self.engine.write_auth_config(&plan.mount_path, &config).await {
            return Err(record.fail(step, e));
        }
        record.complete(step);
        info!(step = %step, host = %config.kubernetes_host, "Auth method config written");

        // 5
        let step = AuthStep::WritePolicy;
        if let Err(e) = self.engine.write_policy(&plan.policy).await {
            return Err(record.fail(step, e));
        }
        record.complete(step);
        info!(step = %step, policy = %plan.policy.name, "Policy written");

        // 6
        let step = AuthStep::WriteRole;
        if let Err(e) = self.engine.write_role(&plan.mount_path, &plan.role).await {
            return Err(record.fail(step, e));
        }
        record.complete(step);
        info!(step = %step, role = %plan.role.name, "Role written");

        info!("Secrets engine trust reconciled");
        Ok(record)
    }
}
