//! Orchestrator configuration
//!
//! A single [`Config`] value is built once at process start and passed to
//! each phase. Nothing in the library reads the environment on its own after
//! that point.
//!
//! Config file resolution (highest priority first):
//! 1. Explicit `--config` flag
//! 2. `KEEL_CONFIG` environment variable
//! 3. `keel.yaml` in the working directory
//! 4. Built-in defaults when no file exists
//!
//! Remote targets come from, in order: `KEEL_TARGETS`, the `targets` list in
//! the config file, then the configuration engine's inventory file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::inventory::{self, expand_home};
use crate::poll::ReadinessSettings;
use crate::target::{NodeRole, RemoteTarget};
use crate::{Error, Result};

const DEFAULT_CONFIG_FILE: &str = "keel.yaml";
const KEEL_CONFIG_ENV: &str = "KEEL_CONFIG";
const KEEL_TARGETS_ENV: &str = "KEEL_TARGETS";
const KEEL_SSH_USER_ENV: &str = "KEEL_SSH_USER";
const KEEL_SSH_KEY_ENV: &str = "KEEL_SSH_KEY";
const VAULT_ADDR_ENV: &str = "VAULT_ADDR";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provisioning engine settings
    pub terraform: TerraformSettings,
    /// Configuration engine settings
    pub ansible: AnsibleSettings,
    /// ssh connection defaults
    pub ssh: SshSettings,
    /// Explicit targets; when empty the inventory file is read
    pub targets: Vec<TargetEntry>,
    /// Readiness polling before configuration
    pub readiness: ReadinessSettings,
    /// Remote state backend
    pub backend: BackendSettings,
    /// Secrets engine trust reconciliation
    pub auth: AuthSettings,
    /// Teardown checklist
    pub teardown: TeardownSettings,
}

/// Provisioning engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraformSettings {
    /// Engine binary
    pub binary: String,
    /// Directory holding the resource definitions
    pub dir: PathBuf,
    /// Saved plan file, relative to `dir`
    pub plan_file: String,
    /// Attempts for `init` (downloads providers/modules)
    pub init_attempts: u32,
    /// Check cloud credentials with `aws sts get-caller-identity` before running
    pub check_aws_credentials: bool,
}

impl Default for TerraformSettings {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            dir: PathBuf::from("terraform"),
            plan_file: "keel.tfplan".to_string(),
            init_attempts: 3,
            check_aws_credentials: true,
        }
    }
}

impl TerraformSettings {
    /// Absolute-or-relative path of the saved plan
    pub fn plan_path(&self) -> PathBuf {
        self.dir.join(&self.plan_file)
    }
}

/// Playbook per bootstrap role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePlaybooks {
    /// Common preparation on every host
    pub common: String,
    /// Control-plane initialization
    pub control_plane: String,
    /// Worker join
    pub workers: String,
    /// Platform add-ons
    pub addons: String,
}

impl Default for RolePlaybooks {
    fn default() -> Self {
        Self {
            common: "common.yml".to_string(),
            control_plane: "control-plane.yml".to_string(),
            workers: "workers.yml".to_string(),
            addons: "addons.yml".to_string(),
        }
    }
}

/// Configuration engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnsibleSettings {
    /// Engine binary
    pub binary: String,
    /// Directory holding the role playbooks
    pub playbook_dir: PathBuf,
    /// Inventory file
    pub inventory: PathBuf,
    /// Playbook file names
    pub playbooks: RolePlaybooks,
}

impl Default for AnsibleSettings {
    fn default() -> Self {
        Self {
            binary: "ansible-playbook".to_string(),
            playbook_dir: PathBuf::from("ansible"),
            inventory: PathBuf::from("ansible/inventory.ini"),
            playbooks: RolePlaybooks::default(),
        }
    }
}

/// ssh defaults applied to targets that don't set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Login user
    pub user: String,
    /// Identity file
    pub identity_file: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            identity_file: None,
        }
    }
}

/// Explicit target entry in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    /// Host name
    pub name: String,
    /// ssh address
    pub address: String,
    /// Cluster role
    pub role: NodeRole,
    /// Login user override
    #[serde(default)]
    pub user: Option<String>,
}

/// Remote state backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Object storage bucket for state
    pub bucket: String,
    /// Lock table name
    pub lock_table: String,
    /// Cloud region
    pub region: String,
    /// Object key of the state file inside the bucket
    pub state_key: String,
    /// Local state file to back up and migrate
    pub local_state: PathBuf,
    /// Where the generated backend configuration is written
    pub output: PathBuf,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            bucket: "keel-terraform-state".to_string(),
            lock_table: "keel-terraform-locks".to_string(),
            region: "us-east-1".to_string(),
            state_key: "cluster/terraform.tfstate".to_string(),
            local_state: PathBuf::from("terraform/terraform.tfstate"),
            output: PathBuf::from("terraform/backend.tf"),
        }
    }
}

/// Role binding written to the secrets engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSettings {
    /// Role name
    pub name: String,
    /// ServiceAccounts allowed to log in with this role
    pub bound_service_accounts: Vec<String>,
    /// Namespaces those ServiceAccounts live in
    pub bound_namespaces: Vec<String>,
    /// Token TTL
    pub ttl: String,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            name: "external-secrets".to_string(),
            bound_service_accounts: vec!["external-secrets".to_string()],
            bound_namespaces: vec!["external-secrets".to_string()],
            ttl: "1h".to_string(),
        }
    }
}

/// Secrets engine trust reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Secrets engine address; falls back to `VAULT_ADDR`
    pub vault_addr: Option<String>,
    /// Mount path of the cluster auth method
    pub mount_path: String,
    /// Kubeconfig used to reach the cluster (kube defaults when unset)
    pub kubeconfig: Option<PathBuf>,
    /// Cluster API endpoint as seen by the secrets engine; overrides the kubeconfig server
    pub cluster_endpoint: Option<String>,
    /// ServiceAccount the secrets engine uses for token review
    pub service_account: String,
    /// Namespace of that ServiceAccount
    pub namespace: String,
    /// Name of the long-lived token Secret
    pub token_secret: String,
    /// ACL policy name
    pub policy_name: String,
    /// ACL policy document; a read-only KV policy is used when unset
    pub policy_file: Option<PathBuf>,
    /// Role binding
    pub role: RoleSettings,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            vault_addr: None,
            mount_path: "kubernetes".to_string(),
            kubeconfig: None,
            cluster_endpoint: None,
            service_account: "vault-auth".to_string(),
            namespace: "vault".to_string(),
            token_secret: "vault-auth-token".to_string(),
            policy_name: "external-secrets".to_string(),
            policy_file: None,
            role: RoleSettings::default(),
        }
    }
}

/// Teardown settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownSettings {
    /// Resources created outside the provisioning engine that must be removed first
    pub checklist: Vec<String>,
    /// Kubeconfig used for the advisory LoadBalancer scan
    pub kubeconfig: Option<PathBuf>,
}

impl Default for TeardownSettings {
    fn default() -> Self {
        Self {
            checklist: vec![
                "LoadBalancer Services created by in-cluster controllers (kubectl get svc -A)"
                    .to_string(),
                "Ingress controller load balancers and their security groups".to_string(),
                "Volumes dynamically provisioned by the CSI driver".to_string(),
            ],
            kubeconfig: None,
        }
    }
}

impl Config {
    /// Load configuration using the resolution chain and apply environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let mut config = match resolve_config_path(explicit, &env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(&env);
        Ok(config)
    }

    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: format!("failed to read: {}", e),
        })?;
        serde_yaml::from_str(&data).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: format!("failed to parse: {}", e),
        })
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(user) = env(KEEL_SSH_USER_ENV) {
            self.ssh.user = user;
        }
        if let Some(key) = env(KEEL_SSH_KEY_ENV) {
            self.ssh.identity_file = Some(expand_home(&key));
        }
        if self.auth.vault_addr.is_none() {
            self.auth.vault_addr = env(VAULT_ADDR_ENV);
        }
        if let Some(targets) = env(KEEL_TARGETS_ENV) {
            self.targets = parse_targets_env(&targets);
        }
    }

    /// Remote targets, control plane first, with ssh defaults applied
    pub fn remote_targets(&self) -> Result<Vec<RemoteTarget>> {
        let mut targets = if self.targets.is_empty() {
            inventory::load(&self.ansible.inventory, &self.ssh.user)?
        } else {
            let mut targets: Vec<RemoteTarget> = self
                .targets
                .iter()
                .map(|entry| {
                    RemoteTarget::new(
                        entry.name.clone(),
                        entry.address.clone(),
                        entry.user.clone().unwrap_or_else(|| self.ssh.user.clone()),
                        entry.role,
                    )
                })
                .collect();
            targets.sort_by_key(|t| !t.is_control_plane());
            targets
        };

        if targets.is_empty() {
            return Err(Error::validation(format!(
                "no remote targets: set {} or list hosts in {}",
                KEEL_TARGETS_ENV,
                self.ansible.inventory.display()
            )));
        }

        for target in &mut targets {
            if target.identity_file.is_none() {
                target.identity_file = self.ssh.identity_file.clone();
            }
        }
        Ok(targets)
    }
}

fn resolve_config_path(
    explicit: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env(KEEL_CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    default.exists().then_some(default)
}

/// Parse `KEEL_TARGETS`: comma-separated `name=address` or bare addresses.
/// The first entry is the control plane.
fn parse_targets_env(value: &str) -> Vec<TargetEntry> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, item)| {
            let (name, address) = match item.split_once('=') {
                Some((name, address)) => (name.to_string(), address.to_string()),
                None => (item.to_string(), item.to_string()),
            };
            TargetEntry {
                name,
                address,
                role: if i == 0 {
                    NodeRole::ControlPlane
                } else {
                    NodeRole::Worker
                },
                user: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.terraform.binary, "terraform");
        assert_eq!(config.terraform.plan_path(), PathBuf::from("terraform/keel.tfplan"));
        assert_eq!(config.auth.mount_path, "kubernetes");
        assert!(!config.teardown.checklist.is_empty());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
terraform:
  dir: infra
backend:
  bucket: homelab-state
  region: eu-west-1
auth:
  role:
    name: eso
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.terraform.dir, PathBuf::from("infra"));
        assert_eq!(config.terraform.binary, "terraform");
        assert_eq!(config.backend.bucket, "homelab-state");
        assert_eq!(config.backend.lock_table, "keel-terraform-locks");
        assert_eq!(config.auth.role.name, "eso");
        assert_eq!(config.auth.role.ttl, "1h");
    }

    #[test]
    fn env_overrides_targets_and_ssh() {
        let mut config = Config::default();
        config.apply_env(&env_from(&[
            ("KEEL_TARGETS", "cp-1=10.0.0.10, w-1=10.0.0.11,10.0.0.12"),
            ("KEEL_SSH_USER", "admin"),
            ("KEEL_SSH_KEY", "/keys/id_ed25519"),
            ("VAULT_ADDR", "https://vault.lan:8200"),
        ]));

        let targets = config.remote_targets().unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].name, "cp-1");
        assert!(targets[0].is_control_plane());
        assert_eq!(targets[2].name, "10.0.0.12");
        assert_eq!(targets[2].user, "admin");
        assert_eq!(
            targets[1].identity_file,
            Some(PathBuf::from("/keys/id_ed25519"))
        );
        assert_eq!(config.auth.vault_addr.as_deref(), Some("https://vault.lan:8200"));
    }

    #[test]
    fn explicit_vault_addr_wins_over_env() {
        let mut config = Config::default();
        config.auth.vault_addr = Some("https://explicit:8200".to_string());
        config.apply_env(&env_from(&[("VAULT_ADDR", "https://env:8200")]));
        assert_eq!(config.auth.vault_addr.as_deref(), Some("https://explicit:8200"));
    }

    #[test]
    fn targets_fall_back_to_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = dir.path().join("inventory.ini");
        std::fs::write(&inventory, "[control_plane]\ncp ansible_host=192.168.1.5\n").unwrap();

        let mut config = Config::default();
        config.ansible.inventory = inventory;
        let targets = config.remote_targets().unwrap();
        assert_eq!(targets[0].address, "192.168.1.5");
        assert_eq!(targets[0].user, "ubuntu");
    }

    #[test]
    fn no_targets_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = dir.path().join("inventory.ini");
        std::fs::write(&inventory, "[monitoring]\ngrafana\n").unwrap();

        let mut config = Config::default();
        config.ansible.inventory = inventory;
        let err = config.remote_targets().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn explicit_config_path_wins() {
        let env = env_from(&[("KEEL_CONFIG", "/etc/keel.yaml")]);
        assert_eq!(
            resolve_config_path(Some(Path::new("mine.yaml")), &env),
            Some(PathBuf::from("mine.yaml"))
        );
        assert_eq!(
            resolve_config_path(None, &env),
            Some(PathBuf::from("/etc/keel.yaml"))
        );
    }
}
