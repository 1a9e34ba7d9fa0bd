//! In-memory collaborators for exercising phases without real tools
//!
//! Unlike the generated mocks, these keep state between calls, so tests can
//! assert what a phase leaves behind after running once, twice, or after a
//! failure and a retry.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{
    AuthMethodConfig, AuthStep, ClusterAccess, PolicyDocument, RoleBinding, SecretsEngine,
    ServiceIdentity,
};
use crate::backend::{BackendStore, Ensured};
use crate::error::PhaseName;
use crate::kube_utils::ClusterInfo;
use crate::provision::{digest, Plan, ProvisioningEngine};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::target::RemoteTarget;
use crate::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Command runner where every program exists and succeeds, except those marked missing.
#[derive(Debug, Default)]
pub struct FakeRunner {
    missing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    /// Every program present
    pub fn new() -> Self {
        Self::default()
    }

    /// `programs` cannot be started
    pub fn missing<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            missing: programs.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Every command line run so far
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn execute<'a>(
        &self,
        command: &CommandSpec,
        _target: Option<&'a RemoteTarget>,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        lock(&self.calls).push(command.display());
        if self.missing.contains(&command.program) {
            return Err(Error::Spawn {
                program: command.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(CommandOutput::ok(""))
    }
}

/// Provisioning engine holding its state in memory.
///
/// `plan` diffs the desired resources against state; `apply` makes state
/// match the plan it was given.
#[derive(Debug, Default)]
pub struct FakeProvisioningEngine {
    desired: Vec<String>,
    state: Mutex<BTreeSet<String>>,
    applies: AtomicU32,
    destroys: AtomicU32,
}

impl FakeProvisioningEngine {
    /// Engine that wants `desired` to exist, starting from empty state
    pub fn new<I, S>(desired: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            desired: desired.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Start with `resources` already in state
    pub fn with_state<I, S>(self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *lock(&self.state) = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Resources currently in state
    pub fn state(&self) -> Vec<String> {
        lock(&self.state).iter().cloned().collect()
    }

    /// Times `apply` reached the engine
    pub fn applies(&self) -> u32 {
        self.applies.load(Ordering::SeqCst)
    }

    /// Times `destroy` reached the engine
    pub fn destroys(&self) -> u32 {
        self.destroys.load(Ordering::SeqCst)
    }

    fn diff(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut changes: Vec<String> = self
            .desired
            .iter()
            .filter(|r| !state.contains(*r))
            .map(|r| format!("{} (create)", r))
            .collect();
        changes.extend(
            state
                .iter()
                .filter(|r| !self.desired.contains(*r))
                .map(|r| format!("{} (delete)", r)),
        );
        changes
    }
}

#[async_trait]
impl ProvisioningEngine for FakeProvisioningEngine {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn plan(&self) -> Result<Plan> {
        let changes = self.diff();
        Ok(Plan {
            path: "fake.tfplan".into(),
            digest: digest(changes.join("\n").as_bytes()),
            summary: format!("Plan: {} change(s).", changes.len()),
            changes,
        })
    }

    async fn apply(&self, plan: &Plan) -> Result<()> {
        if digest(self.diff().join("\n").as_bytes()) != plan.digest {
            return Err(Error::step(
                PhaseName::Provision,
                "apply",
                "Saved plan is stale",
            ));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = self.desired.iter().cloned().collect();
        Ok(())
    }

    async fn inventory(&self) -> Result<Vec<String>> {
        Ok(self.state())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).clear();
        Ok(())
    }
}

/// Object storage and lock table kept in memory; counts create calls.
#[derive(Debug, Default)]
pub struct FakeBackendStore {
    buckets: Mutex<BTreeMap<String, BucketSettings>>,
    tables: Mutex<BTreeSet<String>>,
    bucket_creates: AtomicU32,
    table_creates: AtomicU32,
}

/// Settings applied to a fake bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSettings {
    /// Versioning on
    pub versioning: bool,
    /// Default encryption on
    pub encryption: bool,
    /// Public access blocked
    pub public_access_blocked: bool,
}

impl FakeBackendStore {
    /// Empty account
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket names
    pub fn buckets(&self) -> Vec<String> {
        lock(&self.buckets).keys().cloned().collect()
    }

    /// Settings of one bucket
    pub fn bucket(&self, name: &str) -> Option<BucketSettings> {
        lock(&self.buckets).get(name).cloned()
    }

    /// Lock table names
    pub fn tables(&self) -> Vec<String> {
        lock(&self.tables).iter().cloned().collect()
    }

    /// Successful bucket creations
    pub fn bucket_creates(&self) -> u32 {
        self.bucket_creates.load(Ordering::SeqCst)
    }

    /// Successful table creations
    pub fn table_creates(&self) -> u32 {
        self.table_creates.load(Ordering::SeqCst)
    }

    fn update(&self, bucket: &str, f: impl FnOnce(&mut BucketSettings)) -> Result<()> {
        let mut buckets = lock(&self.buckets);
        let settings = buckets.get_mut(bucket).ok_or_else(|| {
            Error::step(PhaseName::MigrateBackend, "bucket", format!("NoSuchBucket: {}", bucket))
        })?;
        f(settings);
        Ok(())
    }
}

#[async_trait]
impl BackendStore for FakeBackendStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(lock(&self.buckets).contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<Ensured> {
        let mut buckets = lock(&self.buckets);
        if buckets.contains_key(bucket) {
            return Ok(Ensured::AlreadyExists);
        }
        buckets.insert(bucket.to_string(), BucketSettings::default());
        self.bucket_creates.fetch_add(1, Ordering::SeqCst);
        Ok(Ensured::Created)
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        self.update(bucket, |b| b.versioning = true)
    }

    async fn enable_encryption(&self, bucket: &str) -> Result<()> {
        self.update(bucket, |b| b.encryption = true)
    }

    async fn block_public_access(&self, bucket: &str) -> Result<()> {
        self.update(bucket, |b| b.public_access_blocked = true)
    }

    async fn lock_table_exists(&self, table: &str) -> Result<bool> {
        Ok(lock(&self.tables).contains(table))
    }

    async fn create_lock_table(&self, table: &str) -> Result<Ensured> {
        if !lock(&self.tables).insert(table.to_string()) {
            return Ok(Ensured::AlreadyExists);
        }
        self.table_creates.fetch_add(1, Ordering::SeqCst);
        Ok(Ensured::Created)
    }

    async fn wait_lock_table_active(&self, _table: &str) -> Result<()> {
        Ok(())
    }
}

/// Secrets engine configuration as stored by [`FakeSecretsEngine`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretsState {
    /// Mount path to auth method type
    pub mounts: BTreeMap<String, String>,
    /// Mount path to (host, CA, reviewer JWT)
    pub configs: BTreeMap<String, (String, String, String)>,
    /// Policy name to body
    pub policies: BTreeMap<String, String>,
    /// `<mount>/<role>` to binding
    pub roles: BTreeMap<String, RoleBinding>,
}

/// Secrets engine kept in memory, with one-shot failure injection.
#[derive(Debug, Default)]
pub struct FakeSecretsEngine {
    state: Mutex<SecretsState>,
    fail_at: Mutex<Option<AuthStep>>,
}

impl FakeSecretsEngine {
    /// Empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with `path` already mounted
    pub fn with_mount(self, path: &str, method_type: &str) -> Self {
        lock(&self.state)
            .mounts
            .insert(path.to_string(), method_type.to_string());
        self
    }

    /// Fail the next call belonging to `step`, once
    pub fn fail_once_at(&self, step: AuthStep) {
        *lock(&self.fail_at) = Some(step);
    }

    /// Current configuration
    pub fn snapshot(&self) -> SecretsState {
        lock(&self.state).clone()
    }

    fn injected(&self, step: AuthStep) -> Result<()> {
        let mut fail_at = lock(&self.fail_at);
        if *fail_at == Some(step) {
            *fail_at = None;
            return Err(Error::step(
                PhaseName::FixAuth,
                step.as_str(),
                "503: Vault is sealed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretsEngine for FakeSecretsEngine {
    async fn enable_auth(&self, path: &str, method_type: &str) -> Result<Ensured> {
        self.injected(AuthStep::EnableAuthMethod)?;
        let mut state = lock(&self.state);
        if state.mounts.contains_key(path) {
            return Ok(Ensured::AlreadyExists);
        }
        state
            .mounts
            .insert(path.to_string(), method_type.to_string());
        Ok(Ensured::Created)
    }

    async fn write_auth_config(&self, path: &str, config: &AuthMethodConfig) -> Result<()> {
        self.injected(AuthStep::WriteAuthConfig)?;
        let mut state = lock(&self.state);
        if !state.mounts.contains_key(path) {
            return Err(Error::step(
                PhaseName::FixAuth,
                AuthStep::WriteAuthConfig.as_str(),
                format!("404: no handler for route 'auth/{}/config'", path),
            ));
        }
        state.configs.insert(
            path.to_string(),
            (
                config.kubernetes_host.clone(),
                config.kubernetes_ca_cert.clone(),
                config.token_reviewer_jwt.expose_secret().to_string(),
            ),
        );
        Ok(())
    }

    async fn write_policy(&self, policy: &PolicyDocument) -> Result<()> {
        self.injected(AuthStep::WritePolicy)?;
        lock(&self.state)
            .policies
            .insert(policy.name.clone(), policy.body.clone());
        Ok(())
    }

    async fn write_role(&self, path: &str, role: &RoleBinding) -> Result<()> {
        self.injected(AuthStep::WriteRole)?;
        lock(&self.state)
            .roles
            .insert(format!("{}/{}", path, role.name), role.clone());
        Ok(())
    }
}

/// Cluster with a fixed endpoint, CA and reviewer token.
#[derive(Debug, Clone)]
pub struct FakeClusterAccess {
    info: ClusterInfo,
    token: String,
}

impl FakeClusterAccess {
    /// Cluster at `endpoint` handing out `token`
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            info: ClusterInfo {
                endpoint: endpoint.into(),
                ca_pem: "-----BEGIN CERTIFICATE-----\nfake\n-----END CERTIFICATE-----\n"
                    .to_string(),
            },
            token: token.into(),
        }
    }
}

#[async_trait]
impl ClusterAccess for FakeClusterAccess {
    async fn cluster_info(&self) -> Result<ClusterInfo> {
        Ok(self.info.clone())
    }

    async fn reviewer_token(&self, _identity: &ServiceIdentity) -> Result<SecretString> {
        Ok(SecretString::from(self.token.clone()))
    }
}
