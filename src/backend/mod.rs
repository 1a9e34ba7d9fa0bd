//! Remote state backend migration
//!
//! Moves provisioning state from a local file to object storage with a lock
//! table. Every resource is existence-checked before it is created, and the
//! settings that are cheap to re-apply (versioning, encryption, public access
//! block) are always applied, so running this twice is safe.
//!
//! Order:
//! 1. Back up local state to a timestamped file (never overwritten)
//! 2. Bucket: check, create if missing
//! 3. Versioning and default encryption
//! 4. Public access block
//! 5. Lock table: check, create if missing, wait until active
//! 6. Write the backend configuration document

mod aws;

pub use aws::AwsCliBackend;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::config::BackendSettings;
use crate::error::PhaseName;
use crate::preflight::{PreflightChecker, Requirement};
use crate::{Error, Result};

/// Outcome of a check-then-create step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The resource did not exist and was created
    Created,
    /// The resource was already there
    AlreadyExists,
}

/// Kind of backend resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Object storage bucket holding state
    ObjectStore,
    /// Table used for state locking
    LockTable,
}

/// A backend resource and what the existence check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResource {
    /// Resource kind
    pub kind: ResourceKind,
    /// Bucket or table name
    pub name: String,
    /// Result of the existence check
    pub ensured: Ensured,
}

/// A local state backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBackup {
    /// State file that was copied
    pub source: PathBuf,
    /// Time the copy was taken
    pub timestamp: DateTime<Utc>,
    /// Backup file
    pub destination: PathBuf,
}

/// Result of a successful migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migrated {
    /// Backup taken before anything else
    pub backup: StateBackup,
    /// Bucket and lock table
    pub resources: Vec<BackendResource>,
    /// Where the backend configuration was written
    pub config_path: PathBuf,
}

/// Object storage and lock table operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Whether the bucket exists (and is ours)
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create the bucket in the store's region. An "already exists/owned"
    /// answer is `AlreadyExists`.
    async fn create_bucket(&self, bucket: &str) -> Result<Ensured>;

    /// Turn on object versioning
    async fn enable_versioning(&self, bucket: &str) -> Result<()>;

    /// Turn on default server-side encryption
    async fn enable_encryption(&self, bucket: &str) -> Result<()>;

    /// Block every form of public access
    async fn block_public_access(&self, bucket: &str) -> Result<()>;

    /// Whether the lock table exists
    async fn lock_table_exists(&self, table: &str) -> Result<bool>;

    /// Create the lock table keyed by `LockID` in the store's region
    async fn create_lock_table(&self, table: &str) -> Result<Ensured>;

    /// Wait until the lock table is usable
    async fn wait_lock_table_active(&self, table: &str) -> Result<()>;
}

/// Creates the remote backend and hands state over to it.
pub struct BackendMigrator {
    store: Arc<dyn BackendStore>,
    settings: BackendSettings,
    preflight: PreflightChecker,
    requirements: Vec<Requirement>,
}

impl BackendMigrator {
    /// Create the migrator
    pub fn new(
        store: Arc<dyn BackendStore>,
        settings: BackendSettings,
        preflight: PreflightChecker,
        requirements: Vec<Requirement>,
    ) -> Self {
        Self {
            store,
            settings,
            preflight,
            requirements,
        }
    }

    /// Migrate `local_state` (the configured path when `None`).
    pub async fn migrate(&self, local_state: Option<&Path>) -> Result<Migrated> {
        self.preflight.check(&self.requirements).await?;
        validate_names(&self.settings)?;

        let source = local_state.unwrap_or(&self.settings.local_state);
        if !source.is_file() {
            return Err(Error::Precondition {
                missing: vec![format!("local state {}", source.display())],
            });
        }

        let backup = backup_state(source, Utc::now())?;
        info!(backup = %backup.destination.display(), "Local state backed up");

        let bucket = &self.settings.bucket;
        let table = &self.settings.lock_table;

        let bucket_ensured = if self.store.bucket_exists(bucket).await? {
            Ensured::AlreadyExists
        } else {
            self.store.create_bucket(bucket).await?
        };
        info!(bucket = %bucket, result = ?bucket_ensured, "State bucket ensured");

        self.store.enable_versioning(bucket).await?;
        self.store.enable_encryption(bucket).await?;
        self.store.block_public_access(bucket).await?;
        info!(bucket = %bucket, "Versioning, encryption and public access block applied");

        let table_ensured = if self.store.lock_table_exists(table).await? {
            Ensured::AlreadyExists
        } else {
            let ensured = self.store.create_lock_table(table).await?;
            self.store.wait_lock_table_active(table).await?;
            ensured
        };
        info!(table = %table, result = ?table_ensured, "Lock table ensured");

        let config_path = self.settings.output.clone();
        let hcl = render_backend_config(&self.settings)?;
        std::fs::write(&config_path, hcl).map_err(|e| {
            Error::step(
                PhaseName::MigrateBackend,
                "write-config",
                format!("failed to write {}: {}", config_path.display(), e),
            )
        })?;
        info!(
            path = %config_path.display(),
            "Backend configuration written. Run `terraform init -migrate-state` to move state"
        );

        Ok(Migrated {
            backup,
            resources: vec![
                BackendResource {
                    kind: ResourceKind::ObjectStore,
                    name: bucket.clone(),
                    ensured: bucket_ensured,
                },
                BackendResource {
                    kind: ResourceKind::LockTable,
                    name: table.clone(),
                    ensured: table_ensured,
                },
            ],
            config_path,
        })
    }
}

/// Copy `source` next to itself as `<name>.backup-<UTC timestamp>`.
///
/// The destination is opened create-new, so an existing backup is never
/// overwritten; a same-second collision gets a numeric suffix.
pub fn backup_state(source: &Path, now: DateTime<Utc>) -> Result<StateBackup> {
    let contents = std::fs::read(source).map_err(|e| {
        Error::step(
            PhaseName::MigrateBackend,
            "backup",
            format!("failed to read {}: {}", source.display(), e),
        )
    })?;

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "terraform.tfstate".to_string());
    let stamp = now.format("%Y%m%dT%H%M%SZ");

    for n in 0u32..100 {
        let name = if n == 0 {
            format!("{}.backup-{}", file_name, stamp)
        } else {
            format!("{}.backup-{}-{}", file_name, stamp, n)
        };
        let destination = source.with_file_name(name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
        {
            Ok(mut file) => {
                file.write_all(&contents).and_then(|_| file.sync_all()).map_err(|e| {
                    Error::step(
                        PhaseName::MigrateBackend,
                        "backup",
                        format!("failed to write {}: {}", destination.display(), e),
                    )
                })?;
                return Ok(StateBackup {
                    source: source.to_path_buf(),
                    timestamp: now,
                    destination,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(Error::step(
                    PhaseName::MigrateBackend,
                    "backup",
                    format!("failed to create {}: {}", destination.display(), e),
                ))
            }
        }
    }

    Err(Error::step(
        PhaseName::MigrateBackend,
        "backup",
        format!("too many backups of {} at {}", source.display(), stamp),
    ))
}

fn check_name(field: &str, value: &str, allowed: impl Fn(char) -> bool) -> Result<()> {
    if value.is_empty() || !value.chars().all(allowed) {
        return Err(Error::validation(format!(
            "backend {} {:?} contains characters that are not allowed",
            field, value
        )));
    }
    Ok(())
}

/// Reject backend names that cannot be written into the backend block verbatim
pub fn validate_names(settings: &BackendSettings) -> Result<()> {
    check_name("bucket", &settings.bucket, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.')
    })?;
    check_name("lock_table", &settings.lock_table, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
    })?;
    check_name("region", &settings.region, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
    })?;
    // quotes, escapes and interpolation would change the HCL
    check_name("state_key", &settings.state_key, |c| {
        !c.is_control() && !matches!(c, '"' | '\\' | '$' | '%')
    })
}

/// HCL `backend "s3"` block pointing at the bucket and lock table
pub fn render_backend_config(settings: &BackendSettings) -> Result<String> {
    validate_names(settings)?;
    Ok(format!(
        r#"terraform {{
  backend "s3" {{
    bucket         = "{bucket}"
    key            = "{key}"
    region         = "{region}"
    dynamodb_table = "{table}"
    encrypt        = true
  }}
}}
"#,
        bucket = settings.bucket,
        key = settings.state_key,
        region = settings.region,
        table = settings.lock_table,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockCommandRunner};
    use chrono::TimeZone;

    fn settings(dir: &Path) -> BackendSettings {
        BackendSettings {
            local_state: dir.join("terraform.tfstate"),
            output: dir.join("backend.tf"),
            ..Default::default()
        }
    }

    fn preflight() -> PreflightChecker {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_execute()
            .returning(|_, _, _| Ok(CommandOutput::ok("")));
        PreflightChecker::new(Arc::new(runner))
    }

    #[test]
    fn backups_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("terraform.tfstate");
        std::fs::write(&state, "{\"version\": 4}").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let first = backup_state(&state, now).unwrap();
        let second = backup_state(&state, now).unwrap();

        assert_eq!(
            first.destination.file_name().unwrap(),
            "terraform.tfstate.backup-20260301T120000Z"
        );
        assert_ne!(first.destination, second.destination);
        assert_eq!(
            std::fs::read_to_string(&second.destination).unwrap(),
            "{\"version\": 4}"
        );
    }

    #[test]
    fn backend_config_names_bucket_and_table() {
        let hcl = render_backend_config(&BackendSettings::default()).unwrap();
        assert!(hcl.contains("backend \"s3\""));
        assert!(hcl.contains("bucket         = \"keel-terraform-state\""));
        assert!(hcl.contains("dynamodb_table = \"keel-terraform-locks\""));
    }

    #[test]
    fn quoted_names_are_rejected() {
        for settings in [
            BackendSettings {
                state_key: "state\"\n  role_arn = \"arn:aws:iam::1:role/x".to_string(),
                ..Default::default()
            },
            BackendSettings {
                lock_table: "locks\"".to_string(),
                ..Default::default()
            },
            BackendSettings {
                bucket: "State_Bucket".to_string(),
                ..Default::default()
            },
            BackendSettings {
                state_key: "${path.module}/state".to_string(),
                ..Default::default()
            },
        ] {
            let err = render_backend_config(&settings).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?}", settings);
        }
    }

    #[tokio::test]
    async fn invalid_names_fail_before_backup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terraform.tfstate"), "{}").unwrap();
        let mut store = MockBackendStore::new();
        store.expect_bucket_exists().never();

        let migrator = BackendMigrator::new(
            Arc::new(store),
            BackendSettings {
                lock_table: "locks\" # injected".to_string(),
                ..settings(dir.path())
            },
            preflight(),
            vec![],
        );
        let err = migrator.migrate(None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn missing_state_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockBackendStore::new();
        store.expect_bucket_exists().never();
        store.expect_create_bucket().never();
        store.expect_create_lock_table().never();

        let migrator = BackendMigrator::new(
            Arc::new(store),
            settings(dir.path()),
            preflight(),
            vec![],
        );
        let err = migrator.migrate(None).await.unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert!(!dir.path().join("backend.tf").exists());
    }

    #[tokio::test]
    async fn existing_resources_are_not_recreated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terraform.tfstate"), "{}").unwrap();

        let mut store = MockBackendStore::new();
        store.expect_bucket_exists().returning(|_| Ok(true));
        store.expect_create_bucket().never();
        store.expect_enable_versioning().times(1).returning(|_| Ok(()));
        store.expect_enable_encryption().times(1).returning(|_| Ok(()));
        store.expect_block_public_access().times(1).returning(|_| Ok(()));
        store.expect_lock_table_exists().returning(|_| Ok(true));
        store.expect_create_lock_table().never();
        store.expect_wait_lock_table_active().never();

        let migrator = BackendMigrator::new(
            Arc::new(store),
            settings(dir.path()),
            preflight(),
            vec![],
        );
        let migrated = migrator.migrate(None).await.unwrap();
        assert!(migrated
            .resources
            .iter()
            .all(|r| r.ensured == Ensured::AlreadyExists));
        assert!(migrated.config_path.exists());
    }

    #[tokio::test]
    async fn new_lock_table_is_waited_for() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terraform.tfstate"), "{}").unwrap();

        let mut store = MockBackendStore::new();
        store.expect_bucket_exists().returning(|_| Ok(false));
        store
            .expect_create_bucket()
            .withf(|bucket| bucket == "keel-terraform-state")
            .times(1)
            .returning(|_| Ok(Ensured::Created));
        store.expect_enable_versioning().returning(|_| Ok(()));
        store.expect_enable_encryption().returning(|_| Ok(()));
        store.expect_block_public_access().returning(|_| Ok(()));
        store.expect_lock_table_exists().returning(|_| Ok(false));
        store
            .expect_create_lock_table()
            .times(1)
            .returning(|_| Ok(Ensured::Created));
        store
            .expect_wait_lock_table_active()
            .times(1)
            .returning(|_| Ok(()));

        let migrator = BackendMigrator::new(
            Arc::new(store),
            settings(dir.path()),
            preflight(),
            vec![],
        );
        let migrated = migrator.migrate(None).await.unwrap();
        assert!(migrated.resources.iter().all(|r| r.ensured == Ensured::Created));
    }
}
