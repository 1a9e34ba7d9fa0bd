//! Migrate-backend command

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use keel::backend::{AwsCliBackend, BackendMigrator, Ensured};
use keel::config::Config;
use keel::preflight::{self, PreflightChecker, Requirement};
use keel::Result;

use super::runner;

/// Migrate-backend command arguments
#[derive(Args, Debug)]
pub struct MigrateBackendArgs {
    /// Local state file (defaults to backend.local_state from config)
    #[arg(long)]
    pub state: Option<PathBuf>,
}

pub async fn run(args: MigrateBackendArgs, config: &Config) -> Result<()> {
    let runner = runner();

    let mut requirements = preflight::for_backend(config);
    if let Some(state) = &args.state {
        // the explicit path replaces the configured one
        requirements.retain(|r| !r.name.starts_with("local state"));
        requirements.push(Requirement::path(
            format!("local state {}", state.display()),
            state.clone(),
        ));
    }

    let migrator = BackendMigrator::new(
        Arc::new(AwsCliBackend::new(runner.clone(), config.backend.region.clone())),
        config.backend.clone(),
        PreflightChecker::new(runner),
        requirements,
    );

    let migrated = migrator.migrate(args.state.as_deref()).await?;

    println!("Backed up state to {}", migrated.backup.destination.display());
    for resource in &migrated.resources {
        let verb = match resource.ensured {
            Ensured::Created => "created",
            Ensured::AlreadyExists => "already exists",
        };
        println!("  {:?} {}: {}", resource.kind, resource.name, verb);
    }
    println!(
        "Wrote {}. Run `terraform init -migrate-state` to move state to the new backend.",
        migrated.config_path.display()
    );
    Ok(())
}
