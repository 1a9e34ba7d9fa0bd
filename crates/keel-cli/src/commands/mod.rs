//! CLI commands
//!
//! Each command builds its phase from the loaded [`Config`] and the process
//! runner, runs it, and turns an `Aborted` outcome into
//! [`Error::Declined`] so the exit code reflects it.

use std::sync::Arc;

use keel::config::Config;
use keel::preflight::{self, PreflightChecker};
use keel::provision::{ProvisioningPhase, Terraform};
use keel::runner::{CommandRunner, ProcessRunner};

pub mod bootstrap;
pub mod destroy;
pub mod fix_auth;
pub mod migrate_backend;
pub mod provision;

/// Runner for every external tool the commands call
pub fn runner() -> Arc<dyn CommandRunner> {
    Arc::new(ProcessRunner::new())
}

/// Provisioning phase backed by terraform
pub fn provisioning_phase(config: &Config, runner: Arc<dyn CommandRunner>) -> ProvisioningPhase {
    ProvisioningPhase::new(
        Arc::new(Terraform::new(runner.clone(), config.terraform.clone())),
        PreflightChecker::new(runner),
        preflight::for_provisioning(config),
    )
}
