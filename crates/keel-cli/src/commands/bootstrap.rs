//! Bootstrap command

use std::sync::Arc;

use clap::Args;
use keel::config::Config;
use keel::configure::{Ansible, ConfigurationPhase, InventorySource};
use keel::poll::ReadinessPoller;
use keel::preflight::{self, PreflightChecker};
use keel::Result;

use super::runner;

/// Bootstrap command arguments
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Run every role in check mode; nothing on the hosts changes
    #[arg(long)]
    pub check: bool,
}

pub async fn run(args: BootstrapArgs, config: &Config) -> Result<()> {
    let runner = runner();
    let inventory = if config.targets.is_empty() {
        InventorySource::File(config.ansible.inventory.clone())
    } else {
        InventorySource::Inline
    };

    let phase = ConfigurationPhase::new(
        Arc::new(Ansible::new(runner.clone(), config.ansible.clone(), inventory)),
        ReadinessPoller::new(runner.clone()),
        config.readiness.clone(),
        PreflightChecker::new(runner),
        preflight::for_bootstrap(config),
    );

    // the inventory is only read once preflight has passed
    let result = phase
        .bootstrap_with(|| config.remote_targets(), args.check)
        .await?;

    for (role, hosts) in &result.steps {
        println!("  {:<14} {}", role, hosts.join(", "));
    }
    if result.check {
        println!("Check run complete. No changes were made.");
    } else {
        println!("Cluster bootstrapped.");
    }
    Ok(())
}
