//! init, validate, plan and apply

use clap::Args;
use keel::config::Config;
use keel::confirm::ConfirmationGate;
use keel::provision::ApplyOutcome;
use keel::{Error, PhaseName, Result};

use super::{provisioning_phase, runner};

/// Apply command arguments
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Skip the confirmation prompt (the plan is still shown)
    #[arg(short = 'y', long)]
    pub yes: bool,
}

pub async fn init(config: &Config) -> Result<()> {
    provisioning_phase(config, runner()).init().await?;
    println!("Initialized {}", config.terraform.dir.display());
    Ok(())
}

pub async fn validate(config: &Config) -> Result<()> {
    provisioning_phase(config, runner()).validate().await?;
    println!("Configuration in {} is valid", config.terraform.dir.display());
    Ok(())
}

pub async fn plan(config: &Config) -> Result<()> {
    let plan = provisioning_phase(config, runner()).plan().await?;
    println!("{}", plan.summary.trim_end());
    if plan.has_changes() {
        println!();
        println!("{} change(s). Run `keel apply` to apply them.", plan.changes.len());
    } else {
        println!("No changes.");
    }
    Ok(())
}

pub async fn apply(args: ApplyArgs, config: &Config) -> Result<()> {
    let mut gate = ConfirmationGate::interactive(args.yes);
    match provisioning_phase(config, runner()).apply(&mut gate).await? {
        ApplyOutcome::Applied { changes } if changes.is_empty() => {
            println!("No changes. Infrastructure is up to date.");
            Ok(())
        }
        ApplyOutcome::Applied { changes } => {
            println!("Applied {} change(s).", changes.len());
            Ok(())
        }
        ApplyOutcome::Aborted => Err(Error::Declined {
            phase: PhaseName::Provision,
        }),
    }
}
