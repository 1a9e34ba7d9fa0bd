//! Destroy command

use std::sync::Arc;

use clap::Args;
use keel::config::Config;
use keel::confirm::ConfirmationGate;
use keel::teardown::{ExternalResourceScanner, LoadBalancerScanner, TeardownOutcome, TeardownPhase};
use keel::{Error, PhaseName, Result};

use super::{provisioning_phase, runner};

/// Destroy command arguments
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Answer both confirmations automatically
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Skip the LoadBalancer scan through the cluster API
    #[arg(long)]
    pub no_scan: bool,
}

pub async fn run(args: DestroyArgs, config: &Config) -> Result<()> {
    let provisioning = Arc::new(provisioning_phase(config, runner()));
    let scanner: Option<Box<dyn ExternalResourceScanner>> = if args.no_scan {
        None
    } else {
        Some(Box::new(LoadBalancerScanner::new(
            config.teardown.kubeconfig.clone(),
        )))
    };

    let phase = TeardownPhase::new(provisioning, config.teardown.clone(), scanner);
    let mut gate = ConfirmationGate::interactive(args.yes);

    match phase.teardown(&mut gate).await? {
        TeardownOutcome::Destroyed => {
            println!("All provisioned resources destroyed.");
            Ok(())
        }
        TeardownOutcome::Aborted => Err(Error::Declined {
            phase: PhaseName::Teardown,
        }),
    }
}
