//! Fix-auth command
//!
//! The credential is wrapped in a `SecretString` as soon as it is parsed and
//! is never logged or printed.

use std::fmt;
use std::sync::Arc;

use clap::Args;
use keel::auth::{AuthPlan, AuthReconciler, KubeClusterAccess, VaultClient};
use keel::config::Config;
use keel::preflight::{self, PreflightChecker};
use keel::{Error, Result};
use secrecy::SecretString;

use super::runner;

/// Fix-auth command arguments
#[derive(Args)]
pub struct FixAuthArgs {
    /// Secrets engine token with permission to manage auth methods and policies
    #[arg(env = "VAULT_TOKEN", hide_env_values = true)]
    pub credential: String,
}

impl fmt::Debug for FixAuthArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixAuthArgs")
            .field("credential", &"[REDACTED]")
            .finish()
    }
}

pub async fn run(args: FixAuthArgs, config: &Config) -> Result<()> {
    let credential = SecretString::from(args.credential);
    let auth = &config.auth;

    // check everything before the address, policy file or cluster is touched
    let checker = PreflightChecker::new(runner());
    checker.check(&preflight::for_auth(config)).await?;

    let addr = auth
        .vault_addr
        .clone()
        .ok_or_else(|| Error::Precondition {
            missing: vec!["$VAULT_ADDR".to_string()],
        })?;

    let reconciler = AuthReconciler::new(
        Arc::new(KubeClusterAccess::new(
            auth.kubeconfig.clone(),
            auth.cluster_endpoint.clone(),
        )),
        Arc::new(VaultClient::new(addr, credential)?),
        checker,
        Vec::new(),
    );

    let plan = AuthPlan::from_settings(auth)?;
    let record = reconciler.reconcile(&plan).await?;

    for (i, step) in record.steps().iter().enumerate() {
        println!("  {}. {} ok", i + 1, step.step);
    }
    println!(
        "Secrets engine trusts the cluster again (auth/{}, role {}).",
        plan.mount_path, plan.role.name
    );
    Ok(())
}
