//! Keel CLI library

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel::config::Config;

pub use keel::{Error, Result};

/// Keel - provision, bootstrap and tear down a self-hosted cluster
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./keel.yaml when present)
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the provisioning engine working directory
    Init,
    /// Validate the resource definitions
    Validate,
    /// Show what apply would change
    Plan,
    /// Plan, confirm, and apply infrastructure changes
    Apply(commands::provision::ApplyArgs),
    /// Destroy all provisioned infrastructure (double confirmation)
    Destroy(commands::destroy::DestroyArgs),
    /// Wait for hosts, then run the bootstrap roles in order
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Create the remote state backend and back up local state
    MigrateBackend(commands::migrate_backend::MigrateBackendArgs),
    /// Re-establish the secrets engine's trust in the cluster
    FixAuth(commands::fix_auth::FixAuthArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        match self.command {
            Commands::Init => commands::provision::init(&config).await,
            Commands::Validate => commands::provision::validate(&config).await,
            Commands::Plan => commands::provision::plan(&config).await,
            Commands::Apply(args) => commands::provision::apply(args, &config).await,
            Commands::Destroy(args) => commands::destroy::run(args, &config).await,
            Commands::Bootstrap(args) => commands::bootstrap::run(args, &config).await,
            Commands::MigrateBackend(args) => commands::migrate_backend::run(args, &config).await,
            Commands::FixAuth(args) => commands::fix_auth::run(args, &config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_takes_yes_flag() {
        let cli = Cli::try_parse_from(["keel", "apply", "-y"]).unwrap();
        match cli.command {
            Commands::Apply(args) => assert!(args.yes),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn bootstrap_check_mode() {
        let cli = Cli::try_parse_from(["keel", "bootstrap", "--check"]).unwrap();
        assert!(matches!(cli.command, Commands::Bootstrap(ref a) if a.check));
    }

    #[test]
    fn fix_auth_takes_credential() {
        let cli = Cli::try_parse_from(["keel", "fix-auth", "hvs.example"]).unwrap();
        match cli.command {
            Commands::FixAuth(args) => {
                assert_eq!(args.credential, "hvs.example");
                assert!(!format!("{:?}", args).contains("hvs.example"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["keel", "plan", "--config", "prod.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("prod.yaml")));
    }

    #[test]
    fn unknown_subcommand_is_usage_error() {
        let err = Cli::try_parse_from(["keel", "frobnicate"]).unwrap_err();
        assert!(err.use_stderr());
    }
}
