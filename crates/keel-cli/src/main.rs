//! Keel CLI
//!
//! Provisions, bootstraps and tears down a self-hosted cluster.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keel::error::EXIT_PRECONDITION;
use keel_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version come through here too
            return if e.use_stderr() {
                ExitCode::from(EXIT_PRECONDITION as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_declined() {
                eprintln!("{}", e);
            } else {
                error!(error = %e, "Command failed");
                eprintln!("error: {}", e);
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
