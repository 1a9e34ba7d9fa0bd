//! Pre-flight checks for tools and credentials
//!
//! Every requirement is checked, even after one fails, so the user sees the
//! whole list of what's missing in one run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::runner::{CommandRunner, CommandRunnerExt, CommandSpec};
use crate::{Error, Result};

/// Longest a single check may run; a hung credential check counts as missing
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// How a requirement is checked.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// Program is on PATH and runs `<program> <version_arg>` successfully
    Tool {
        /// Program name
        program: String,
        /// Cheap argument that makes it exit 0
        version_arg: String,
    },
    /// File or directory exists
    Path(PathBuf),
    /// Environment variable is set and non-empty
    EnvVar(String),
    /// Command exits 0 (e.g. a credential validity check)
    Command(CommandSpec),
}

/// A named prerequisite.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    /// Name shown to the user when missing
    pub name: String,
    /// How it is checked
    pub check: Check,
}

impl Requirement {
    /// Tool checked with `--version`
    pub fn tool(program: impl Into<String>) -> Self {
        Self::tool_with(program, "--version")
    }

    /// Tool checked with a custom version argument
    pub fn tool_with(program: impl Into<String>, version_arg: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            check: Check::Tool {
                program,
                version_arg: version_arg.into(),
            },
        }
    }

    /// File or directory that must exist
    pub fn path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            check: Check::Path(path.into()),
        }
    }

    /// Environment variable that must be set
    pub fn env(var: impl Into<String>) -> Self {
        let var = var.into();
        Self {
            name: format!("${}", var),
            check: Check::EnvVar(var),
        }
    }

    /// Command that must succeed
    pub fn command(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            check: Check::Command(command),
        }
    }
}

/// Evaluates requirement lists.
pub struct PreflightChecker {
    runner: Arc<dyn CommandRunner>,
}

impl PreflightChecker {
    /// Create a checker running tool checks through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Check every requirement; `Err(Precondition)` lists all that failed.
    pub async fn check(&self, requirements: &[Requirement]) -> Result<()> {
        let mut missing = Vec::new();

        for requirement in requirements {
            if self.satisfied(requirement).await {
                debug!(requirement = %requirement.name, "Requirement satisfied");
            } else {
                warn!(requirement = %requirement.name, "Requirement missing");
                missing.push(requirement.name.clone());
            }
        }

        if missing.is_empty() {
            info!(count = requirements.len(), "Preflight checks passed");
            Ok(())
        } else {
            Err(Error::Precondition { missing })
        }
    }

    async fn satisfied(&self, requirement: &Requirement) -> bool {
        match &requirement.check {
            Check::Tool {
                program,
                version_arg,
            } => {
                let command = CommandSpec::new(program.clone()).arg(version_arg.clone());
                self.command_succeeds(&command).await
            }
            Check::Path(path) => path.exists(),
            Check::EnvVar(var) => std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false),
            Check::Command(command) => self.command_succeeds(command).await,
        }
    }

    async fn command_succeeds(&self, command: &CommandSpec) -> bool {
        // a program that cannot start counts as missing, not as a crash
        let policy = RetryPolicy::once().with_attempt_timeout(CHECK_TIMEOUT);
        match self.runner.run(command, None, Some(&policy)).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(program = %command.program, error = %e, "Check could not run");
                false
            }
        }
    }
}

fn aws_credentials() -> Requirement {
    Requirement::command(
        "valid AWS credentials (aws sts get-caller-identity)",
        CommandSpec::new("aws").args(["sts", "get-caller-identity"]),
    )
}

/// Requirements for `init`/`validate`/`plan`/`apply`/`destroy`
pub fn for_provisioning(config: &Config) -> Vec<Requirement> {
    let tf = &config.terraform;
    let mut reqs = vec![
        Requirement::tool_with(tf.binary.clone(), "version"),
        Requirement::path(
            format!("terraform directory {}", tf.dir.display()),
            tf.dir.clone(),
        ),
    ];
    if tf.check_aws_credentials {
        reqs.push(Requirement::tool("aws"));
        reqs.push(aws_credentials());
    }
    reqs
}

/// Requirements for `bootstrap`
pub fn for_bootstrap(config: &Config) -> Vec<Requirement> {
    let ansible = &config.ansible;
    let mut reqs = vec![
        Requirement::tool(ansible.binary.clone()),
        Requirement::tool_with("ssh", "-V"),
        Requirement::path(
            format!("playbook directory {}", ansible.playbook_dir.display()),
            ansible.playbook_dir.clone(),
        ),
    ];
    for playbook in [
        &ansible.playbooks.common,
        &ansible.playbooks.control_plane,
        &ansible.playbooks.workers,
        &ansible.playbooks.addons,
    ] {
        let path = ansible.playbook_dir.join(playbook);
        reqs.push(Requirement::path(
            format!("playbook {}", path.display()),
            path,
        ));
    }
    if config.targets.is_empty() {
        reqs.push(Requirement::path(
            format!("inventory {}", ansible.inventory.display()),
            ansible.inventory.clone(),
        ));
    }
    if let Some(key) = &config.ssh.identity_file {
        reqs.push(Requirement::path(
            format!("ssh identity file {}", key.display()),
            key.clone(),
        ));
    }
    reqs
}

/// Requirements for `migrate-backend`
pub fn for_backend(config: &Config) -> Vec<Requirement> {
    vec![
        Requirement::tool("aws"),
        aws_credentials(),
        Requirement::path(
            format!("local state {}", config.backend.local_state.display()),
            config.backend.local_state.clone(),
        ),
    ]
}

/// Requirements for `fix-auth`
pub fn for_auth(config: &Config) -> Vec<Requirement> {
    let mut reqs = Vec::new();
    if config.auth.vault_addr.is_none() {
        reqs.push(Requirement::env("VAULT_ADDR"));
    }
    if let Some(kubeconfig) = &config.auth.kubeconfig {
        reqs.push(Requirement::path(
            format!("kubeconfig {}", kubeconfig.display()),
            kubeconfig.clone(),
        ));
    }
    if let Some(policy) = &config.auth.policy_file {
        reqs.push(Requirement::path(
            format!("policy file {}", policy.display()),
            policy.clone(),
        ));
    }
    reqs
}
