//! Ansible as the configuration engine

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{host_list, ConfigurationEngine, Role};
use crate::config::AnsibleSettings;
use crate::error::PhaseName;
use crate::runner::{CommandRunner, CommandRunnerExt, CommandSpec};
use crate::target::RemoteTarget;
use crate::{Error, Result};

/// Where ansible finds its hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventorySource {
    /// INI inventory file; hosts are limited by inventory name
    File(PathBuf),
    /// Comma-separated host list built from the targets themselves
    Inline,
}

/// Configuration engine backed by `ansible-playbook`.
pub struct Ansible {
    runner: Arc<dyn CommandRunner>,
    settings: AnsibleSettings,
    inventory: InventorySource,
}

impl Ansible {
    /// Create an engine running playbooks through `runner`
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: AnsibleSettings,
        inventory: InventorySource,
    ) -> Self {
        Self {
            runner,
            settings,
            inventory,
        }
    }

    fn playbook(&self, role: Role) -> PathBuf {
        let playbooks = &self.settings.playbooks;
        let file = match role {
            Role::Common => &playbooks.common,
            Role::ControlPlane => &playbooks.control_plane,
            Role::Workers => &playbooks.workers,
            Role::Addons => &playbooks.addons,
        };
        self.settings.playbook_dir.join(file)
    }

    /// Build the `ansible-playbook` invocation for `role` on `hosts`
    pub fn command(&self, role: Role, hosts: &[RemoteTarget], check: bool) -> CommandSpec {
        let mut cmd = CommandSpec::new(self.settings.binary.clone())
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_NOCOLOR", "1");

        match &self.inventory {
            InventorySource::File(path) => {
                cmd = cmd
                    .arg("-i")
                    .arg(path.display().to_string())
                    .arg("--limit")
                    .arg(host_list(hosts));
            }
            InventorySource::Inline => {
                // trailing comma makes ansible read the value as a host list
                let addresses: Vec<String> = hosts.iter().map(inline_host).collect();
                cmd = cmd.arg("-i").arg(format!("{},", addresses.join(",")));
                if let Some(first) = hosts.first() {
                    cmd = cmd.arg("-u").arg(first.user.clone());
                    if let Some(key) = &first.identity_file {
                        cmd = cmd.arg("--private-key").arg(key.display().to_string());
                    }
                }
            }
        }

        cmd = cmd.arg(self.playbook(role).display().to_string());
        if check {
            cmd = cmd.arg("--check");
        }
        cmd
    }
}

#[async_trait]
impl ConfigurationEngine for Ansible {
    async fn run_role(&self, role: Role, hosts: &[RemoteTarget], check: bool) -> Result<()> {
        let cmd = self.command(role, hosts, check);
        debug!(command = %cmd.display(), "Running playbook");

        let output = self.runner.run(&cmd, None, None).await?;
        if output.success() {
            return Ok(());
        }

        Err(Error::step_on(
            PhaseName::Configure,
            role.as_str(),
            failed_host(&output.stdout, hosts).unwrap_or_else(|| host_list(hosts)),
            output.error_text(),
        ))
    }
}

/// Host list entry: bare address on the default port, `address:port` otherwise
fn inline_host(target: &RemoteTarget) -> String {
    match (target.port, target.address.contains(':')) {
        (22, _) => target.address.clone(),
        (port, true) => format!("[{}]:{}", target.address, port),
        (port, false) => format!("{}:{}", target.address, port),
    }
}

/// Host named in a `fatal: [host]` line of the play output, mapped back to a target name
fn failed_host(stdout: &str, hosts: &[RemoteTarget]) -> Option<String> {
    let marker = stdout
        .lines()
        .filter_map(|l| l.trim_start().strip_prefix("fatal: ["))
        .filter_map(|rest| rest.split(']').next())
        .next()?;
    hosts
        .iter()
        .find(|t| t.name == marker || t.address == marker)
        .map(|t| t.name.clone())
}
